use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use drummond_core::{BarRecord, DrummondError, Interval, MarketDataPort};

/// File-backed market data for offline and replay operation. One CSV per
/// (symbol, interval) named `SYMBOL_INTERVAL.csv` (e.g. `AAPL_30m.csv`)
/// with columns timestamp,open,high,low,close,volume; timestamps RFC3339.
pub struct CsvBarSource {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CsvBar {
    timestamp: DateTime<Utc>,
    open: Option<Decimal>,
    high: Option<Decimal>,
    low: Option<Decimal>,
    close: Option<Decimal>,
    volume: Option<u64>,
}

impl CsvBarSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.dir.join(format!("{symbol}_{}.csv", interval.name()))
    }
}

#[async_trait]
impl MarketDataPort for CsvBarSource {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BarRecord>, DrummondError> {
        let path = self.path_for(symbol, interval);
        if !path.exists() {
            tracing::debug!(symbol, interval = %interval, path = %path.display(), "no csv file");
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path).map_err(|e| {
            DrummondError::Unavailable(format!("{}: {e}", path.display()))
        })?;

        let mut records = Vec::new();
        for row in reader.deserialize::<CsvBar>() {
            // Unparseable rows surface as skipped records downstream, not
            // as a batch failure.
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(symbol, error = %e, "skipping malformed csv row");
                    continue;
                }
            };
            if row.timestamp < from || row.timestamp > to {
                continue;
            }
            records.push(BarRecord {
                symbol: symbol.to_string(),
                timestamp: row.timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}
