//! Canonical in-memory bar store: validated upsert ingestion, strictly
//! ordered series, window queries and interval aggregation.

pub mod aggregate;

pub use aggregate::aggregate;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use drummond_core::{
    Bar, BarRecord, BarSeries, DrummondError, Interval, RejectReason, Upsert,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    symbol: String,
    interval: Interval,
}

/// One skipped record and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkippedBar {
    pub timestamp: DateTime<Utc>,
    pub reason: RejectReason,
}

/// Result of an append batch. Malformed records never abort the batch;
/// they are skipped and counted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppendOutcome {
    pub accepted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub skipped: Vec<SkippedBar>,
}

impl AppendOutcome {
    /// Bars that changed the stored series.
    pub fn stored(&self) -> usize {
        self.accepted + self.replaced
    }
}

/// Read-mostly store of bar series keyed by (symbol, interval). Writers are
/// serialized per key through the map's entry API.
#[derive(Default)]
pub struct BarStore {
    series: DashMap<SeriesKey, BarSeries>,
}

impl BarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and upsert a batch of vendor records for one series.
    pub fn append(
        &self,
        symbol: &str,
        interval: Interval,
        records: Vec<BarRecord>,
    ) -> AppendOutcome {
        let bars: Vec<Result<Bar, (DateTime<Utc>, RejectReason)>> = records
            .into_iter()
            .map(|record| {
                let ts = record.timestamp;
                record.into_bar().map_err(|reason| (ts, reason))
            })
            .collect();

        let key = SeriesKey {
            symbol: symbol.to_string(),
            interval,
        };
        let mut outcome = AppendOutcome::default();
        let mut entry = self
            .series
            .entry(key)
            .or_insert_with(|| BarSeries::new(symbol, interval));

        for bar in bars {
            match bar {
                Ok(bar) => match entry.upsert(bar) {
                    Upsert::Inserted => outcome.accepted += 1,
                    Upsert::Replaced => outcome.replaced += 1,
                    Upsert::Unchanged => outcome.unchanged += 1,
                },
                Err((timestamp, reason)) => {
                    outcome.skipped.push(SkippedBar { timestamp, reason })
                }
            }
        }

        if !outcome.skipped.is_empty() {
            tracing::warn!(
                symbol,
                interval = %interval,
                skipped = outcome.skipped.len(),
                "rejected malformed bar records"
            );
        }
        outcome
    }

    /// Upsert already-validated bars (backtest loading path). Bars failing
    /// the invariants are still skipped and counted.
    pub fn append_bars(&self, symbol: &str, interval: Interval, bars: Vec<Bar>) -> AppendOutcome {
        let records = bars
            .into_iter()
            .map(|b| BarRecord {
                symbol: symbol.to_string(),
                timestamp: b.timestamp,
                open: Some(b.open),
                high: Some(b.high),
                low: Some(b.low),
                close: Some(b.close),
                volume: Some(b.volume),
            })
            .collect();
        self.append(symbol, interval, records)
    }

    /// Bars in `[from, to]`, strictly time-ordered. `NotFound` when the
    /// series is unknown or has no data in range.
    pub fn get_bars(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarSeries, DrummondError> {
        let key = SeriesKey {
            symbol: symbol.to_string(),
            interval,
        };
        let series = self.series.get(&key).ok_or_else(|| {
            DrummondError::NotFound(format!("no {interval} series for {symbol}"))
        })?;
        let window = series.slice(from, to);
        if window.is_empty() {
            return Err(DrummondError::NotFound(format!(
                "no {interval} bars for {symbol} in [{from}, {to}]"
            )));
        }
        Ok(window)
    }

    /// Full series clone, or `None` when unknown.
    pub fn full_series(&self, symbol: &str, interval: Interval) -> Option<BarSeries> {
        let key = SeriesKey {
            symbol: symbol.to_string(),
            interval,
        };
        self.series.get(&key).map(|s| s.clone())
    }

    pub fn latest(&self, symbol: &str, interval: Interval) -> Option<Bar> {
        let key = SeriesKey {
            symbol: symbol.to_string(),
            interval,
        };
        self.series.get(&key).and_then(|s| s.last().copied())
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Symbols with at least one series loaded.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .series
            .iter()
            .map(|e| e.key().symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}
