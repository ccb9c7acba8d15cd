use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DrummondError;

/// Bar intervals recognized by the pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Interval {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour4,
    Day1,
    Week1,
}

impl Interval {
    pub fn minutes(&self) -> i64 {
        match self {
            Interval::Min1 => 1,
            Interval::Min5 => 5,
            Interval::Min15 => 15,
            Interval::Min30 => 30,
            Interval::Hour1 => 60,
            Interval::Hour4 => 240,
            Interval::Day1 => 1440,
            Interval::Week1 => 10080,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Short name used in cache keys, config values and persisted rows.
    pub fn name(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
            Interval::Week1 => "1w",
        }
    }

    pub fn parse(s: &str) -> Option<Interval> {
        match s {
            "1m" => Some(Interval::Min1),
            "5m" => Some(Interval::Min5),
            "15m" => Some(Interval::Min15),
            "30m" => Some(Interval::Min30),
            "1h" => Some(Interval::Hour1),
            "4h" => Some(Interval::Hour4),
            "1d" => Some(Interval::Day1),
            "1w" => Some(Interval::Week1),
            _ => None,
        }
    }

    pub fn all() -> [Interval; 8] {
        [
            Interval::Min1,
            Interval::Min5,
            Interval::Min15,
            Interval::Min30,
            Interval::Hour1,
            Interval::Hour4,
            Interval::Day1,
            Interval::Week1,
        ]
    }

    /// Start of the bucket containing `ts`, computed in the exchange
    /// timezone. Intraday intervals floor the minutes-from-midnight; daily
    /// buckets start at local midnight; weekly buckets start Monday.
    pub fn bucket_start(&self, ts: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = ts.with_timezone(&tz);
        let naive = match self {
            Interval::Day1 => local.date_naive().and_time(NaiveTime::MIN),
            Interval::Week1 => {
                let days_back = local.weekday().num_days_from_monday() as i64;
                (local.date_naive() - Duration::days(days_back)).and_time(NaiveTime::MIN)
            }
            _ => {
                let mins = local.num_seconds_from_midnight() as i64 / 60;
                let floored = mins - mins % self.minutes();
                local.date_naive().and_time(NaiveTime::MIN) + Duration::minutes(floored)
            }
        };
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(ts)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an ingested bar record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum RejectReason {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("non-positive price")]
    NonPositivePrice,
    #[error("high below low")]
    HighBelowLow,
    #[error("open outside high/low range")]
    OpenOutsideRange,
    #[error("close outside high/low range")]
    CloseOutsideRange,
    #[error("duplicate timestamp")]
    DuplicateTimestamp,
    #[error("non-monotonic timestamp")]
    NonMonotonicTimestamp,
}

/// A single OHLCV bar. Symbol and interval are carried by the owning
/// [`BarSeries`]; a bar is immutable once appended to a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

impl Bar {
    /// Check the price-ordering invariants: low <= open,close <= high and
    /// all prices positive.
    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.low <= Decimal::ZERO {
            return Err(RejectReason::NonPositivePrice);
        }
        if self.high < self.low {
            return Err(RejectReason::HighBelowLow);
        }
        if self.open < self.low || self.open > self.high {
            return Err(RejectReason::OpenOutsideRange);
        }
        if self.close < self.low || self.close > self.high {
            return Err(RejectReason::CloseOutsideRange);
        }
        Ok(())
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Result of upserting one bar into a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    Unchanged,
}

/// An ordered, strictly-increasing-by-timestamp sequence of bars for one
/// (symbol, interval). Gaps are allowed and meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    symbol: String,
    interval: Interval,
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            bars: Vec::new(),
        }
    }

    /// Build a series from bars that must already be strictly increasing by
    /// timestamp.
    pub fn from_bars(
        symbol: impl Into<String>,
        interval: Interval,
        bars: Vec<Bar>,
    ) -> Result<Self, DrummondError> {
        for pair in bars.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(DrummondError::InvalidInput(format!(
                    "bars not strictly increasing at {}",
                    pair[1].timestamp
                )));
            }
        }
        Ok(Self {
            symbol: symbol.into(),
            interval,
            bars,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// Insert or replace by timestamp, keeping the ordering invariant.
    pub fn upsert(&mut self, bar: Bar) -> Upsert {
        let idx = self
            .bars
            .partition_point(|b| b.timestamp < bar.timestamp);
        if idx < self.bars.len() && self.bars[idx].timestamp == bar.timestamp {
            if self.bars[idx] == bar {
                Upsert::Unchanged
            } else {
                self.bars[idx] = bar;
                Upsert::Replaced
            }
        } else {
            self.bars.insert(idx, bar);
            Upsert::Inserted
        }
    }

    /// Bars with `from <= timestamp <= to`.
    pub fn window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> &[Bar] {
        let start = self.bars.partition_point(|b| b.timestamp < from);
        let end = self.bars.partition_point(|b| b.timestamp <= to);
        &self.bars[start..end]
    }

    /// Bars with `timestamp <= to`.
    pub fn up_to(&self, to: DateTime<Utc>) -> &[Bar] {
        let end = self.bars.partition_point(|b| b.timestamp <= to);
        &self.bars[..end]
    }

    /// A sub-series over the same symbol/interval.
    pub fn slice(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BarSeries {
        BarSeries {
            symbol: self.symbol.clone(),
            interval: self.interval,
            bars: self.window(from, to).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(ts_min: i64, close: Decimal) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
                + Duration::minutes(ts_min),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: 100,
        }
    }

    #[test]
    fn interval_roundtrip() {
        for iv in Interval::all() {
            assert_eq!(Interval::parse(iv.name()), Some(iv));
        }
        assert_eq!(Interval::parse("3m"), None);
    }

    #[test]
    fn bucket_start_intraday() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 14:37 UTC = 09:37 New York (EST offset -5 on 2024-12-02)
        let ts = Utc.with_ymd_and_hms(2024, 12, 2, 14, 37, 0).unwrap();
        let start = Interval::Min30.bucket_start(ts, tz);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 2, 14, 30, 0).unwrap());
    }

    #[test]
    fn bucket_start_weekly_is_monday() {
        let tz: Tz = "UTC".parse().unwrap();
        let thursday = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        let start = Interval::Week1.bucket_start(thursday, tz);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn bar_invariants() {
        let mut b = bar(0, dec!(100));
        assert!(b.validate().is_ok());
        b.low = dec!(150);
        assert_eq!(b.validate(), Err(RejectReason::HighBelowLow));
        let mut b = bar(0, dec!(100));
        b.close = dec!(200);
        assert_eq!(b.validate(), Err(RejectReason::CloseOutsideRange));
    }

    #[test]
    fn series_upsert_orders_and_dedupes() {
        let mut series = BarSeries::new("AAPL", Interval::Min30);
        assert_eq!(series.upsert(bar(30, dec!(101))), Upsert::Inserted);
        assert_eq!(series.upsert(bar(0, dec!(100))), Upsert::Inserted);
        assert_eq!(series.upsert(bar(30, dec!(101))), Upsert::Unchanged);
        assert_eq!(series.upsert(bar(30, dec!(102))), Upsert::Replaced);
        let closes: Vec<Decimal> = series.bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![dec!(100), dec!(102)]);
    }

    #[test]
    fn series_window_is_inclusive() {
        let mut series = BarSeries::new("AAPL", Interval::Min30);
        for i in 0..5 {
            series.upsert(bar(i * 30, dec!(100) + Decimal::from(i)));
        }
        let from = series.bars()[1].timestamp;
        let to = series.bars()[3].timestamp;
        assert_eq!(series.window(from, to).len(), 3);
    }
}
