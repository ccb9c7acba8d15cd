use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::artifacts::Signal;
use crate::error::DrummondError;
use crate::types::{Bar, Interval, RejectReason};

/// A raw vendor bar record. OHLC fields are optional because vendors do
/// drop fields; records missing any of them are skipped with a reason, the
/// core never infers missing prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarRecord {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<u64>,
}

impl BarRecord {
    pub fn into_bar(self) -> Result<Bar, RejectReason> {
        let bar = Bar {
            timestamp: self.timestamp,
            open: self.open.ok_or(RejectReason::MissingField("open"))?,
            high: self.high.ok_or(RejectReason::MissingField("high"))?,
            low: self.low.ok_or(RejectReason::MissingField("low"))?,
            close: self.close.ok_or(RejectReason::MissingField("close"))?,
            volume: self.volume.unwrap_or(0),
        };
        bar.validate()?;
        Ok(bar)
    }
}

/// Pull-based market data vendor. Streaming updates are represented by
/// repeated pulls over the open interval.
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BarRecord>, DrummondError>;
}

/// Outcome of an emitted signal once its evaluation window has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalOutcome {
    Pending,
    Win,
    Loss,
    Neutral,
}

impl SignalOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            SignalOutcome::Pending => "PENDING",
            SignalOutcome::Win => "WIN",
            SignalOutcome::Loss => "LOSS",
            SignalOutcome::Neutral => "NEUTRAL",
        }
    }

    pub fn parse(s: &str) -> Option<SignalOutcome> {
        match s {
            "PENDING" => Some(SignalOutcome::Pending),
            "WIN" => Some(SignalOutcome::Win),
            "LOSS" => Some(SignalOutcome::Loss),
            "NEUTRAL" => Some(SignalOutcome::Neutral),
            _ => None,
        }
    }
}

/// A persisted signal plus its evaluation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: Option<i64>,
    pub signal: Signal,
    pub outcome: SignalOutcome,
    pub actual_pnl_pct: Option<f64>,
    pub evaluation_timestamp: Option<DateTime<Utc>>,
}

impl SignalRecord {
    pub fn new(signal: Signal) -> Self {
        Self {
            id: None,
            signal,
            outcome: SignalOutcome::Pending,
            actual_pnl_pct: None,
            evaluation_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Completed,
    Partial,
    Failed,
}

impl CycleStatus {
    pub fn name(&self) -> &'static str {
        match self {
            CycleStatus::Completed => "COMPLETED",
            CycleStatus::Partial => "PARTIAL",
            CycleStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<CycleStatus> {
        match s {
            "COMPLETED" => Some(CycleStatus::Completed),
            "PARTIAL" => Some(CycleStatus::Partial),
            "FAILED" => Some(CycleStatus::Failed),
            _ => None,
        }
    }
}

/// Per-phase latency of one scheduler cycle, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyBreakdown {
    pub data_refresh_ms: u64,
    pub analysis_ms: u64,
    pub signal_ms: u64,
    pub notify_ms: u64,
    pub total_ms: u64,
}

/// Persisted record of one scheduler cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRun {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub status: CycleStatus,
    pub symbols_processed: u32,
    pub symbols_updated: u32,
    pub signals_generated: u32,
    pub bars_stored: u64,
    pub latency: LatencyBreakdown,
    /// First N error reasons; the full stream goes to the log.
    pub errors: Vec<String>,
}

/// A single named measurement retained by the performance tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
}

/// Typed append-only persistence. The core never composes SQL; adapters
/// translate these operations to their backing store.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Upsert by (symbol, interval, timestamp). Returns rows written.
    async fn upsert_bars(
        &self,
        symbol: &str,
        interval: Interval,
        bars: &[Bar],
    ) -> Result<u64, DrummondError>;

    /// Insert-only. Returns the record id.
    async fn insert_signal(&self, record: &SignalRecord) -> Result<i64, DrummondError>;

    async fn update_signal_outcome(
        &self,
        id: i64,
        outcome: SignalOutcome,
        actual_pnl_pct: Option<f64>,
        evaluated_at: DateTime<Utc>,
    ) -> Result<(), DrummondError>;

    /// Signals still PENDING that were emitted at or before `emitted_before`.
    async fn pending_signals(
        &self,
        emitted_before: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>, DrummondError>;

    /// Signals with a settled outcome, evaluated at or after `since`.
    async fn evaluated_signals(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>, DrummondError>;

    async fn insert_cycle_run(&self, run: &CycleRun) -> Result<(), DrummondError>;

    /// Most recent cycle runs, newest first.
    async fn recent_cycle_runs(&self, limit: u32) -> Result<Vec<CycleRun>, DrummondError>;

    async fn insert_metric(&self, point: &MetricPoint) -> Result<(), DrummondError>;
}

/// One exchange trading session as reported by the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSession {
    pub is_trading_day: bool,
    /// Session open/close in the exchange's local timezone.
    pub open: Option<NaiveTime>,
    pub close: Option<NaiveTime>,
    pub half_day: bool,
}

impl TradingSession {
    pub fn closed() -> Self {
        Self {
            is_trading_day: false,
            open: None,
            close: None,
            half_day: false,
        }
    }
}

#[async_trait]
pub trait ExchangeCalendarPort: Send + Sync {
    async fn session(
        &self,
        exchange: &str,
        date: NaiveDate,
    ) -> Result<TradingSession, DrummondError>;
}
