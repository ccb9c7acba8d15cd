use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use drummond_core::{
    Bar, CycleRun, DrummondError, Interval, MetricPoint, PersistencePort, SignalOutcome,
    SignalRecord,
};

/// In-memory persistence used by tests and offline runs. Mirrors the
/// SQLite adapter's semantics: upsert bars by key, insert-only signals with
/// outcome updates, newest-first cycle runs.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    bars: BTreeMap<(String, Interval, DateTime<Utc>), Bar>,
    signals: Vec<SignalRecord>,
    cycle_runs: Vec<CycleRun>,
    metrics: Vec<MetricPoint>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle_run_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).cycle_runs.len()
    }

    pub fn signal_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).signals.len()
    }

    pub fn metric_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).metrics.len()
    }
}

#[async_trait]
impl PersistencePort for MemoryPersistence {
    async fn upsert_bars(
        &self,
        symbol: &str,
        interval: Interval,
        bars: &[Bar],
    ) -> Result<u64, DrummondError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for bar in bars {
            inner
                .bars
                .insert((symbol.to_string(), interval, bar.timestamp), *bar);
        }
        Ok(bars.len() as u64)
    }

    async fn insert_signal(&self, record: &SignalRecord) -> Result<i64, DrummondError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.signals.len() as i64 + 1;
        let mut stored = record.clone();
        stored.id = Some(id);
        inner.signals.push(stored);
        Ok(id)
    }

    async fn update_signal_outcome(
        &self,
        id: i64,
        outcome: SignalOutcome,
        actual_pnl_pct: Option<f64>,
        evaluated_at: DateTime<Utc>,
    ) -> Result<(), DrummondError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let record = inner
            .signals
            .iter_mut()
            .find(|r| r.id == Some(id))
            .ok_or_else(|| DrummondError::NotFound(format!("signal {id}")))?;
        record.outcome = outcome;
        record.actual_pnl_pct = actual_pnl_pct;
        record.evaluation_timestamp = Some(evaluated_at);
        Ok(())
    }

    async fn pending_signals(
        &self,
        emitted_before: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>, DrummondError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .signals
            .iter()
            .filter(|r| {
                r.outcome == SignalOutcome::Pending && r.signal.timestamp <= emitted_before
            })
            .cloned()
            .collect())
    }

    async fn evaluated_signals(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>, DrummondError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .signals
            .iter()
            .filter(|r| {
                r.outcome != SignalOutcome::Pending
                    && r.evaluation_timestamp.map(|t| t >= since).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn insert_cycle_run(&self, run: &CycleRun) -> Result<(), DrummondError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cycle_runs.push(run.clone());
        Ok(())
    }

    async fn recent_cycle_runs(&self, limit: u32) -> Result<Vec<CycleRun>, DrummondError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs = inner.cycle_runs.clone();
        runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn insert_metric(&self, point: &MetricPoint) -> Result<(), DrummondError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.metrics.push(point.clone());
        Ok(())
    }
}
