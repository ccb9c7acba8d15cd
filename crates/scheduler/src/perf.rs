use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use drummond_core::{CycleRun, CycleStatus, DrummondError, MetricPoint, PersistencePort, SchedulerConfig};

/// Rolling latency/error/uptime statistics over recent cycle runs.
#[derive(Debug, Clone, Serialize)]
pub struct PerfStats {
    pub cycles: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub error_rate: f64,
    pub uptime: f64,
}

/// Retains cycle metrics through the persistence port and reports SLA
/// compliance against the configured thresholds.
pub struct PerformanceTracker {
    persistence: Arc<dyn PersistencePort>,
    config: SchedulerConfig,
}

impl PerformanceTracker {
    pub fn new(persistence: Arc<dyn PersistencePort>, config: SchedulerConfig) -> Self {
        Self {
            persistence,
            config,
        }
    }

    pub async fn record_cycle(&self, run: &CycleRun) -> Result<(), DrummondError> {
        self.persistence.insert_cycle_run(run).await?;
        self.persistence
            .insert_metric(&MetricPoint {
                timestamp: Utc::now(),
                name: "cycle_latency_ms".to_string(),
                value: run.latency.total_ms as f64,
            })
            .await?;
        Ok(())
    }

    pub async fn rolling_stats(&self) -> Result<PerfStats, DrummondError> {
        let runs = self
            .persistence
            .recent_cycle_runs(self.config.lookback_runs)
            .await?;
        Ok(stats_over(&runs))
    }

    /// SLA: P95 latency, error rate and uptime against configured bounds.
    /// An empty window is compliant by definition.
    pub async fn sla_compliant(&self) -> Result<bool, DrummondError> {
        let stats = self.rolling_stats().await?;
        if stats.cycles == 0 {
            return Ok(true);
        }
        let sla = &self.config.sla;
        Ok(stats.p95_ms <= sla.p95_ms
            && stats.error_rate <= sla.max_error_rate
            && stats.uptime >= sla.min_uptime)
    }
}

fn stats_over(runs: &[CycleRun]) -> PerfStats {
    if runs.is_empty() {
        return PerfStats {
            cycles: 0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            error_rate: 0.0,
            uptime: 1.0,
        };
    }
    let mut latencies: Vec<u64> = runs.iter().map(|r| r.latency.total_ms).collect();
    latencies.sort_unstable();
    let failed = runs
        .iter()
        .filter(|r| r.status == CycleStatus::Failed)
        .count();
    PerfStats {
        cycles: runs.len(),
        p50_ms: percentile(&latencies, 0.50),
        p95_ms: percentile(&latencies, 0.95),
        p99_ms: percentile(&latencies, 0.99),
        error_rate: failed as f64 / runs.len() as f64,
        uptime: (runs.len() - failed) as f64 / runs.len() as f64,
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use drummond_core::LatencyBreakdown;
    use persistence::MemoryPersistence;

    fn run(i: i64, total_ms: u64, status: CycleStatus) -> CycleRun {
        CycleRun {
            id: format!("cycle-{i}"),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap()
                + Duration::minutes(15 * i),
            status,
            symbols_processed: 3,
            symbols_updated: 3,
            signals_generated: 1,
            bars_stored: 9,
            latency: LatencyBreakdown {
                total_ms,
                ..LatencyBreakdown::default()
            },
            errors: vec![],
        }
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 0.50), 50);
        assert_eq!(percentile(&sorted, 0.95), 95);
        assert_eq!(percentile(&sorted, 0.99), 99);
        assert_eq!(percentile(&[42], 0.95), 42);
    }

    #[tokio::test]
    async fn sla_fails_on_slow_p95() {
        let persistence = Arc::new(MemoryPersistence::new());
        let tracker = PerformanceTracker::new(persistence, SchedulerConfig::default());
        for i in 0..20 {
            tracker
                .record_cycle(&run(i, 70_000, CycleStatus::Completed))
                .await
                .unwrap();
        }
        let stats = tracker.rolling_stats().await.unwrap();
        assert_eq!(stats.cycles, 20);
        assert_eq!(stats.p95_ms, 70_000);
        assert!(!tracker.sla_compliant().await.unwrap());
    }

    #[tokio::test]
    async fn sla_holds_for_fast_error_free_cycles() {
        let persistence = Arc::new(MemoryPersistence::new());
        let tracker = PerformanceTracker::new(persistence, SchedulerConfig::default());
        for i in 0..20 {
            tracker
                .record_cycle(&run(i, 500, CycleStatus::Completed))
                .await
                .unwrap();
        }
        assert!(tracker.sla_compliant().await.unwrap());
    }

    #[tokio::test]
    async fn failures_break_error_rate_and_uptime() {
        let persistence = Arc::new(MemoryPersistence::new());
        let tracker = PerformanceTracker::new(persistence, SchedulerConfig::default());
        for i in 0..10 {
            let status = if i == 0 {
                CycleStatus::Failed
            } else {
                CycleStatus::Completed
            };
            tracker.record_cycle(&run(i, 500, status)).await.unwrap();
        }
        let stats = tracker.rolling_stats().await.unwrap();
        assert!((stats.error_rate - 0.1).abs() < 1e-9);
        assert!((stats.uptime - 0.9).abs() < 1e-9);
        assert!(!tracker.sla_compliant().await.unwrap());
    }
}
