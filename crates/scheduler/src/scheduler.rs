use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::watch;

use drummond_core::{DrummondConfig, DrummondError};

use crate::calibration::OutcomeEvaluator;
use crate::cycle::CycleRunner;
use crate::perf::PerformanceTracker;

/// Cron-driven loop around the cycle runner. Cycles never overlap: a run
/// that overshoots its slot skips the missed fires with a warning.
pub struct Scheduler {
    config: Arc<DrummondConfig>,
    runner: Arc<CycleRunner>,
    tracker: PerformanceTracker,
    evaluator: OutcomeEvaluator,
    schedule: Schedule,
    tz: Tz,
}

impl Scheduler {
    pub fn new(
        config: Arc<DrummondConfig>,
        runner: Arc<CycleRunner>,
        tracker: PerformanceTracker,
        evaluator: OutcomeEvaluator,
    ) -> Result<Self, DrummondError> {
        let schedule = parse_cron(&config.scheduler.cron)?;
        let tz: Tz = config
            .scheduler
            .timezone
            .parse()
            .map_err(|_| {
                DrummondError::InvalidInput(format!(
                    "unknown timezone {:?}",
                    config.scheduler.timezone
                ))
            })?;
        Ok(Self {
            config,
            runner,
            tracker,
            evaluator,
            schedule,
            tz,
        })
    }

    /// Next fire time strictly after `now`, in UTC.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Run until `shutdown` flips to true. Each fire executes one cycle,
    /// records performance, and settles due signal outcomes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            cron = %self.config.scheduler.cron,
            timezone = %self.config.scheduler.timezone,
            symbols = self.config.symbols.len(),
            "scheduler started"
        );
        loop {
            let now = Utc::now();
            let Some(next) = self.next_fire(now) else {
                tracing::error!("cron expression yields no future fire, stopping");
                return;
            };
            let wait = (next - now)
                .to_std()
                .unwrap_or_else(|_| Duration::from_secs(0));
            tracing::debug!(next = %next, "sleeping until next cycle");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("scheduler shutting down");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                tracing::info!("scheduler shutting down");
                return;
            }

            self.run_once().await;

            // Anything missed while the cycle ran is skipped, not queued.
            let after = Utc::now();
            if let Some(first_missed) = self.next_fire(next) {
                if first_missed < after {
                    tracing::warn!(
                        missed = %first_missed,
                        "cycle overran its slot, skipping missed fires"
                    );
                }
            }
        }
    }

    /// One scheduled tick: cycle, performance record, outcome evaluation.
    pub async fn run_once(&self) {
        let now = Utc::now();
        let cycle_id = format!("cycle-{}", now.timestamp_millis());
        let run = self.runner.run_cycle(cycle_id).await;

        if let Err(e) = self.tracker.record_cycle(&run).await {
            tracing::warn!(cycle = %run.id, error = %e, "failed to record cycle metrics");
        }
        match self.tracker.sla_compliant().await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("scheduler is out of SLA"),
            Err(e) => tracing::warn!(error = %e, "SLA check failed"),
        }

        match self
            .evaluator
            .evaluate_pending(self.runner.store(), Utc::now())
            .await
        {
            Ok(settled) if settled > 0 => {
                match self.evaluator.report(now - chrono::Duration::days(7)).await {
                    Ok(report) => tracing::info!(
                        evaluated = report.evaluated,
                        buckets = report.by_confidence.len(),
                        "calibration report refreshed"
                    ),
                    Err(e) => tracing::warn!(error = %e, "calibration report failed"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "outcome evaluation failed"),
        }
    }
}

/// Accept the five-field cron form by prepending a seconds column.
fn parse_cron(expression: &str) -> Result<Schedule, DrummondError> {
    let fields = expression.split_whitespace().count();
    let full = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&full)
        .map_err(|e| DrummondError::InvalidInput(format!("cron {expression:?}: {e}")))
}
