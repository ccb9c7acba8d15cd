use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use bar_store::{aggregate, BarStore};
use calc_cache::CalcCache;
use drummond_analysis::{MtfAlignmentView, PatternDetector, TimeframeAnalyzer};
use drummond_core::{
    CycleRun, CycleStatus, DrummondConfig, DrummondError, ExchangeCalendarPort, Interval,
    LatencyBreakdown, MarketDataPort, Pattern, PersistencePort, Signal, SignalRecord,
};
use mtf_coordinator::MtfCoordinator;
use notification_router::{retry_with_backoff, CycleMeta, NotificationRouter};
use signal_engine::SignalGenerator;

/// Bars pulled from the vendor per refresh, per interval.
const REFRESH_LOOKBACK_BARS: i64 = 200;
/// Error reasons retained on the persisted cycle run.
const MAX_RECORDED_ERRORS: usize = 10;
/// Per-call vendor timeout and bounded retry.
const VENDOR_TIMEOUT: Duration = Duration::from_secs(10);
const VENDOR_RETRY_ATTEMPTS: u32 = 3;
const VENDOR_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// External collaborators of the cycle runner.
pub struct CycleDeps {
    pub store: Arc<BarStore>,
    pub market_data: Arc<dyn MarketDataPort>,
    pub persistence: Arc<dyn PersistencePort>,
    pub calendar: Arc<dyn ExchangeCalendarPort>,
    pub router: Arc<NotificationRouter>,
}

struct SymbolOutcome {
    symbol: String,
    bars_stored: u64,
    refresh_ms: u64,
    updated: bool,
    signal: Option<Signal>,
    error: Option<String>,
}

/// Executes one analytic cycle: market-hours gate, data refresh, concurrent
/// per-symbol pipelines under a worker cap and soft deadline, signal
/// fan-out, persistence.
pub struct CycleRunner {
    config: Arc<DrummondConfig>,
    cache: Arc<CalcCache>,
    analyzer: TimeframeAnalyzer,
    detector: PatternDetector,
    coordinator: MtfCoordinator,
    generator: SignalGenerator,
    deps: CycleDeps,
    tz: Tz,
}

impl CycleRunner {
    pub fn new(config: Arc<DrummondConfig>, cache: Arc<CalcCache>, deps: CycleDeps) -> Self {
        let analyzer = TimeframeAnalyzer::new(Arc::clone(&cache), Arc::clone(&config));
        let detector = PatternDetector::new(config.pattern, config.price_scale);
        let coordinator = MtfCoordinator::new(config.coordinator);
        let generator = SignalGenerator::new(Arc::clone(&config));
        let tz: Tz = config.scheduler.timezone.parse().unwrap_or(chrono_tz::UTC);
        Self {
            config,
            cache,
            analyzer,
            detector,
            coordinator,
            generator,
            deps,
            tz,
        }
    }

    pub fn cache(&self) -> &Arc<CalcCache> {
        &self.cache
    }

    pub fn store(&self) -> &BarStore {
        &self.deps.store
    }

    pub async fn run_cycle(self: &Arc<Self>, cycle_id: String) -> CycleRun {
        self.run_cycle_at(cycle_id, Utc::now()).await
    }

    /// Run one cycle as of `now` (injectable for tests).
    pub async fn run_cycle_at(self: &Arc<Self>, cycle_id: String, now: DateTime<Utc>) -> CycleRun {
        let started = Instant::now();
        tracing::info!(cycle = %cycle_id, "cycle RUNNING");

        if self.config.scheduler.market_hours_only {
            match self.market_open(now).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(cycle = %cycle_id, "market closed, skipping cycle");
                    return self.finish(cycle_id, now, started, Vec::new(), 0, Vec::new());
                }
                Err(e) => {
                    // Calendar trouble fails open; the cycle proceeds.
                    tracing::warn!(cycle = %cycle_id, error = %e, "calendar lookup failed");
                }
            }
        }

        let deadline = started + Duration::from_secs(self.config.scheduler.cycle_deadline_s);
        let workers = cycle_workers(&self.config, self.config.symbols.len());
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut join_set: JoinSet<SymbolOutcome> = JoinSet::new();
        let mut deadline_skips: Vec<String> = Vec::new();

        for symbol in &self.config.symbols {
            // Past the soft deadline: let in-flight work finish, start
            // nothing new.
            if Instant::now() >= deadline {
                deadline_skips.push(symbol.clone());
                continue;
            }
            let this = Arc::clone(self);
            let symbol = symbol.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                this.process_symbol(&symbol, now).await
            });
        }

        let mut outcomes: Vec<SymbolOutcome> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(cycle = %cycle_id, error = %e, "symbol task panicked"),
            }
        }
        outcomes.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let refresh_and_analysis_ms = started.elapsed().as_millis() as u64;

        // Fan-out: the notify floor gates everything leaving the core.
        let signal_started = Instant::now();
        let mut signals: Vec<Signal> = outcomes
            .iter()
            .filter_map(|o| o.signal.clone())
            .filter(|s| s.confidence >= self.config.signal.min_confidence_notify)
            .collect();
        signals.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for signal in &signals {
            if let Err(e) = self
                .deps
                .persistence
                .insert_signal(&SignalRecord::new(signal.clone()))
                .await
            {
                tracing::warn!(symbol = %signal.symbol, error = %e, "failed to persist signal");
            }
        }
        let signal_ms = signal_started.elapsed().as_millis() as u64;

        let notify_started = Instant::now();
        let meta = CycleMeta {
            cycle_id: cycle_id.clone(),
            timestamp: now,
            symbols_processed: outcomes.len() as u32,
        };
        let summary = self.deps.router.fan_out(&signals, &meta).await;
        let notify_ms = notify_started.elapsed().as_millis() as u64;
        tracing::info!(
            cycle = %cycle_id,
            signals = signals.len(),
            sent = summary.total_sent(),
            dropped = summary.total_dropped(),
            failed = summary.total_failed(),
            "signals fanned out"
        );

        let mut errors: Vec<String> = outcomes
            .iter()
            .filter_map(|o| o.error.clone())
            .collect();
        errors.extend(
            deadline_skips
                .iter()
                .map(|s| format!("{s}: skipped, cycle deadline exceeded")),
        );

        let run = self
            .build_run(
                cycle_id,
                now,
                &outcomes,
                &deadline_skips,
                errors,
                LatencyBreakdown {
                    data_refresh_ms: outcomes.iter().map(|o| o.refresh_ms).sum(),
                    analysis_ms: refresh_and_analysis_ms,
                    signal_ms,
                    notify_ms,
                    total_ms: started.elapsed().as_millis() as u64,
                },
                signals.len() as u32,
            );
        tracing::info!(cycle = %run.id, status = run.status.name(), total_ms = run.latency.total_ms, "cycle finished");
        run
    }

    /// Refresh, analyze and generate for one symbol. Failures are isolated:
    /// the error is reported on the outcome, never propagated.
    async fn process_symbol(&self, symbol: &str, now: DateTime<Utc>) -> SymbolOutcome {
        match self.process_symbol_inner(symbol, now).await {
            Ok((bars_stored, refresh_ms, signal)) => SymbolOutcome {
                symbol: symbol.to_string(),
                bars_stored,
                refresh_ms,
                updated: bars_stored > 0,
                signal,
                error: None,
            },
            Err(e) => {
                tracing::warn!(symbol, error = %e, "symbol pipeline failed");
                SymbolOutcome {
                    symbol: symbol.to_string(),
                    bars_stored: 0,
                    refresh_ms: 0,
                    updated: false,
                    signal: None,
                    error: Some(format!("{symbol}: {e}")),
                }
            }
        }
    }

    async fn process_symbol_inner(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<(u64, u64, Option<Signal>), DrummondError> {
        let trading_interval = self.config.intervals.trading;
        let ltf_interval = self.config.intervals.ltf;

        let refresh_started = Instant::now();
        let mut bars_stored = 0u64;
        for interval in [trading_interval, ltf_interval] {
            bars_stored += self.refresh_interval(symbol, interval, now).await?;
        }
        let refresh_ms = refresh_started.elapsed().as_millis() as u64;

        let Some(trading_series) = self.deps.store.full_series(symbol, trading_interval) else {
            return Err(DrummondError::NotFound(format!(
                "no {trading_interval} series for {symbol}"
            )));
        };
        if trading_series.len() < 5 {
            return Ok((bars_stored, refresh_ms, None));
        }

        let trading = self.analyzer.analyze(&trading_series).await?;
        let htf_series = aggregate(&trading_series, self.config.intervals.htf, self.tz)?;
        let htf = self.analyzer.analyze(&htf_series).await?;
        let ctx = self.coordinator.coordinate(&htf, &trading);

        let ltf_trigger = self.ltf_trigger(symbol).await?;
        let view = MtfAlignmentView {
            htf_direction: htf.trend_direction(),
            htf_confidence: htf.state_confidence(),
            tf_direction: trading.trend_direction(),
            tf_confidence: trading.state_confidence(),
        };
        let patterns = self.detector.detect_all(
            trading.series.bars(),
            &trading.pldots,
            &trading.envelopes,
            &ctx.confluence_zones,
            Some(view),
            ltf_trigger.as_ref(),
        );

        let signal = self
            .generator
            .generate(symbol, &trading, &ctx, &patterns, None)?;
        Ok((bars_stored, refresh_ms, signal))
    }

    /// Magnet or bounce on the lower timeframe, used as the MTF trigger.
    async fn ltf_trigger(&self, symbol: &str) -> Result<Option<Pattern>, DrummondError> {
        let Some(series) = self
            .deps
            .store
            .full_series(symbol, self.config.intervals.ltf)
        else {
            return Ok(None);
        };
        if series.len() < 5 {
            return Ok(None);
        }
        let analysis = self.analyzer.analyze(&series).await?;
        let magnet = self.detector.detect_magnet(
            analysis.series.bars(),
            &analysis.pldots,
            &analysis.envelopes,
            &[],
        );
        let bounce = self
            .detector
            .detect_envelope_bounce(analysis.series.bars(), &analysis.envelopes);
        Ok([magnet, bounce]
            .into_iter()
            .flatten()
            .max_by(|a, b| {
                a.strength
                    .partial_cmp(&b.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }))
    }

    async fn refresh_interval(
        &self,
        symbol: &str,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<u64, DrummondError> {
        let from = now - interval.duration() * REFRESH_LOOKBACK_BARS as i32;
        let records = retry_with_backoff(VENDOR_RETRY_ATTEMPTS, VENDOR_RETRY_BASE_DELAY, |_| async {
            match tokio::time::timeout(
                VENDOR_TIMEOUT,
                self.deps.market_data.fetch_bars(symbol, interval, from, now),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DrummondError::Timeout(format!(
                    "fetching {interval} bars for {symbol}"
                ))),
            }
        })
        .await?;
        if records.is_empty() {
            return Ok(0);
        }
        let outcome = self.deps.store.append(symbol, interval, records);
        let stored = outcome.stored() as u64;
        if stored > 0 {
            // New bars invalidate every cached artifact for the pair.
            self.cache.invalidate_series(symbol, interval);
            if let Some(series) = self.deps.store.full_series(symbol, interval) {
                let tail = series.bars().len().saturating_sub(stored as usize);
                self.deps
                    .persistence
                    .upsert_bars(symbol, interval, &series.bars()[tail..])
                    .await?;
            }
        }
        Ok(stored)
    }

    async fn market_open(&self, now: DateTime<Utc>) -> Result<bool, DrummondError> {
        let local = now.with_timezone(&self.tz);
        let session = self
            .deps
            .calendar
            .session(&self.config.scheduler.exchange, local.date_naive())
            .await?;
        if !session.is_trading_day {
            return Ok(false);
        }
        let (Some(open), Some(close)) = (session.open, session.close) else {
            return Ok(false);
        };
        let time = local.time();
        Ok(time >= open && time < close)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        cycle_id: String,
        now: DateTime<Utc>,
        started: Instant,
        outcomes: Vec<SymbolOutcome>,
        signals: u32,
        errors: Vec<String>,
    ) -> CycleRun {
        self.build_run(
            cycle_id,
            now,
            &outcomes,
            &[],
            errors,
            LatencyBreakdown {
                total_ms: started.elapsed().as_millis() as u64,
                ..LatencyBreakdown::default()
            },
            signals,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_run(
        &self,
        cycle_id: String,
        now: DateTime<Utc>,
        outcomes: &[SymbolOutcome],
        deadline_skips: &[String],
        mut errors: Vec<String>,
        latency: LatencyBreakdown,
        signals_generated: u32,
    ) -> CycleRun {
        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        let status = if !outcomes.is_empty() && failed == outcomes.len() {
            CycleStatus::Failed
        } else if failed > 0 || !deadline_skips.is_empty() {
            CycleStatus::Partial
        } else {
            CycleStatus::Completed
        };
        errors.truncate(MAX_RECORDED_ERRORS);

        // The run record is persisted by the performance tracker, not here.
        CycleRun {
            id: cycle_id,
            timestamp: now,
            status,
            symbols_processed: outcomes.len() as u32,
            symbols_updated: outcomes.iter().filter(|o| o.updated).count() as u32,
            signals_generated,
            bars_stored: outcomes.iter().map(|o| o.bars_stored).sum(),
            latency,
            errors,
        }
    }
}

/// Worker pool size: min(cpu count, symbols, configured cap).
fn cycle_workers(config: &DrummondConfig, symbols: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cpus.min(symbols.max(1)).min(config.scheduler.worker_cap)
}
