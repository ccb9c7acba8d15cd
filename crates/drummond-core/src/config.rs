use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;

use crate::error::DrummondError;
use crate::types::Interval;

/// Full configuration surface. Every field has a validated default; the
/// agent overrides from `DRUMMOND_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrummondConfig {
    /// Symbol universe analyzed each cycle.
    pub symbols: Vec<String>,
    /// Fixed-point fractional digits for every computed price.
    pub price_scale: u32,
    pub intervals: IntervalConfig,
    pub pldot: PldotConfig,
    pub envelope: EnvelopeConfig,
    pub lines: LineConfig,
    pub state: StateConfig,
    pub pattern: PatternConfig,
    pub coordinator: CoordinatorConfig,
    pub signal: SignalConfig,
    pub portfolio: PortfolioConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub equity_sampler: SamplerConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Analytic and execution timeframe.
    pub trading: Interval,
    /// Higher-timeframe context.
    pub htf: Interval,
    /// Lower timeframe used for trigger refinement.
    pub ltf: Interval,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            trading: Interval::Min30,
            htf: Interval::Day1,
            ltf: Interval::Min5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PldotConfig {
    /// Bars the dot is projected forward.
    pub displacement: u32,
    /// Largest tolerated gap between window bars, in intervals.
    pub max_gap_intervals: u32,
}

impl Default for PldotConfig {
    fn default() -> Self {
        Self {
            displacement: 1,
            max_gap_intervals: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    pub period: usize,
    pub multiplier: f64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            period: 3,
            multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineConfig {
    /// Bars on each side a swing extreme must dominate.
    pub swing_lookback: usize,
    /// Bars a line projects forward at full strength.
    pub projection_gap: usize,
    /// Half-life, in bars, of line strength past the projection gap.
    pub strength_half_life: f64,
    /// Merge tolerance as a fraction of the projection price.
    pub zone_tolerance_pct: Decimal,
    pub max_zone_strength: f64,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            swing_lookback: 3,
            projection_gap: 5,
            strength_half_life: 10.0,
            zone_tolerance_pct: Decimal::new(5, 3), // 0.5%
            max_zone_strength: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateConfig {
    /// Relative slope magnitude below which the PLdot counts as horizontal.
    pub slope_epsilon: f64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            slope_epsilon: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Prior-bar distance required before a magnet can trigger.
    pub magnet_trigger_pct: Decimal,
    /// How close the current close must land to the PLdot.
    pub magnet_proximity_pct: Decimal,
    pub magnet_stop_buffer_pct: Decimal,
    /// Close-to-envelope tolerance for a bounce.
    pub bounce_tolerance_pct: Decimal,
    /// Max penetration beyond a zone boundary, as a fraction of zone width.
    pub breakout_max_penetration_ratio: Decimal,
    pub breakout_volume_ratio: f64,
    pub breakout_min_zone_strength: f64,
    pub range_slope_epsilon: f64,
    pub range_touch_window: usize,
    pub range_min_touches: usize,
    /// Rolling window for mean-volume comparisons.
    pub volume_window: usize,
    pub min_rr: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            magnet_trigger_pct: Decimal::new(5, 3),      // 0.5%
            magnet_proximity_pct: Decimal::new(5, 3),    // 0.5%
            magnet_stop_buffer_pct: Decimal::new(2, 3),  // 0.2%
            bounce_tolerance_pct: Decimal::new(1, 3),    // 0.1%
            breakout_max_penetration_ratio: Decimal::new(1, 1), // 0.1
            breakout_volume_ratio: 1.5,
            breakout_min_zone_strength: 0.6,
            range_slope_epsilon: 1e-4,
            range_touch_window: 20,
            range_min_touches: 4,
            volume_window: 20,
            min_rr: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Minimum overlap, as a fraction of the trading-TF zone width.
    pub overlap_ratio: f64,
    /// Distance tolerance for "nearest zone" lookups, as a price fraction.
    pub tolerance_pct: Decimal,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            overlap_ratio: 0.5,
            tolerance_pct: Decimal::new(2, 3), // 0.2%
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalConfig {
    pub min_confidence_notify: f64,
    pub min_confidence_act: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_confidence_notify: 0.5,
            min_confidence_act: 0.65,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    pub initial_capital: Decimal,
    pub risk_per_trade_pct: f64,
    pub max_positions: usize,
    pub max_total_risk_pct: f64,
    /// Max concurrent positions per sector; 0 disables the cap.
    pub max_per_sector: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::new(100_000, 0),
            risk_per_trade_pct: 0.02,
            max_positions: 20,
            max_total_risk_pct: 0.10,
            max_per_sector: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub commission_pct: f64,
    pub slippage_bps: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            commission_pct: 0.0,
            slippage_bps: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaConfig {
    pub p95_ms: u64,
    pub max_error_rate: f64,
    pub min_uptime: f64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            p95_ms: 60_000,
            max_error_rate: 0.01,
            min_uptime: 0.99,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Five-field cron expression evaluated in `timezone`.
    pub cron: String,
    pub timezone: String,
    pub exchange: String,
    pub market_hours_only: bool,
    pub cycle_deadline_s: u64,
    /// Upper bound on concurrent per-symbol pipelines.
    pub worker_cap: usize,
    /// Trading-TF bars after emission before a signal outcome is settled.
    pub evaluation_window_bars: usize,
    /// Cycle runs considered by the rolling SLA window.
    pub lookback_runs: u32,
    pub sla: SlaConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron: "*/15 * * * *".to_string(),
            timezone: "America/New_York".to_string(),
            exchange: "XNYS".to_string(),
            market_hours_only: false,
            cycle_deadline_s: 60,
            worker_cap: 8,
            evaluation_window_bars: 20,
            lookback_runs: 100,
            sla: SlaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 2000,
            ttl_s: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub enabled: bool,
    pub interval_bars: usize,
    pub min_change_pct: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_bars: 10,
            min_change_pct: 0.01,
        }
    }
}

impl Default for DrummondConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            price_scale: 4,
            intervals: IntervalConfig::default(),
            pldot: PldotConfig::default(),
            envelope: EnvelopeConfig::default(),
            lines: LineConfig::default(),
            state: StateConfig::default(),
            pattern: PatternConfig::default(),
            coordinator: CoordinatorConfig::default(),
            signal: SignalConfig::default(),
            portfolio: PortfolioConfig::default(),
            execution: ExecutionConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            equity_sampler: SamplerConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, DrummondError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| DrummondError::InvalidInput(format!("{key}: cannot parse {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_interval(key: &str, default: Interval) -> Result<Interval, DrummondError> {
    match env::var(key) {
        Ok(raw) => Interval::parse(&raw)
            .ok_or_else(|| DrummondError::InvalidInput(format!("{key}: unknown interval {raw:?}"))),
        Err(_) => Ok(default),
    }
}

impl DrummondConfig {
    /// Build from environment variables over the defaults. `.env` loading is
    /// the caller's concern.
    pub fn from_env() -> Result<Self, DrummondError> {
        let defaults = DrummondConfig::default();

        let symbols = env::var("DRUMMOND_SYMBOLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            symbols,
            price_scale: env_parse("DRUMMOND_PRICE_SCALE", defaults.price_scale)?,
            intervals: IntervalConfig {
                trading: env_interval("DRUMMOND_INTERVAL_TRADING", defaults.intervals.trading)?,
                htf: env_interval("DRUMMOND_INTERVAL_HTF", defaults.intervals.htf)?,
                ltf: env_interval("DRUMMOND_INTERVAL_LTF", defaults.intervals.ltf)?,
            },
            pldot: PldotConfig {
                displacement: env_parse("DRUMMOND_PLDOT_DISPLACEMENT", defaults.pldot.displacement)?,
                max_gap_intervals: env_parse(
                    "DRUMMOND_PLDOT_MAX_GAP_INTERVALS",
                    defaults.pldot.max_gap_intervals,
                )?,
            },
            envelope: EnvelopeConfig {
                period: env_parse("DRUMMOND_ENVELOPE_PERIOD", defaults.envelope.period)?,
                multiplier: env_parse("DRUMMOND_ENVELOPE_MULTIPLIER", defaults.envelope.multiplier)?,
            },
            lines: LineConfig {
                swing_lookback: env_parse("DRUMMOND_SWING_LOOKBACK", defaults.lines.swing_lookback)?,
                projection_gap: env_parse("DRUMMOND_PROJECTION_GAP", defaults.lines.projection_gap)?,
                strength_half_life: env_parse(
                    "DRUMMOND_STRENGTH_HALF_LIFE",
                    defaults.lines.strength_half_life,
                )?,
                zone_tolerance_pct: env_parse(
                    "DRUMMOND_ZONE_TOLERANCE_PCT",
                    defaults.lines.zone_tolerance_pct,
                )?,
                max_zone_strength: env_parse(
                    "DRUMMOND_MAX_ZONE_STRENGTH",
                    defaults.lines.max_zone_strength,
                )?,
            },
            state: StateConfig {
                slope_epsilon: env_parse("DRUMMOND_STATE_SLOPE_EPSILON", defaults.state.slope_epsilon)?,
            },
            pattern: PatternConfig {
                min_rr: env_parse("DRUMMOND_PATTERN_MIN_RR", defaults.pattern.min_rr)?,
                ..defaults.pattern
            },
            coordinator: CoordinatorConfig {
                overlap_ratio: env_parse(
                    "DRUMMOND_COORDINATOR_OVERLAP_RATIO",
                    defaults.coordinator.overlap_ratio,
                )?,
                tolerance_pct: env_parse(
                    "DRUMMOND_COORDINATOR_TOLERANCE_PCT",
                    defaults.coordinator.tolerance_pct,
                )?,
            },
            signal: SignalConfig {
                min_confidence_notify: env_parse(
                    "DRUMMOND_SIGNAL_MIN_CONFIDENCE_NOTIFY",
                    defaults.signal.min_confidence_notify,
                )?,
                min_confidence_act: env_parse(
                    "DRUMMOND_SIGNAL_MIN_CONFIDENCE_ACT",
                    defaults.signal.min_confidence_act,
                )?,
            },
            portfolio: PortfolioConfig {
                initial_capital: env_parse(
                    "DRUMMOND_PORTFOLIO_INITIAL_CAPITAL",
                    defaults.portfolio.initial_capital,
                )?,
                risk_per_trade_pct: env_parse(
                    "DRUMMOND_PORTFOLIO_RISK_PER_TRADE_PCT",
                    defaults.portfolio.risk_per_trade_pct,
                )?,
                max_positions: env_parse(
                    "DRUMMOND_PORTFOLIO_MAX_POSITIONS",
                    defaults.portfolio.max_positions,
                )?,
                max_total_risk_pct: env_parse(
                    "DRUMMOND_PORTFOLIO_MAX_TOTAL_RISK_PCT",
                    defaults.portfolio.max_total_risk_pct,
                )?,
                max_per_sector: env_parse(
                    "DRUMMOND_PORTFOLIO_MAX_PER_SECTOR",
                    defaults.portfolio.max_per_sector,
                )?,
            },
            execution: ExecutionConfig {
                commission_pct: env_parse(
                    "DRUMMOND_EXECUTION_COMMISSION_PCT",
                    defaults.execution.commission_pct,
                )?,
                slippage_bps: env_parse(
                    "DRUMMOND_EXECUTION_SLIPPAGE_BPS",
                    defaults.execution.slippage_bps,
                )?,
            },
            scheduler: SchedulerConfig {
                cron: env_parse("DRUMMOND_SCHEDULER_CRON", defaults.scheduler.cron.clone())?,
                timezone: env_parse(
                    "DRUMMOND_SCHEDULER_TIMEZONE",
                    defaults.scheduler.timezone.clone(),
                )?,
                exchange: env_parse(
                    "DRUMMOND_SCHEDULER_EXCHANGE",
                    defaults.scheduler.exchange.clone(),
                )?,
                market_hours_only: env_parse(
                    "DRUMMOND_SCHEDULER_MARKET_HOURS_ONLY",
                    defaults.scheduler.market_hours_only,
                )?,
                cycle_deadline_s: env_parse(
                    "DRUMMOND_SCHEDULER_CYCLE_DEADLINE_S",
                    defaults.scheduler.cycle_deadline_s,
                )?,
                worker_cap: env_parse("DRUMMOND_SCHEDULER_WORKER_CAP", defaults.scheduler.worker_cap)?,
                evaluation_window_bars: env_parse(
                    "DRUMMOND_SCHEDULER_EVALUATION_WINDOW_BARS",
                    defaults.scheduler.evaluation_window_bars,
                )?,
                lookback_runs: env_parse(
                    "DRUMMOND_SCHEDULER_LOOKBACK_RUNS",
                    defaults.scheduler.lookback_runs,
                )?,
                sla: defaults.scheduler.sla,
            },
            cache: CacheConfig {
                max_size: env_parse("DRUMMOND_CACHE_MAX_SIZE", defaults.cache.max_size)?,
                ttl_s: env_parse("DRUMMOND_CACHE_TTL_S", defaults.cache.ttl_s)?,
            },
            equity_sampler: SamplerConfig {
                enabled: env_parse("DRUMMOND_SAMPLER_ENABLED", defaults.equity_sampler.enabled)?,
                interval_bars: env_parse(
                    "DRUMMOND_SAMPLER_INTERVAL_BARS",
                    defaults.equity_sampler.interval_bars,
                )?,
                min_change_pct: env_parse(
                    "DRUMMOND_SAMPLER_MIN_CHANGE_PCT",
                    defaults.equity_sampler.min_change_pct,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DrummondError> {
        if self.price_scale < 4 {
            return Err(DrummondError::InvalidInput(
                "price_scale must be at least 4".to_string(),
            ));
        }
        if self.envelope.period < 2 {
            return Err(DrummondError::InvalidInput(
                "envelope.period must be at least 2".to_string(),
            ));
        }
        if self.intervals.htf <= self.intervals.trading {
            return Err(DrummondError::InvalidInput(format!(
                "interval.htf ({}) must be coarser than interval.trading ({})",
                self.intervals.htf, self.intervals.trading
            )));
        }
        if self.intervals.ltf >= self.intervals.trading {
            return Err(DrummondError::InvalidInput(format!(
                "interval.ltf ({}) must be finer than interval.trading ({})",
                self.intervals.ltf, self.intervals.trading
            )));
        }
        for (key, v) in [
            ("pattern.min_rr", self.pattern.min_rr),
            ("portfolio.risk_per_trade_pct", self.portfolio.risk_per_trade_pct),
            ("portfolio.max_total_risk_pct", self.portfolio.max_total_risk_pct),
        ] {
            if v <= 0.0 {
                return Err(DrummondError::InvalidInput(format!(
                    "{key} must be positive (got {v})"
                )));
            }
        }
        for (key, v) in [
            ("signal.min_confidence_notify", self.signal.min_confidence_notify),
            ("signal.min_confidence_act", self.signal.min_confidence_act),
            ("coordinator.overlap_ratio", self.coordinator.overlap_ratio),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(DrummondError::InvalidInput(format!(
                    "{key} must be within [0, 1] (got {v})"
                )));
            }
        }
        if self.portfolio.initial_capital <= Decimal::ZERO {
            return Err(DrummondError::InvalidInput(
                "portfolio.initial_capital must be positive".to_string(),
            ));
        }
        if self.scheduler.worker_cap == 0 {
            return Err(DrummondError::InvalidInput(
                "scheduler.worker_cap must be at least 1".to_string(),
            ));
        }
        if self.cache.max_size == 0 {
            return Err(DrummondError::InvalidInput(
                "cache.max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(DrummondConfig::default().validate().is_ok());
    }

    #[test]
    fn htf_must_be_coarser_than_trading() {
        let mut config = DrummondConfig::default();
        config.intervals.htf = Interval::Min5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn confidence_floor_bounds_checked() {
        let mut config = DrummondConfig::default();
        config.signal.min_confidence_act = 1.2;
        assert!(config.validate().is_err());
    }
}
