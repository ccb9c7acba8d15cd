use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use calc_cache::{data_fingerprint, params_fingerprint, CacheKey, CalcCache, CalcKind};
use drummond_core::{
    BarSeries, DrummondConfig, DrummondError, DrummondLine, DrummondZone, EnvelopeBand,
    MarketStatePoint, PLdotPoint, TrendDirection,
};

use crate::lines::{aggregate_zones, detect_lines};
use crate::pldot::{compute_envelopes, compute_pldot};
use crate::state::classify_states;

/// Bars of the fingerprinted tail; covers every window the calculators use.
const FINGERPRINT_TAIL: usize = 64;

/// Everything the pipeline derives for one (symbol, interval).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeAnalysis {
    pub series: BarSeries,
    pub pldots: Vec<PLdotPoint>,
    pub envelopes: Vec<EnvelopeBand>,
    pub lines: Vec<DrummondLine>,
    pub zones: Vec<DrummondZone>,
    pub states: Vec<MarketStatePoint>,
}

impl TimeframeAnalysis {
    pub fn latest_state(&self) -> Option<&MarketStatePoint> {
        self.states.last()
    }

    pub fn latest_pldot(&self) -> Option<&PLdotPoint> {
        self.pldots.last()
    }

    pub fn latest_envelope(&self) -> Option<&EnvelopeBand> {
        self.envelopes.last()
    }

    pub fn trend_direction(&self) -> TrendDirection {
        self.latest_state()
            .map(|s| s.trend_direction)
            .unwrap_or(TrendDirection::Neutral)
    }

    pub fn state_confidence(&self) -> f64 {
        self.latest_state().map(|s| s.confidence).unwrap_or(0.0)
    }
}

/// Computes per-timeframe artifacts through the calculation cache; each
/// artifact kind is memoized under its own key so overlapping windows only
/// pay for what actually changed.
pub struct TimeframeAnalyzer {
    cache: Arc<CalcCache>,
    config: Arc<DrummondConfig>,
}

impl TimeframeAnalyzer {
    pub fn new(cache: Arc<CalcCache>, config: Arc<DrummondConfig>) -> Self {
        Self { cache, config }
    }

    pub async fn analyze(&self, series: &BarSeries) -> Result<Arc<TimeframeAnalysis>, DrummondError> {
        let config = &self.config;
        let scale = config.price_scale;
        let data = data_fingerprint(series.bars(), FINGERPRINT_TAIL);

        let pldots = self
            .cache
            .get_or_compute(
                self.key(series, CalcKind::Pldot, &data, &pldot_params(config)),
                || Ok(compute_pldot(series, &config.pldot, scale)),
            )
            .await?;

        let envelopes = {
            let pldots = Arc::clone(&pldots);
            self.cache
                .get_or_compute(
                    self.key(series, CalcKind::Envelope, &data, &envelope_params(config)),
                    move || Ok(compute_envelopes(&pldots, &config.envelope, scale)),
                )
                .await?
        };

        let lines = self
            .cache
            .get_or_compute(
                self.key(series, CalcKind::Lines, &data, &line_params(config)),
                || Ok(detect_lines(series, &config.lines)),
            )
            .await?;

        let zones = {
            let lines = Arc::clone(&lines);
            let envelope_width = envelopes
                .last()
                .map(|band| band.width)
                .unwrap_or(Decimal::ZERO);
            let interval = series.interval();
            self.cache
                .get_or_compute(
                    self.key(series, CalcKind::Zones, &data, &line_params(config)),
                    move || {
                        Ok(aggregate_zones(
                            &lines,
                            interval,
                            envelope_width,
                            &config.lines,
                            scale,
                        ))
                    },
                )
                .await?
        };

        let states = {
            let pldots = Arc::clone(&pldots);
            self.cache
                .get_or_compute(
                    self.key(series, CalcKind::State, &data, &state_params(config)),
                    move || Ok(classify_states(series.bars(), &pldots, &config.state)),
                )
                .await?
        };

        Ok(Arc::new(TimeframeAnalysis {
            series: series.clone(),
            pldots: (*pldots).clone(),
            envelopes: (*envelopes).clone(),
            lines: (*lines).clone(),
            zones: (*zones).clone(),
            states: (*states).clone(),
        }))
    }

    /// Uncached computation, for deterministic offline paths.
    pub fn analyze_uncached(series: &BarSeries, config: &DrummondConfig) -> TimeframeAnalysis {
        let scale = config.price_scale;
        let pldots = compute_pldot(series, &config.pldot, scale);
        let envelopes = compute_envelopes(&pldots, &config.envelope, scale);
        let lines = detect_lines(series, &config.lines);
        let envelope_width = envelopes
            .last()
            .map(|band| band.width)
            .unwrap_or(Decimal::ZERO);
        let zones = aggregate_zones(
            &lines,
            series.interval(),
            envelope_width,
            &config.lines,
            scale,
        );
        let states = classify_states(series.bars(), &pldots, &config.state);
        TimeframeAnalysis {
            series: series.clone(),
            pldots,
            envelopes,
            lines,
            zones,
            states,
        }
    }

    fn key(&self, series: &BarSeries, kind: CalcKind, data: &str, params: &str) -> CacheKey {
        CacheKey {
            kind,
            symbol: series.symbol().to_string(),
            interval: series.interval(),
            params_fingerprint: params.to_string(),
            data_fingerprint: data.to_string(),
        }
    }
}

fn pldot_params(config: &DrummondConfig) -> String {
    params_fingerprint(&[
        &config.pldot.displacement.to_string(),
        &config.pldot.max_gap_intervals.to_string(),
        &config.price_scale.to_string(),
    ])
}

fn envelope_params(config: &DrummondConfig) -> String {
    params_fingerprint(&[
        &config.envelope.period.to_string(),
        &config.envelope.multiplier.to_string(),
        &config.price_scale.to_string(),
    ])
}

fn line_params(config: &DrummondConfig) -> String {
    params_fingerprint(&[
        &config.lines.swing_lookback.to_string(),
        &config.lines.projection_gap.to_string(),
        &config.lines.strength_half_life.to_string(),
        &config.lines.zone_tolerance_pct.to_string(),
        &config.lines.max_zone_strength.to_string(),
    ])
}

fn state_params(config: &DrummondConfig) -> String {
    params_fingerprint(&[&config.state.slope_epsilon.to_string()])
}
