//! Signal generation: compose trading-TF state, detected patterns, nearest
//! confluence and HTF trend into at most one directional signal per symbol
//! per cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use drummond_analysis::TimeframeAnalysis;
use drummond_core::{
    risk_reward, ConfluenceZone, DrummondConfig, DrummondError, Pattern, PatternDirection,
    PatternKind, Signal, SignalType, TrendDirection, ZoneKind,
};
use mtf_coordinator::{signal_strength, MtfContext, MtfCoordinator};

/// What the generator needs to know about an already-open position.
#[derive(Debug, Clone, Copy)]
pub struct OpenPositionView {
    /// +1 long, -1 short.
    pub direction: i8,
    pub entry_price: Decimal,
}

/// Confidence applied to exits triggered by a structural break rather than
/// an opposite signal.
const STRUCTURAL_EXIT_CONFIDENCE: f64 = 0.8;

pub struct SignalGenerator {
    config: Arc<DrummondConfig>,
    coordinator: MtfCoordinator,
}

impl SignalGenerator {
    pub fn new(config: Arc<DrummondConfig>) -> Self {
        let coordinator = MtfCoordinator::new(config.coordinator);
        Self {
            config,
            coordinator,
        }
    }

    /// Emit at most one signal for the latest trading-TF bar.
    ///
    /// Exits take precedence: an open position conflicting with a
    /// high-confidence opposite candidate, or three closes through the
    /// PLdot against it, unwinds before new entries are considered.
    pub fn generate(
        &self,
        symbol: &str,
        trading: &TimeframeAnalysis,
        ctx: &MtfContext,
        patterns: &[Pattern],
        open_position: Option<&OpenPositionView>,
    ) -> Result<Option<Signal>, DrummondError> {
        let Some(bar) = trading.series.last().copied() else {
            return Ok(None);
        };
        let Some(state) = trading.latest_state().cloned() else {
            return Ok(None);
        };

        let entry_candidate = self.entry_candidate(symbol, trading, ctx, patterns, &state)?;

        if let Some(position) = open_position {
            if let Some(exit) = self.exit_signal(
                symbol,
                trading,
                ctx,
                position,
                entry_candidate.as_ref(),
                bar.timestamp,
                bar.close,
            ) {
                return Ok(Some(exit));
            }
        }

        // One entry per symbol per cycle; an existing position blocks
        // stacking a second entry in the same direction.
        if open_position.is_some() {
            return Ok(None);
        }
        if let Some(signal) = &entry_candidate {
            signal.validate(self.config.pattern.min_rr)?;
        }
        Ok(entry_candidate)
    }

    fn entry_candidate(
        &self,
        symbol: &str,
        trading: &TimeframeAnalysis,
        ctx: &MtfContext,
        patterns: &[Pattern],
        state: &drummond_core::MarketStatePoint,
    ) -> Result<Option<Signal>, DrummondError> {
        let Some(bar) = trading.series.last().copied() else {
            return Ok(None);
        };

        let mut ranked: Vec<&Pattern> = patterns.iter().collect();
        ranked.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for pattern in ranked {
            let direction = pattern.direction;
            if !self.htf_permits(ctx.htf_trend, pattern) {
                continue;
            }
            let nearest = self
                .coordinator
                .nearest_zone(&ctx.confluence_zones, bar.close);
            if !self.pattern_qualifies(pattern, direction, nearest) {
                continue;
            }

            let confluence_factor = nearest
                .map(|z| z.confluence_strength as f64 / 3.0)
                .unwrap_or(0.0);
            let volume_factor = volume_factor(trading, self.config.pattern.volume_window);
            let strength = signal_strength(
                confluence_factor,
                ctx.mtf_alignment,
                volume_factor,
                pattern.strength,
            );
            let htf_aligned = ctx.htf_trend == direction.trend();
            let confidence =
                strength * state.confidence * if htf_aligned { 1.0 } else { 0.8 };

            let signal_type = match direction {
                PatternDirection::Bullish => SignalType::Long,
                PatternDirection::Bearish => SignalType::Short,
            };
            let signal = Signal {
                symbol: symbol.to_string(),
                timeframe: trading.series.interval(),
                timestamp: bar.timestamp,
                signal_type,
                entry: pattern.entry_price,
                stop: pattern.stop_price,
                target: pattern.target_price,
                confidence: confidence.clamp(0.0, 1.0),
                signal_strength: strength,
                rr_ratio: pattern.risk_reward,
                htf_trend: ctx.htf_trend,
                trading_state: state.state,
                patterns: vec![pattern.kind],
                zones_count: ctx.confluence_zones.len(),
                metadata: json!({
                    "confluence_factor": confluence_factor,
                    "mtf_alignment": ctx.mtf_alignment,
                    "volume_factor": volume_factor,
                    "pattern_strength": pattern.strength,
                    "htf_aligned": htf_aligned,
                }),
            };
            return Ok(Some(signal));
        }
        Ok(None)
    }

    /// HTF gate: trade with the higher timeframe, or against a NEUTRAL one
    /// only on a strong pattern.
    fn htf_permits(&self, htf_trend: TrendDirection, pattern: &Pattern) -> bool {
        match htf_trend {
            TrendDirection::Neutral => pattern.strength >= 0.7,
            direction => direction == pattern.direction.trend(),
        }
    }

    fn pattern_qualifies(
        &self,
        pattern: &Pattern,
        direction: PatternDirection,
        nearest: Option<&ConfluenceZone>,
    ) -> bool {
        match pattern.kind {
            // A magnet entry needs confluence backing on the protective side.
            PatternKind::Magnet => nearest
                .map(|zone| match direction {
                    PatternDirection::Bullish => zone.kind == ZoneKind::Support,
                    PatternDirection::Bearish => zone.kind == ZoneKind::Resistance,
                })
                .unwrap_or(false),
            PatternKind::EnvelopeBounce
            | PatternKind::ConfluenceBreakout
            | PatternKind::MtfConfluence
            | PatternKind::RangeOscillation => true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exit_signal(
        &self,
        symbol: &str,
        trading: &TimeframeAnalysis,
        ctx: &MtfContext,
        position: &OpenPositionView,
        entry_candidate: Option<&Signal>,
        timestamp: DateTime<Utc>,
        close: Decimal,
    ) -> Option<Signal> {
        let opposite = entry_candidate.filter(|candidate| {
            let candidate_direction = match candidate.signal_type {
                SignalType::Long => 1,
                SignalType::Short => -1,
                _ => 0,
            };
            candidate_direction == -position.direction
                && candidate.confidence >= self.config.signal.min_confidence_act
        });
        let structural = structural_break(trading, position.direction);

        let (confidence, reason) = match (opposite, structural) {
            (Some(candidate), _) => (candidate.confidence, "opposite_signal"),
            (None, true) => (STRUCTURAL_EXIT_CONFIDENCE, "structural_break"),
            (None, false) => return None,
        };

        let signal_type = if position.direction > 0 {
            SignalType::ExitLong
        } else {
            SignalType::ExitShort
        };
        tracing::debug!(symbol, reason, "exit signal");
        Some(Signal {
            symbol: symbol.to_string(),
            timeframe: trading.series.interval(),
            timestamp,
            signal_type,
            entry: close,
            stop: close,
            target: close,
            confidence,
            signal_strength: confidence,
            rr_ratio: risk_reward(close, close, close),
            htf_trend: ctx.htf_trend,
            trading_state: trading
                .latest_state()
                .map(|s| s.state)
                .unwrap_or(drummond_core::MarketState::CongestionAction),
            patterns: Vec::new(),
            zones_count: ctx.confluence_zones.len(),
            metadata: json!({ "exit_reason": reason }),
        })
    }
}

/// Three consecutive closes through the PLdot against the position.
fn structural_break(trading: &TimeframeAnalysis, direction: i8) -> bool {
    if trading.pldots.len() < 3 {
        return false;
    }
    let closes: HashMap<DateTime<Utc>, Decimal> = trading
        .series
        .bars()
        .iter()
        .map(|b| (b.timestamp, b.close))
        .collect();
    trading.pldots[trading.pldots.len() - 3..]
        .iter()
        .all(|point| match closes.get(&point.timestamp) {
            Some(close) if direction > 0 => *close < point.value,
            Some(close) => *close > point.value,
            None => false,
        })
}

/// Latest volume against the rolling mean, scaled so 2x the mean saturates.
fn volume_factor(trading: &TimeframeAnalysis, window: usize) -> f64 {
    let bars = trading.series.bars();
    if bars.len() < 2 {
        return 0.0;
    }
    let prior = &bars[..bars.len() - 1];
    let start = prior.len().saturating_sub(window);
    let slice = &prior[start..];
    if slice.is_empty() {
        return 0.0;
    }
    let mean = slice.iter().map(|b| b.volume as f64).sum::<f64>() / slice.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let latest = bars[bars.len() - 1].volume as f64;
    (latest / (2.0 * mean)).clamp(0.0, 1.0)
}
