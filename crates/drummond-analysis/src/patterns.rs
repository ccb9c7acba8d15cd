use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;

use drummond_core::{
    risk_reward, Bar, ConfluenceZone, EnvelopeBand, PLdotPoint, Pattern, PatternConfig,
    PatternDirection, PatternKind, TrendDirection, ZoneKind,
};

use crate::pldot::quantize;

/// HTF/TF alignment view consumed by the MTF-confluence detector.
#[derive(Debug, Clone, Copy)]
pub struct MtfAlignmentView {
    pub htf_direction: TrendDirection,
    pub htf_confidence: f64,
    pub tf_direction: TrendDirection,
    pub tf_confidence: f64,
}

/// Runs every detector against the latest bar. Each detector yields at most
/// one instance per call.
pub struct PatternDetector {
    config: PatternConfig,
    scale: u32,
}

impl PatternDetector {
    pub fn new(config: PatternConfig, scale: u32) -> Self {
        Self { config, scale }
    }

    pub fn detect_all(
        &self,
        bars: &[Bar],
        pldots: &[PLdotPoint],
        envelopes: &[EnvelopeBand],
        zones: &[ConfluenceZone],
        mtf: Option<MtfAlignmentView>,
        ltf_trigger: Option<&Pattern>,
    ) -> Vec<Pattern> {
        let mut patterns = Vec::new();
        if let Some(p) = self.detect_magnet(bars, pldots, envelopes, zones) {
            patterns.push(p);
        }
        if let Some(p) = self.detect_envelope_bounce(bars, envelopes) {
            patterns.push(p);
        }
        if let Some(p) = self.detect_confluence_breakout(bars, zones) {
            patterns.push(p);
        }
        if let Some(view) = mtf {
            if let Some(p) = self.detect_mtf_confluence(bars, pldots, envelopes, view, ltf_trigger)
            {
                patterns.push(p);
            }
        }
        if let Some(p) = self.detect_range_oscillation(bars, pldots, envelopes) {
            patterns.push(p);
        }
        patterns
    }

    /// Magnet: the prior close sat away from the dot and the current close
    /// was pulled onto it; trade continuation through the dot.
    pub fn detect_magnet(
        &self,
        bars: &[Bar],
        pldots: &[PLdotPoint],
        envelopes: &[EnvelopeBand],
        zones: &[ConfluenceZone],
    ) -> Option<Pattern> {
        let bar = bars.last()?;
        let prev = bars.get(bars.len().checked_sub(2)?)?;
        let dot = pldots.last()?;
        if dot.timestamp != bar.timestamp || dot.value.is_zero() {
            return None;
        }

        let prior_distance = (prev.close - dot.value).abs() / dot.value;
        let current_distance = (bar.close - dot.value).abs() / dot.value;
        if prior_distance < self.config.magnet_trigger_pct
            || current_distance > self.config.magnet_proximity_pct
        {
            return None;
        }

        let direction = if prev.close < dot.value {
            PatternDirection::Bullish
        } else {
            PatternDirection::Bearish
        };
        let entry = bar.close;
        let stop = self.protective_stop(direction, entry, dot.value);
        let target = self.opposite_target(direction, entry, envelopes, zones)?;

        let trigger = self.config.magnet_trigger_pct.to_f64().unwrap_or(0.005);
        let strength =
            (prior_distance.to_f64().unwrap_or(0.0) / (4.0 * trigger)).clamp(0.0, 1.0);

        self.build(
            PatternKind::Magnet,
            direction,
            strength,
            entry,
            stop,
            target,
            bar.timestamp,
            json!({
                "pldot": dot.value,
                "prior_distance_pct": prior_distance,
            }),
        )
    }

    /// Envelope bounce: a close hugging an envelope edge plus a reversal
    /// candle or above-mean volume fades back toward the center.
    pub fn detect_envelope_bounce(&self, bars: &[Bar], envelopes: &[EnvelopeBand]) -> Option<Pattern> {
        let bar = bars.last()?;
        let band = envelopes.last()?;
        if band.timestamp != bar.timestamp || band.width.is_zero() {
            return None;
        }

        let near_lower = relative_distance(bar.close, band.lower) <= self.config.bounce_tolerance_pct;
        let near_upper = relative_distance(bar.close, band.upper) <= self.config.bounce_tolerance_pct;
        let direction = match (near_lower, near_upper) {
            (true, false) => PatternDirection::Bullish,
            (false, true) => PatternDirection::Bearish,
            _ => return None,
        };

        let reversal_candle = match direction {
            PatternDirection::Bullish => bar.close > bar.open,
            PatternDirection::Bearish => bar.close < bar.open,
        };
        let volume_confirm = mean_volume(bars, self.config.volume_window)
            .map(|mean| bar.volume as f64 > mean)
            .unwrap_or(false);
        if !reversal_candle && !volume_confirm {
            return None;
        }

        let entry = bar.close;
        let (edge, target) = match direction {
            PatternDirection::Bullish => (band.lower, band.upper),
            PatternDirection::Bearish => (band.upper, band.lower),
        };
        let stop = self.protective_stop(direction, entry, edge);

        let mut strength: f64 = 0.6;
        if reversal_candle {
            strength += 0.2;
        }
        if volume_confirm {
            strength += 0.2;
        }

        self.build(
            PatternKind::EnvelopeBounce,
            direction,
            strength.min(1.0),
            entry,
            stop,
            target,
            bar.timestamp,
            json!({
                "envelope_edge": edge,
                "reversal_candle": reversal_candle,
                "volume_confirm": volume_confirm,
            }),
        )
    }

    /// Confluence breakout: a shallow close beyond a strong zone boundary on
    /// expanded volume.
    pub fn detect_confluence_breakout(
        &self,
        bars: &[Bar],
        zones: &[ConfluenceZone],
    ) -> Option<Pattern> {
        let bar = bars.last()?;
        let mean = mean_volume(bars, self.config.volume_window)?;
        if (bar.volume as f64) < self.config.breakout_volume_ratio * mean {
            return None;
        }

        let mut candidates: Vec<&ConfluenceZone> = zones
            .iter()
            .filter(|z| z.combined_strength >= self.config.breakout_min_zone_strength)
            .collect();
        candidates.sort_by(|a, b| {
            b.combined_strength
                .partial_cmp(&a.combined_strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for zone in candidates {
            let width = zone.width();
            if width.is_zero() {
                continue;
            }
            let max_penetration = width * self.config.breakout_max_penetration_ratio;

            let (direction, boundary) = match zone.kind {
                ZoneKind::Resistance => (PatternDirection::Bullish, zone.upper_price),
                ZoneKind::Support => (PatternDirection::Bearish, zone.lower_price),
            };
            let penetration = match direction {
                PatternDirection::Bullish => bar.close - boundary,
                PatternDirection::Bearish => boundary - bar.close,
            };
            if penetration <= Decimal::ZERO || penetration > max_penetration {
                continue;
            }

            let entry = boundary;
            let stop = zone.center_price;
            let risk = (entry - stop).abs();
            let target = match direction {
                PatternDirection::Bullish => entry + risk * Decimal::from(2),
                PatternDirection::Bearish => entry - risk * Decimal::from(2),
            };

            let volume_ratio = bar.volume as f64 / mean;
            let strength = ((zone.combined_strength / 3.0) * 0.7
                + (volume_ratio / (2.0 * self.config.breakout_volume_ratio)) * 0.3)
                .clamp(0.0, 1.0);

            return self.build(
                PatternKind::ConfluenceBreakout,
                direction,
                strength,
                entry,
                stop,
                target,
                bar.timestamp,
                json!({
                    "zone_center": zone.center_price,
                    "confluence_strength": zone.confluence_strength,
                    "volume_ratio": volume_ratio,
                }),
            );
        }
        None
    }

    /// MTF confluence: HTF and trading-TF trends agree and a lower-TF
    /// trigger (magnet or bounce) fired in the same direction.
    pub fn detect_mtf_confluence(
        &self,
        bars: &[Bar],
        pldots: &[PLdotPoint],
        envelopes: &[EnvelopeBand],
        view: MtfAlignmentView,
        ltf_trigger: Option<&Pattern>,
    ) -> Option<Pattern> {
        if view.htf_direction == TrendDirection::Neutral
            || view.htf_direction != view.tf_direction
        {
            return None;
        }
        let trigger = ltf_trigger?;
        if !matches!(
            trigger.kind,
            PatternKind::Magnet | PatternKind::EnvelopeBounce
        ) || trigger.direction.trend() != view.htf_direction
        {
            return None;
        }

        let bar = bars.last()?;
        let dot = pldots.last()?;
        let direction = trigger.direction;
        let entry = bar.close;
        let stop = self.protective_stop(direction, entry, dot.value);
        let target = self.opposite_target(direction, entry, envelopes, &[])?;

        let strength = 0.4 * view.htf_confidence
            + 0.35 * view.tf_confidence
            + 0.25 * trigger.strength;

        self.build(
            PatternKind::MtfConfluence,
            direction,
            strength.clamp(0.0, 1.0),
            entry,
            stop,
            target,
            bar.timestamp,
            json!({
                "ltf_trigger": trigger.kind.name(),
                "htf_confidence": view.htf_confidence,
                "tf_confidence": view.tf_confidence,
            }),
        )
    }

    /// Range oscillation: a flat envelope repeatedly touched on both sides;
    /// fade the touch that just happened.
    pub fn detect_range_oscillation(
        &self,
        bars: &[Bar],
        pldots: &[PLdotPoint],
        envelopes: &[EnvelopeBand],
    ) -> Option<Pattern> {
        if pldots.len() < 10 {
            return None;
        }
        let recent = &pldots[pldots.len() - 10..];
        let first = recent[0].value.to_f64().unwrap_or(0.0);
        let last = recent[recent.len() - 1].value.to_f64().unwrap_or(0.0);
        if first == 0.0 || ((last - first) / first).abs() >= self.config.range_slope_epsilon {
            return None;
        }

        let by_ts: HashMap<DateTime<Utc>, &EnvelopeBand> =
            envelopes.iter().map(|e| (e.timestamp, e)).collect();
        let window_start = bars.len().saturating_sub(self.config.range_touch_window);
        let mut upper_touches = 0usize;
        let mut lower_touches = 0usize;
        for bar in &bars[window_start..] {
            let Some(band) = by_ts.get(&bar.timestamp) else {
                continue;
            };
            if band.width.is_zero() {
                continue;
            }
            if bar.high >= band.upper {
                upper_touches += 1;
            }
            if bar.low <= band.lower {
                lower_touches += 1;
            }
        }
        if upper_touches + lower_touches < self.config.range_min_touches {
            return None;
        }

        let bar = bars.last()?;
        let band = by_ts.get(&bar.timestamp)?;
        let touching_upper = bar.high >= band.upper;
        let touching_lower = bar.low <= band.lower;
        let direction = match (touching_upper, touching_lower) {
            (true, false) => PatternDirection::Bearish,
            (false, true) => PatternDirection::Bullish,
            // No fresh touch (or both edges in one bar): nothing to fade.
            _ => return None,
        };

        let entry = bar.close;
        let (edge, target) = match direction {
            PatternDirection::Bullish => (band.lower, band.upper),
            PatternDirection::Bearish => (band.upper, band.lower),
        };
        let stop = self.protective_stop(direction, entry, edge);
        let total = (upper_touches + lower_touches) as f64;
        let strength = (total / (2.0 * self.config.range_min_touches as f64)).clamp(0.0, 1.0);

        self.build(
            PatternKind::RangeOscillation,
            direction,
            strength,
            entry,
            stop,
            target,
            bar.timestamp,
            json!({
                "upper_touches": upper_touches,
                "lower_touches": lower_touches,
            }),
        )
    }

    /// Stop just beyond the protective reference on the adverse side.
    fn protective_stop(
        &self,
        direction: PatternDirection,
        entry: Decimal,
        reference: Decimal,
    ) -> Decimal {
        let one = Decimal::ONE;
        match direction {
            PatternDirection::Bullish => quantize(
                entry.min(reference) * (one - self.config.magnet_stop_buffer_pct),
                self.scale,
            ),
            PatternDirection::Bearish => quantize(
                entry.max(reference) * (one + self.config.magnet_stop_buffer_pct),
                self.scale,
            ),
        }
    }

    /// Opposite envelope edge, falling back to the nearest confluence zone
    /// past the entry.
    fn opposite_target(
        &self,
        direction: PatternDirection,
        entry: Decimal,
        envelopes: &[EnvelopeBand],
        zones: &[ConfluenceZone],
    ) -> Option<Decimal> {
        let band = envelopes.last();
        match direction {
            PatternDirection::Bullish => {
                if let Some(band) = band {
                    if band.upper > entry {
                        return Some(band.upper);
                    }
                }
                zones
                    .iter()
                    .filter(|z| z.kind == ZoneKind::Resistance && z.center_price > entry)
                    .map(|z| z.center_price)
                    .min()
            }
            PatternDirection::Bearish => {
                if let Some(band) = band {
                    if band.lower < entry {
                        return Some(band.lower);
                    }
                }
                zones
                    .iter()
                    .filter(|z| z.kind == ZoneKind::Support && z.center_price < entry)
                    .map(|z| z.center_price)
                    .max()
            }
        }
    }

    /// Assemble a pattern, discarding geometry that cannot carry a trade or
    /// fails the minimum risk/reward.
    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        kind: PatternKind,
        direction: PatternDirection,
        strength: f64,
        entry: Decimal,
        stop: Decimal,
        target: Decimal,
        timestamp: DateTime<Utc>,
        context: serde_json::Value,
    ) -> Option<Pattern> {
        let ordered = match direction {
            PatternDirection::Bullish => stop < entry && entry < target,
            PatternDirection::Bearish => stop > entry && entry > target,
        };
        if !ordered {
            return None;
        }
        let rr = risk_reward(entry, stop, target);
        if rr < self.config.min_rr {
            tracing::debug!(kind = kind.name(), rr, "pattern suppressed below min rr");
            return None;
        }
        Some(Pattern {
            kind,
            direction,
            strength,
            entry_price: entry,
            stop_price: stop,
            target_price: target,
            risk_reward: rr,
            timestamp,
            context,
        })
    }
}

/// |a - b| / b as a ratio; b must be nonzero.
fn relative_distance(a: Decimal, b: Decimal) -> Decimal {
    if b.is_zero() {
        return Decimal::MAX;
    }
    (a - b).abs() / b.abs()
}

/// Mean volume of the bars preceding the latest one, over the window.
fn mean_volume(bars: &[Bar], window: usize) -> Option<f64> {
    if bars.len() < 2 {
        return None;
    }
    let prior = &bars[..bars.len() - 1];
    let start = prior.len().saturating_sub(window);
    let slice = &prior[start..];
    if slice.is_empty() {
        return None;
    }
    Some(slice.iter().map(|b| b.volume as f64).sum::<f64>() / slice.len() as f64)
}
