//! Multi-timeframe coordination: align higher-timeframe context onto the
//! trading timeframe, derive cross-timeframe confluence zones and score
//! composite signal strength.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use drummond_analysis::TimeframeAnalysis;
use drummond_core::{
    ConfluenceZone, CoordinatorConfig, Interval, MarketState, MarketStatePoint, PLdotPoint,
    TrendDirection, ZoneKind,
};

/// Higher-timeframe context aligned onto the latest trading-timeframe bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtfContext {
    pub htf_interval: Interval,
    pub htf_trend: TrendDirection,
    pub htf_state: Option<MarketStatePoint>,
    /// The HTF PLdot in effect at the latest trading bar.
    pub htf_pldot_overlay: Option<PLdotPoint>,
    /// Sorted by (confluence_strength desc, combined_strength desc).
    pub confluence_zones: Vec<ConfluenceZone>,
    /// Agreement between HTF and trading-TF trends, in [0, 1].
    pub mtf_alignment: f64,
}

pub struct MtfCoordinator {
    config: CoordinatorConfig,
}

impl MtfCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub fn coordinate(&self, htf: &TimeframeAnalysis, trading: &TimeframeAnalysis) -> MtfContext {
        let htf_trend = htf.trend_direction();
        let latest_trading = trading.series.last().map(|b| b.timestamp);
        let overlay = latest_trading.and_then(|t| htf_pldot_at(htf, t)).copied();

        let confluence_zones = self.confluence_zones(trading, htf);
        let mtf_alignment = alignment_factor(htf_trend, trading.trend_direction());

        MtfContext {
            htf_interval: htf.series.interval(),
            htf_trend,
            htf_state: htf.latest_state().cloned(),
            htf_pldot_overlay: overlay,
            confluence_zones,
            mtf_alignment,
        }
    }

    /// Match each trading-TF zone against same-kind HTF zones whose price
    /// interval overlaps it by at least the configured share of the trading
    /// zone's width.
    pub fn confluence_zones(
        &self,
        trading: &TimeframeAnalysis,
        htf: &TimeframeAnalysis,
    ) -> Vec<ConfluenceZone> {
        let htf_state = htf.latest_state();
        let state_context = trading.latest_state().map(|s| s.state);
        let htf_interval = htf.series.interval();
        let trading_interval = trading.series.interval();

        let mut out: Vec<ConfluenceZone> = trading
            .zones
            .iter()
            .map(|zone| {
                let matches: Vec<&drummond_core::DrummondZone> = htf
                    .zones
                    .iter()
                    .filter(|h| h.kind == zone.kind && self.overlaps(zone, h))
                    .collect();

                let mut contributing = vec![trading_interval];
                if !matches.is_empty() {
                    contributing.push(htf_interval);
                }
                let combined_strength =
                    zone.strength + matches.iter().map(|m| m.strength).sum::<f64>();
                let htf_trend_aligned = htf_state
                    .map(|s| {
                        s.state == MarketState::Trend
                            && trend_supports_kind(s.trend_direction, zone.kind)
                    })
                    .unwrap_or(false);

                ConfluenceZone {
                    center_price: zone.center_price,
                    upper_price: zone.upper_price,
                    lower_price: zone.lower_price,
                    kind: zone.kind,
                    contributing_timeframes: contributing,
                    confluence_strength: 1 + matches.len() as u32,
                    combined_strength,
                    htf_trend_aligned,
                    state_context,
                }
            })
            .collect();

        out.sort_by(|a, b| {
            b.confluence_strength
                .cmp(&a.confluence_strength)
                .then_with(|| {
                    b.combined_strength
                        .partial_cmp(&a.combined_strength)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        out
    }

    fn overlaps(&self, zone: &drummond_core::DrummondZone, htf: &drummond_core::DrummondZone) -> bool {
        let lo = zone.lower_price.max(htf.lower_price);
        let hi = zone.upper_price.min(htf.upper_price);
        if hi < lo {
            return false;
        }
        let width = zone.width();
        if width.is_zero() {
            // Degenerate zone: count containment as full overlap.
            return htf.contains(zone.center_price);
        }
        let overlap = (hi - lo).to_f64().unwrap_or(0.0);
        let width = width.to_f64().unwrap_or(0.0);
        overlap >= self.config.overlap_ratio * width
    }

    /// The confluence zone whose center sits within the distance tolerance
    /// of `price`; nearest first.
    pub fn nearest_zone<'a>(
        &self,
        zones: &'a [ConfluenceZone],
        price: Decimal,
    ) -> Option<&'a ConfluenceZone> {
        if price.is_zero() {
            return None;
        }
        zones
            .iter()
            .filter_map(|zone| {
                let distance = ((zone.center_price - price) / price).abs();
                (distance <= self.config.tolerance_pct).then_some((zone, distance))
            })
            .min_by(|a, b| a.1.cmp(&b.1))
            .map(|(zone, _)| zone)
    }
}

/// The HTF bar in effect at `t`: most recent HTF bar with start <= t.
pub fn htf_bar_index_at(htf: &TimeframeAnalysis, t: DateTime<Utc>) -> Option<usize> {
    let idx = htf.series.bars().partition_point(|b| b.timestamp <= t);
    idx.checked_sub(1)
}

/// The HTF PLdot in effect at `t`.
pub fn htf_pldot_at(htf: &TimeframeAnalysis, t: DateTime<Utc>) -> Option<&PLdotPoint> {
    let idx = htf.pldots.partition_point(|p| p.timestamp <= t);
    idx.checked_sub(1).map(|i| &htf.pldots[i])
}

/// Composite signal strength: 0.4 confluence + 0.25 alignment + 0.2 volume
/// + 0.15 geometric quality, each factor clamped to [0, 1] first.
pub fn signal_strength(
    confluence_factor: f64,
    mtf_alignment: f64,
    volume_factor: f64,
    pattern_quality: f64,
) -> f64 {
    0.4 * confluence_factor.clamp(0.0, 1.0)
        + 0.25 * mtf_alignment.clamp(0.0, 1.0)
        + 0.2 * volume_factor.clamp(0.0, 1.0)
        + 0.15 * pattern_quality.clamp(0.0, 1.0)
}

pub fn alignment_factor(htf: TrendDirection, trading: TrendDirection) -> f64 {
    match (htf, trading) {
        (TrendDirection::Neutral, _) | (_, TrendDirection::Neutral) => 0.5,
        (a, b) if a == b => 1.0,
        _ => 0.0,
    }
}

fn trend_supports_kind(direction: TrendDirection, kind: ZoneKind) -> bool {
    matches!(
        (direction, kind),
        (TrendDirection::Up, ZoneKind::Support) | (TrendDirection::Down, ZoneKind::Resistance)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use drummond_core::{Bar, BarSeries, DrummondZone, SlopeClass};
    use rust_decimal_macros::dec;

    fn ts(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap() + Duration::minutes(30 * i)
    }

    fn day(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap() + Duration::days(i)
    }

    fn analysis(
        interval: Interval,
        timestamps: Vec<DateTime<Utc>>,
        zones: Vec<DrummondZone>,
        state: Option<MarketStatePoint>,
    ) -> TimeframeAnalysis {
        let bars: Vec<Bar> = timestamps
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let close = dec!(150) + Decimal::from(i as u32);
                Bar {
                    timestamp: t,
                    open: close,
                    high: close + dec!(1),
                    low: close - dec!(1),
                    close,
                    volume: 100,
                }
            })
            .collect();
        let pldots: Vec<PLdotPoint> = bars
            .iter()
            .map(|b| PLdotPoint {
                timestamp: b.timestamp,
                value: b.close,
                projected_timestamp: None,
                projected_value: b.close,
                slope: Decimal::ZERO,
                displacement: 1,
            })
            .collect();
        TimeframeAnalysis {
            series: BarSeries::from_bars("AAPL", interval, bars).unwrap(),
            pldots,
            envelopes: vec![],
            lines: vec![],
            zones,
            states: state.into_iter().collect(),
        }
    }

    fn zone(kind: ZoneKind, lower: Decimal, upper: Decimal, strength: f64) -> DrummondZone {
        DrummondZone {
            center_price: (lower + upper) / dec!(2),
            lower_price: lower,
            upper_price: upper,
            strength,
            kind,
            contributing_timeframes: vec![],
        }
    }

    fn trend_state(direction: TrendDirection) -> MarketStatePoint {
        MarketStatePoint {
            timestamp: day(2),
            state: MarketState::Trend,
            trend_direction: direction,
            bars_in_state: 3,
            previous_state: Some(MarketState::Trend),
            pldot_slope_class: SlopeClass::Rising,
            confidence: 0.8,
            change_reason: None,
        }
    }

    #[test]
    fn htf_alignment_uses_most_recent_bar_at_or_before() {
        let htf = analysis(Interval::Day1, vec![day(0), day(1), day(2)], vec![], None);
        // Mid-day 1: the day-1 bar is in effect.
        let t = day(1) + Duration::hours(15);
        assert_eq!(htf_bar_index_at(&htf, t), Some(1));
        assert_eq!(htf_pldot_at(&htf, t).unwrap().timestamp, day(1));
        // Before the first bar: nothing is in effect.
        assert_eq!(htf_bar_index_at(&htf, day(0) - Duration::hours(1)), None);
    }

    #[test]
    fn overlapping_support_zones_gain_confluence() {
        // Trading-TF support 149.8..150.2 (strength 0.7) against an HTF
        // support 149.8..150.3: overlap 0.4 >= 50% of width, HTF in TREND UP.
        let trading = analysis(
            Interval::Min30,
            (0..3).map(ts).collect(),
            vec![zone(ZoneKind::Support, dec!(149.8), dec!(150.2), 0.7)],
            None,
        );
        let htf = analysis(
            Interval::Day1,
            vec![day(0), day(1), day(2)],
            vec![zone(ZoneKind::Support, dec!(149.8), dec!(150.3), 0.8)],
            Some(trend_state(TrendDirection::Up)),
        );

        let coordinator = MtfCoordinator::new(CoordinatorConfig::default());
        let zones = coordinator.confluence_zones(&trading, &htf);
        assert_eq!(zones.len(), 1);
        let confluent = &zones[0];
        assert!(confluent.confluence_strength >= 2);
        assert!((confluent.combined_strength - 1.5).abs() < 1e-9);
        assert!(confluent.htf_trend_aligned);
        assert_eq!(
            confluent.contributing_timeframes,
            vec![Interval::Min30, Interval::Day1]
        );
    }

    #[test]
    fn thin_overlap_does_not_match() {
        // HTF zone only covers 0.1 of the 0.4-wide trading zone.
        let trading = analysis(
            Interval::Min30,
            (0..3).map(ts).collect(),
            vec![zone(ZoneKind::Support, dec!(149.8), dec!(150.2), 0.7)],
            None,
        );
        let htf = analysis(
            Interval::Day1,
            vec![day(0), day(1), day(2)],
            vec![zone(ZoneKind::Support, dec!(150.1), dec!(150.9), 0.8)],
            Some(trend_state(TrendDirection::Up)),
        );

        let coordinator = MtfCoordinator::new(CoordinatorConfig::default());
        let zones = coordinator.confluence_zones(&trading, &htf);
        assert_eq!(zones[0].confluence_strength, 1);
        assert!(!zones[0].contributing_timeframes.contains(&Interval::Day1));
    }

    #[test]
    fn kind_mismatch_never_matches() {
        let trading = analysis(
            Interval::Min30,
            (0..3).map(ts).collect(),
            vec![zone(ZoneKind::Support, dec!(149.8), dec!(150.2), 0.7)],
            None,
        );
        let htf = analysis(
            Interval::Day1,
            vec![day(0), day(1), day(2)],
            vec![zone(ZoneKind::Resistance, dec!(149.8), dec!(150.3), 0.8)],
            Some(trend_state(TrendDirection::Down)),
        );
        let coordinator = MtfCoordinator::new(CoordinatorConfig::default());
        let zones = coordinator.confluence_zones(&trading, &htf);
        assert_eq!(zones[0].confluence_strength, 1);
        // TREND DOWN does not back a support zone.
        assert!(!zones[0].htf_trend_aligned);
    }

    #[test]
    fn zones_sorted_by_confluence_then_strength() {
        let trading = analysis(
            Interval::Min30,
            (0..3).map(ts).collect(),
            vec![
                zone(ZoneKind::Support, dec!(140.0), dec!(140.4), 0.9),
                zone(ZoneKind::Support, dec!(149.8), dec!(150.2), 0.7),
            ],
            None,
        );
        let htf = analysis(
            Interval::Day1,
            vec![day(0), day(1), day(2)],
            vec![zone(ZoneKind::Support, dec!(149.8), dec!(150.3), 0.8)],
            None,
        );
        let coordinator = MtfCoordinator::new(CoordinatorConfig::default());
        let zones = coordinator.confluence_zones(&trading, &htf);
        // The matched zone leads despite lower standalone strength.
        assert_eq!(zones[0].center_price, dec!(150.0));
        assert_eq!(zones[0].confluence_strength, 2);
        assert_eq!(zones[1].confluence_strength, 1);
    }

    #[test]
    fn nearest_zone_respects_tolerance() {
        let coordinator = MtfCoordinator::new(CoordinatorConfig::default());
        let zones = vec![
            ConfluenceZone {
                center_price: dec!(150.0),
                upper_price: dec!(150.2),
                lower_price: dec!(149.8),
                kind: ZoneKind::Support,
                contributing_timeframes: vec![Interval::Min30],
                confluence_strength: 2,
                combined_strength: 1.5,
                htf_trend_aligned: true,
                state_context: None,
            },
        ];
        // 150.05 is within 0.2% of the 150.0 center.
        assert!(coordinator.nearest_zone(&zones, dec!(150.05)).is_some());
        // 151 is ~0.66% away: outside the default tolerance.
        assert!(coordinator.nearest_zone(&zones, dec!(151)).is_none());
    }

    #[test]
    fn strength_factors_are_clamped() {
        let full = signal_strength(2.0, 1.5, 3.0, 9.0);
        assert!((full - 1.0).abs() < 1e-9);
        let none = signal_strength(0.0, 0.0, 0.0, 0.0);
        assert_eq!(none, 0.0);
        let mixed = signal_strength(0.5, 1.0, 0.5, 0.4);
        assert!((mixed - (0.2 + 0.25 + 0.1 + 0.06)).abs() < 1e-9);
    }
}
