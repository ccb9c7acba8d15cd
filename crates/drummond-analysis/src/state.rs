use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use drummond_core::{
    Bar, MarketState, MarketStatePoint, PLdotPoint, SlopeClass, StateConfig, TrendDirection,
};

/// Classify each bar against its PLdot into the five-state machine.
///
/// position(i) = sign(close(i) - PLdot(i)); an exact tie inherits the
/// previous position. Three matching positions form an alignment. States
/// start at the third classified position; earlier bars emit nothing.
pub fn classify_states(
    bars: &[Bar],
    pldots: &[PLdotPoint],
    config: &StateConfig,
) -> Vec<MarketStatePoint> {
    let closes: HashMap<DateTime<Utc>, Decimal> =
        bars.iter().map(|b| (b.timestamp, b.close)).collect();

    // Positions aligned with the PLdot sequence.
    let mut positions: Vec<i8> = Vec::with_capacity(pldots.len());
    for point in pldots {
        let close = match closes.get(&point.timestamp) {
            Some(c) => *c,
            None => continue,
        };
        let raw = match close.cmp(&point.value) {
            std::cmp::Ordering::Greater => 1,
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
        };
        let inherited = if raw == 0 {
            positions.last().copied().unwrap_or(0)
        } else {
            raw
        };
        positions.push(inherited);
    }

    let mut states: Vec<MarketStatePoint> = Vec::with_capacity(positions.len());
    let mut prior_trend = TrendDirection::Neutral;

    for j in 2..positions.len() {
        let point = &pldots[j];
        let alignment = alignment_of(&positions[j - 2..=j]);
        let slope_class = classify_slope(point, config);

        let previous = states.last().map(|s| (s.state, s.trend_direction));
        let (state, direction, reason) = next_state(previous, alignment, positions[j], prior_trend);

        if matches!(
            state,
            MarketState::Trend | MarketState::CongestionExit | MarketState::Reversal
        ) {
            prior_trend = direction;
        }

        let transition = previous.map(|(s, d)| s != state || d != direction).unwrap_or(true);
        let bars_in_state = if transition {
            1
        } else {
            states.last().map(|s| s.bars_in_state).unwrap_or(0) + 1
        };

        let confidence = confidence_for(state, direction, slope_class, bars_in_state);

        states.push(MarketStatePoint {
            timestamp: point.timestamp,
            state,
            trend_direction: direction,
            bars_in_state,
            previous_state: states.last().map(|s| s.state),
            pldot_slope_class: slope_class,
            confidence,
            change_reason: if transition {
                Some(reason.to_string())
            } else {
                None
            },
        });
    }
    states
}

fn alignment_of(window: &[i8]) -> Option<TrendDirection> {
    if window.iter().all(|&p| p == 1) {
        Some(TrendDirection::Up)
    } else if window.iter().all(|&p| p == -1) {
        Some(TrendDirection::Down)
    } else {
        None
    }
}

fn classify_slope(point: &PLdotPoint, config: &StateConfig) -> SlopeClass {
    let value = point.value.to_f64().unwrap_or(0.0);
    let slope = point.slope.to_f64().unwrap_or(0.0);
    if value != 0.0 && (slope / value).abs() < config.slope_epsilon {
        SlopeClass::Horizontal
    } else if slope > 0.0 {
        SlopeClass::Rising
    } else if slope < 0.0 {
        SlopeClass::Falling
    } else {
        SlopeClass::Horizontal
    }
}

/// One transition step. The generic TREND rule applies from the initial,
/// TREND, CONGESTION_EXIT and REVERSAL states; inside congestion an
/// alignment resolves to CONGESTION_EXIT or REVERSAL first, which makes
/// those labels transitional by construction.
fn next_state(
    previous: Option<(MarketState, TrendDirection)>,
    alignment: Option<TrendDirection>,
    position: i8,
    prior_trend: TrendDirection,
) -> (MarketState, TrendDirection, &'static str) {
    match previous {
        None => match alignment {
            Some(direction) => (
                MarketState::Trend,
                direction,
                "initial three-bar alignment",
            ),
            None => (
                MarketState::CongestionAction,
                TrendDirection::Neutral,
                "initial bars without alignment",
            ),
        },
        Some((MarketState::CongestionEntrance, _)) | Some((MarketState::CongestionAction, _)) => {
            match alignment {
                Some(direction) if direction == prior_trend => (
                    MarketState::CongestionExit,
                    direction,
                    "alignment resumed prior trend",
                ),
                Some(direction) if prior_trend == TrendDirection::Neutral => (
                    MarketState::CongestionExit,
                    direction,
                    "alignment broke out of initial congestion",
                ),
                Some(direction) => (
                    MarketState::Reversal,
                    direction,
                    "alignment against prior trend",
                ),
                None => (
                    MarketState::CongestionAction,
                    prior_trend,
                    "congestion continues",
                ),
            }
        }
        // TREND, and the one-bar transitional labels re-evaluated as TREND.
        Some((_, direction)) => {
            if position != 0 && position != direction.sign() {
                (
                    MarketState::CongestionEntrance,
                    direction,
                    "close crossed against trend",
                )
            } else {
                (MarketState::Trend, direction, "trend continues")
            }
        }
    }
}

fn confidence_for(
    state: MarketState,
    direction: TrendDirection,
    slope_class: SlopeClass,
    bars_in_state: u32,
) -> f64 {
    let mut confidence = 0.5 + (0.05 * bars_in_state as f64).min(0.30);
    let slope_matches_trend = matches!(
        (slope_class, direction),
        (SlopeClass::Rising, TrendDirection::Up) | (SlopeClass::Falling, TrendDirection::Down)
    );
    if state == MarketState::Trend && slope_matches_trend {
        confidence += 0.20;
    }
    if state.is_congestion() && slope_class == SlopeClass::Horizontal {
        confidence += 0.15;
    }
    confidence.clamp(0.0, 1.0)
}
