use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use drummond_core::{
    Bar, BarSeries, Interval, MarketState, PldotConfig, SlopeClass, StateConfig, TrendDirection,
};

use crate::pldot::compute_pldot;
use crate::state::classify_states;

fn ts(i: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap() + Duration::minutes(30 * i)
}

fn series_from_closes(closes: &[Decimal]) -> BarSeries {
    let bars: Vec<Bar> = closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            timestamp: ts(i as i64),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: 100,
        })
        .collect();
    BarSeries::from_bars("AAPL", Interval::Min30, bars).unwrap()
}

fn classify(closes: &[Decimal]) -> Vec<drummond_core::MarketStatePoint> {
    let series = series_from_closes(closes);
    let pldots = compute_pldot(&series, &PldotConfig::default(), 4);
    classify_states(series.bars(), &pldots, &StateConfig::default())
}

#[test]
fn monotone_uptrend_classifies_trend_up() {
    // Closes 100..=105: first state lands on bar 4 as TREND UP.
    let closes: Vec<Decimal> = (0..6).map(|i| dec!(100) + Decimal::from(i)).collect();
    let states = classify(&closes);

    assert_eq!(states.len(), 2);
    assert_eq!(states[0].timestamp, ts(4));
    assert_eq!(states[0].state, MarketState::Trend);
    assert_eq!(states[0].trend_direction, TrendDirection::Up);
    assert_eq!(states[0].bars_in_state, 1);
    assert_eq!(states[0].previous_state, None);
    assert_eq!(states[0].pldot_slope_class, SlopeClass::Rising);

    assert_eq!(states[1].state, MarketState::Trend);
    assert_eq!(states[1].bars_in_state, 2);
    assert_eq!(states[1].previous_state, Some(MarketState::Trend));
    assert_eq!(states[1].change_reason, None);
}

#[test]
fn trend_confidence_includes_slope_bonus() {
    let closes: Vec<Decimal> = (0..6).map(|i| dec!(100) + Decimal::from(i)).collect();
    let states = classify(&closes);
    // base 0.5 + 0.05 x bars_in_state + 0.20 slope agreement
    assert!((states[0].confidence - 0.75).abs() < 1e-9);
    assert!((states[1].confidence - 0.80).abs() < 1e-9);
}

#[test]
fn pullback_series_exits_congestion_downward() {
    // Closes 100,101,102,103,101,99,98,97: positions (close vs PLdot) run
    // +,+,-,-,-,- so no initial alignment forms, congestion resolves into a
    // downward exit once three closes sit under the dot, then trend.
    let closes = [
        dec!(100),
        dec!(101),
        dec!(102),
        dec!(103),
        dec!(101),
        dec!(99),
        dec!(98),
        dec!(97),
    ];
    let states = classify(&closes);
    let sequence: Vec<(MarketState, TrendDirection)> = states
        .iter()
        .map(|s| (s.state, s.trend_direction))
        .collect();
    assert_eq!(
        sequence,
        vec![
            (MarketState::CongestionAction, TrendDirection::Neutral),
            (MarketState::CongestionAction, TrendDirection::Neutral),
            (MarketState::CongestionExit, TrendDirection::Down),
            (MarketState::Trend, TrendDirection::Down),
        ]
    );
    assert_eq!(states[1].bars_in_state, 2);
    assert_eq!(states[2].bars_in_state, 1);
    assert_eq!(states[2].previous_state, Some(MarketState::CongestionAction));
}

#[test]
fn established_trend_reverses_through_congestion() {
    // A real uptrend, then three closes under the dot: ENTRANCE -> ACTION
    // -> REVERSAL -> TREND DOWN.
    let closes = [
        dec!(100),
        dec!(101),
        dec!(102),
        dec!(103),
        dec!(104),
        dec!(105),
        dec!(103),
        dec!(102),
        dec!(101),
        dec!(100),
    ];
    let states = classify(&closes);
    let sequence: Vec<(MarketState, TrendDirection)> = states
        .iter()
        .map(|s| (s.state, s.trend_direction))
        .collect();
    assert_eq!(
        sequence,
        vec![
            (MarketState::Trend, TrendDirection::Up),
            (MarketState::Trend, TrendDirection::Up),
            (MarketState::CongestionEntrance, TrendDirection::Up),
            (MarketState::CongestionAction, TrendDirection::Up),
            (MarketState::Reversal, TrendDirection::Down),
            (MarketState::Trend, TrendDirection::Down),
        ]
    );
    // Every transition resets the in-state counter.
    for state in &states[2..] {
        assert_eq!(state.bars_in_state, 1);
    }
}

#[test]
fn flat_series_stays_in_congestion_with_horizontal_slope() {
    let closes = vec![dec!(100); 10];
    let states = classify(&closes);
    assert!(!states.is_empty());
    for (i, state) in states.iter().enumerate() {
        assert_eq!(state.state, MarketState::CongestionAction);
        assert_eq!(state.trend_direction, TrendDirection::Neutral);
        assert_eq!(state.pldot_slope_class, SlopeClass::Horizontal);
        assert_eq!(state.bars_in_state, i as u32 + 1);
    }
    // Congestion + horizontal slope earns the congestion bonus.
    assert!((states[0].confidence - 0.70).abs() < 1e-9);
}

#[test]
fn bars_in_state_increments_only_without_transition() {
    let closes = [
        dec!(100),
        dec!(101),
        dec!(102),
        dec!(103),
        dec!(104),
        dec!(105),
        dec!(103),
        dec!(102),
        dec!(101),
        dec!(100),
    ];
    let states = classify(&closes);
    for pair in states.windows(2) {
        if pair[1].state == pair[0].state && pair[1].trend_direction == pair[0].trend_direction {
            assert_eq!(pair[1].bars_in_state, pair[0].bars_in_state + 1);
        } else {
            assert_eq!(pair[1].bars_in_state, 1);
            assert_eq!(pair[1].previous_state, Some(pair[0].state));
            assert!(pair[1].change_reason.is_some());
        }
    }
}

#[test]
fn fewer_than_five_bars_emit_no_state() {
    let closes = [dec!(100), dec!(101), dec!(102), dec!(103)];
    assert!(classify(&closes).is_empty());
}
