use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DrummondError;
use crate::types::Interval;

/// Three-bar smoothed point-of-control, displaced one bar forward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PLdotPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Decimal,
    /// Timestamp the dot is projected onto (one bar ahead when it exists).
    pub projected_timestamp: Option<DateTime<Utc>>,
    pub projected_value: Decimal,
    /// value(i) - value(i-1); zero for the first point.
    pub slope: Decimal,
    pub displacement: u32,
}

/// Dynamic band around the PLdot derived from recent PLdot variability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeBand {
    pub timestamp: DateTime<Utc>,
    pub center: Decimal,
    pub upper: Decimal,
    pub lower: Decimal,
    pub width: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneKind {
    Support,
    Resistance,
}

impl ZoneKind {
    pub fn name(&self) -> &'static str {
        match self {
            ZoneKind::Support => "support",
            ZoneKind::Resistance => "resistance",
        }
    }
}

/// A forward projection from a recent significant swing bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrummondLine {
    pub origin_timestamp: DateTime<Utc>,
    pub origin_price: Decimal,
    pub projected_timestamp: DateTime<Utc>,
    pub projected_price: Decimal,
    pub kind: ZoneKind,
    pub strength: f64,
}

/// Overlapping lines of the same kind merged into a price region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrummondZone {
    pub center_price: Decimal,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub strength: f64,
    pub kind: ZoneKind,
    pub contributing_timeframes: Vec<Interval>,
}

impl DrummondZone {
    pub fn width(&self) -> Decimal {
        self.upper_price - self.lower_price
    }

    pub fn contains(&self, price: Decimal) -> bool {
        price >= self.lower_price && price <= self.upper_price
    }
}

/// Five-state market classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketState {
    Trend,
    CongestionEntrance,
    CongestionAction,
    CongestionExit,
    Reversal,
}

impl MarketState {
    pub fn name(&self) -> &'static str {
        match self {
            MarketState::Trend => "TREND",
            MarketState::CongestionEntrance => "CONGESTION_ENTRANCE",
            MarketState::CongestionAction => "CONGESTION_ACTION",
            MarketState::CongestionExit => "CONGESTION_EXIT",
            MarketState::Reversal => "REVERSAL",
        }
    }

    pub fn is_congestion(&self) -> bool {
        matches!(
            self,
            MarketState::CongestionEntrance
                | MarketState::CongestionAction
                | MarketState::CongestionExit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Neutral,
}

impl TrendDirection {
    pub fn sign(&self) -> i8 {
        match self {
            TrendDirection::Up => 1,
            TrendDirection::Down => -1,
            TrendDirection::Neutral => 0,
        }
    }

    pub fn opposite(&self) -> TrendDirection {
        match self {
            TrendDirection::Up => TrendDirection::Down,
            TrendDirection::Down => TrendDirection::Up,
            TrendDirection::Neutral => TrendDirection::Neutral,
        }
    }

    pub fn from_sign(sign: i8) -> TrendDirection {
        match sign {
            s if s > 0 => TrendDirection::Up,
            s if s < 0 => TrendDirection::Down,
            _ => TrendDirection::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlopeClass {
    Rising,
    Falling,
    Horizontal,
}

/// One classified bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatePoint {
    pub timestamp: DateTime<Utc>,
    pub state: MarketState,
    pub trend_direction: TrendDirection,
    /// 1 on transition, incremented while the state holds.
    pub bars_in_state: u32,
    pub previous_state: Option<MarketState>,
    pub pldot_slope_class: SlopeClass,
    pub confidence: f64,
    pub change_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternKind {
    Magnet,
    EnvelopeBounce,
    ConfluenceBreakout,
    MtfConfluence,
    RangeOscillation,
}

impl PatternKind {
    pub fn name(&self) -> &'static str {
        match self {
            PatternKind::Magnet => "magnet",
            PatternKind::EnvelopeBounce => "envelope_bounce",
            PatternKind::ConfluenceBreakout => "confluence_breakout",
            PatternKind::MtfConfluence => "mtf_confluence",
            PatternKind::RangeOscillation => "range_oscillation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternDirection {
    Bullish,
    Bearish,
}

impl PatternDirection {
    pub fn trend(&self) -> TrendDirection {
        match self {
            PatternDirection::Bullish => TrendDirection::Up,
            PatternDirection::Bearish => TrendDirection::Down,
        }
    }
}

/// A detected geometric pattern with trade levels attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub direction: PatternDirection,
    pub strength: f64,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub risk_reward: f64,
    pub timestamp: DateTime<Utc>,
    /// Free-form references to the artifacts that produced the pattern.
    pub context: serde_json::Value,
}

/// A price region where zones from multiple timeframes overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceZone {
    pub center_price: Decimal,
    pub upper_price: Decimal,
    pub lower_price: Decimal,
    pub kind: ZoneKind,
    pub contributing_timeframes: Vec<Interval>,
    /// 1 + number of matched higher-timeframe zones; always >= 1.
    pub confluence_strength: u32,
    pub combined_strength: f64,
    pub htf_trend_aligned: bool,
    pub state_context: Option<MarketState>,
}

impl ConfluenceZone {
    pub fn width(&self) -> Decimal {
        self.upper_price - self.lower_price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    Long,
    Short,
    ExitLong,
    ExitShort,
}

impl SignalType {
    pub fn name(&self) -> &'static str {
        match self {
            SignalType::Long => "LONG",
            SignalType::Short => "SHORT",
            SignalType::ExitLong => "EXIT_LONG",
            SignalType::ExitShort => "EXIT_SHORT",
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, SignalType::Long | SignalType::Short)
    }
}

/// A ranked directional trade proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timeframe: Interval,
    pub timestamp: DateTime<Utc>,
    pub signal_type: SignalType,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub confidence: f64,
    pub signal_strength: f64,
    pub rr_ratio: f64,
    pub htf_trend: TrendDirection,
    pub trading_state: MarketState,
    pub patterns: Vec<PatternKind>,
    pub zones_count: usize,
    pub metadata: serde_json::Value,
}

/// rr = |target - entry| / |entry - stop|, or 0 when the stop distance is 0.
pub fn risk_reward(entry: Decimal, stop: Decimal, target: Decimal) -> f64 {
    let risk = (entry - stop).abs();
    if risk.is_zero() {
        return 0.0;
    }
    let reward = (target - entry).abs();
    (reward / risk).to_f64().unwrap_or(0.0)
}

impl Signal {
    /// Check the price-ordering and risk/reward invariants. A violation is
    /// an internal inconsistency, never silently corrected.
    pub fn validate(&self, min_rr: f64) -> Result<(), DrummondError> {
        match self.signal_type {
            SignalType::Long => {
                if !(self.stop < self.entry && self.entry < self.target) {
                    return Err(DrummondError::Inconsistent(format!(
                        "LONG {} requires stop < entry < target (got {} / {} / {})",
                        self.symbol, self.stop, self.entry, self.target
                    )));
                }
            }
            SignalType::Short => {
                if !(self.stop > self.entry && self.entry > self.target) {
                    return Err(DrummondError::Inconsistent(format!(
                        "SHORT {} requires stop > entry > target (got {} / {} / {})",
                        self.symbol, self.stop, self.entry, self.target
                    )));
                }
            }
            // Exits unwind an existing position; level ordering does not apply.
            SignalType::ExitLong | SignalType::ExitShort => return Ok(()),
        }
        let rr = risk_reward(self.entry, self.stop, self.target);
        if rr + 1e-9 < min_rr {
            return Err(DrummondError::Inconsistent(format!(
                "signal {} rr {:.3} below minimum {:.3}",
                self.symbol, rr, min_rr
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn signal(signal_type: SignalType, entry: Decimal, stop: Decimal, target: Decimal) -> Signal {
        Signal {
            symbol: "AAPL".to_string(),
            timeframe: Interval::Min30,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap(),
            signal_type,
            entry,
            stop,
            target,
            confidence: 0.7,
            signal_strength: 0.6,
            rr_ratio: risk_reward(entry, stop, target),
            htf_trend: TrendDirection::Up,
            trading_state: MarketState::Trend,
            patterns: vec![PatternKind::Magnet],
            zones_count: 1,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn long_ordering_enforced() {
        let good = signal(SignalType::Long, dec!(100), dec!(98), dec!(104));
        assert!(good.validate(1.5).is_ok());

        let bad = signal(SignalType::Long, dec!(100), dec!(101), dec!(104));
        assert!(matches!(
            bad.validate(1.5),
            Err(DrummondError::Inconsistent(_))
        ));
    }

    #[test]
    fn short_ordering_enforced() {
        let good = signal(SignalType::Short, dec!(100), dec!(102), dec!(96));
        assert!(good.validate(1.5).is_ok());

        let bad = signal(SignalType::Short, dec!(100), dec!(99), dec!(96));
        assert!(bad.validate(1.5).is_err());
    }

    #[test]
    fn rr_below_minimum_is_inconsistent() {
        let thin = signal(SignalType::Long, dec!(100), dec!(98), dec!(101));
        assert!(thin.validate(1.5).is_err());
    }

    #[test]
    fn risk_reward_formula() {
        assert_eq!(risk_reward(dec!(100), dec!(98), dec!(104)), 2.0);
        assert_eq!(risk_reward(dec!(100), dec!(100), dec!(104)), 0.0);
    }
}
