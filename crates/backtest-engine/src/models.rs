use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use drummond_core::DrummondConfig;

/// Configuration for one backtest run. Analytic parameters come from the
/// shared [`DrummondConfig`]; the fields here scope the run itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Trading-TF bars required before signals are considered.
    pub warmup_bars: usize,
    /// Symbol -> sector, for the diversity ranking and per-sector caps.
    pub sectors: HashMap<String, String>,
    /// Scale the per-trade risk budget by signal confidence.
    pub use_confidence_multiplier: bool,
    pub drummond: DrummondConfig,
}

impl BacktestConfig {
    pub fn new(symbols: Vec<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbols,
            start,
            end,
            warmup_bars: 30,
            sectors: HashMap::new(),
            use_confidence_multiplier: false,
            drummond: DrummondConfig::default(),
        }
    }

    pub fn sector_of(&self, symbol: &str) -> Option<&str> {
        self.sectors.get(symbol).map(String::as_str)
    }
}

/// An open position. Mutated only by the position manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// +1 long, -1 short.
    pub direction: i8,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub stop: Decimal,
    pub target: Decimal,
    pub confidence: f64,
    /// quantity x |entry - stop| at open.
    pub open_risk: Decimal,
    /// Best unrealized move since entry, in price terms.
    pub max_favorable_excursion: Decimal,
    /// Worst unrealized move since entry, in price terms.
    pub max_adverse_excursion: Decimal,
    pub entry_commission: Decimal,
    pub entry_slippage: Decimal,
}

impl Position {
    /// Signed market-value contribution: longs add qty x price, shorts
    /// carry the liability of the borrowed shares.
    pub fn market_value(&self, price: Decimal) -> Decimal {
        let gross = Decimal::from(self.quantity) * price;
        if self.direction > 0 {
            gross
        } else {
            -gross
        }
    }

    pub fn unrealized(&self, price: Decimal) -> Decimal {
        Decimal::from(self.direction) * Decimal::from(self.quantity) * (price - self.entry_price)
    }

    /// Track MFE/MAE from a bar's high/low.
    pub fn update_excursions(&mut self, high: Decimal, low: Decimal) {
        let (favorable, adverse) = if self.direction > 0 {
            (high - self.entry_price, self.entry_price - low)
        } else {
            (self.entry_price - low, high - self.entry_price)
        };
        self.max_favorable_excursion = self.max_favorable_excursion.max(favorable);
        self.max_adverse_excursion = self.max_adverse_excursion.max(adverse);
    }
}

/// Snapshot of the portfolio at one timestep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub positions: Vec<Position>,
    pub total_equity: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Stop,
    Target,
    Signal,
    EndOfData,
}

impl ExitReason {
    pub fn name(&self) -> &'static str {
        match self {
            ExitReason::Stop => "stop",
            ExitReason::Target => "target",
            ExitReason::Signal => "signal",
            ExitReason::EndOfData => "end_of_data",
        }
    }
}

/// A completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub symbol: String,
    pub direction: i8,
    pub quantity: u64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub confidence: f64,
    pub max_favorable_excursion: Decimal,
    pub max_adverse_excursion: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
}

/// A point on the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub drawdown_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolResult {
    pub symbol: String,
    pub trades: u32,
    pub wins: u32,
    pub pnl: Decimal,
}

/// Full result of a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_return_pct: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub profit_factor: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub max_drawdown_pct: f64,
    pub exposure_pct: f64,
    pub total_commission: Decimal,
    pub total_slippage: Decimal,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<BacktestTrade>,
    pub per_symbol: Vec<SymbolResult>,
    /// Per-symbol pipeline errors; they never abort the run.
    pub errors: Vec<String>,
}
