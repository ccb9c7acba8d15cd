use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{BacktestResult, BacktestTrade, EquityPoint, SymbolResult};

/// Annualization factor for per-sample returns. The curve is sampled, not
/// strictly periodic, so this is indicative rather than exact.
const PERIODS_PER_YEAR: f64 = 252.0;

pub struct ResultInputs {
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<BacktestTrade>,
    pub total_bars: usize,
    pub exposed_bars: usize,
    pub total_commission: Decimal,
    pub total_slippage: Decimal,
    pub errors: Vec<String>,
}

/// Fold raw run outputs into the reported result with performance metrics.
pub fn compute_result(inputs: ResultInputs) -> BacktestResult {
    let ResultInputs {
        symbols,
        start,
        end,
        initial_capital,
        final_equity,
        equity_curve,
        trades,
        total_bars,
        exposed_bars,
        total_commission,
        total_slippage,
        errors,
    } = inputs;

    let winning_trades = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count() as u32;
    let losing_trades = trades.iter().filter(|t| t.pnl < Decimal::ZERO).count() as u32;
    let total_trades = trades.len() as u32;
    let win_rate = if total_trades > 0 {
        winning_trades as f64 / total_trades as f64
    } else {
        0.0
    };

    let gross_wins: f64 = trades
        .iter()
        .filter(|t| t.pnl > Decimal::ZERO)
        .map(|t| t.pnl.to_f64().unwrap_or(0.0))
        .sum();
    let gross_losses: f64 = trades
        .iter()
        .filter(|t| t.pnl < Decimal::ZERO)
        .map(|t| t.pnl.to_f64().unwrap_or(0.0).abs())
        .sum();
    let profit_factor = (gross_losses > 0.0).then(|| gross_wins / gross_losses);

    let returns = sample_returns(&equity_curve);
    let sharpe_ratio = sharpe(&returns);
    let sortino_ratio = sortino(&returns);
    let max_drawdown_pct = equity_curve
        .iter()
        .map(|p| p.drawdown_pct)
        .fold(0.0, f64::max);

    let initial = initial_capital.to_f64().unwrap_or(0.0);
    let total_return_pct = if initial > 0.0 {
        (final_equity.to_f64().unwrap_or(0.0) - initial) / initial * 100.0
    } else {
        0.0
    };
    let exposure_pct = if total_bars > 0 {
        exposed_bars as f64 / total_bars as f64 * 100.0
    } else {
        0.0
    };

    BacktestResult {
        symbols,
        start,
        end,
        initial_capital,
        final_equity,
        total_return_pct,
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        profit_factor,
        sharpe_ratio,
        sortino_ratio,
        max_drawdown_pct,
        exposure_pct,
        total_commission,
        total_slippage,
        per_symbol: per_symbol_breakdown(&trades),
        equity_curve,
        trades,
        errors,
    }
}

fn sample_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve
        .windows(2)
        .filter_map(|pair| {
            let prev = pair[0].equity.to_f64()?;
            let next = pair[1].equity.to_f64()?;
            (prev != 0.0).then(|| (next - prev) / prev)
        })
        .collect()
}

fn sharpe(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.mean();
    let std = returns.std_dev();
    (std > 0.0).then(|| mean / std * PERIODS_PER_YEAR.sqrt())
}

fn sortino(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return None;
    }
    let downside_dev =
        (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt();
    (downside_dev > 0.0).then(|| mean / downside_dev * PERIODS_PER_YEAR.sqrt())
}

fn per_symbol_breakdown(trades: &[BacktestTrade]) -> Vec<SymbolResult> {
    let mut by_symbol: BTreeMap<&str, SymbolResult> = BTreeMap::new();
    for trade in trades {
        let entry = by_symbol
            .entry(trade.symbol.as_str())
            .or_insert_with(|| SymbolResult {
                symbol: trade.symbol.clone(),
                trades: 0,
                wins: 0,
                pnl: Decimal::ZERO,
            });
        entry.trades += 1;
        if trade.pnl > Decimal::ZERO {
            entry.wins += 1;
        }
        entry.pnl += trade.pnl;
    }
    by_symbol.into_values().collect()
}
