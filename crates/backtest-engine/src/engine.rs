use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use bar_store::{aggregate, BarStore};
use calc_cache::CalcCache;
use drummond_analysis::{quantize, MtfAlignmentView, PatternDetector, TimeframeAnalyzer};
use drummond_core::{
    Bar, BarSeries, DrummondConfig, DrummondError, Signal, SignalType,
};
use mtf_coordinator::MtfCoordinator;
use signal_engine::{OpenPositionView, SignalGenerator};

use crate::metrics::{compute_result, ResultInputs};
use crate::models::{
    BacktestConfig, BacktestResult, BacktestTrade, EquityPoint, ExitReason, Position,
};
use crate::positions::PositionManager;
use crate::ranker::{rank_candidates, Candidate};
use crate::sampler::EquitySampler;

/// Lockstep portfolio backtester: one global clock over the sorted union of
/// trading-TF timestamps across symbols. Per-symbol analysis feeds the
/// shared ranker and executor after each timestep's updates.
pub struct BacktestEngine {
    config: BacktestConfig,
    drummond: Arc<DrummondConfig>,
    analyzer: TimeframeAnalyzer,
    detector: PatternDetector,
    coordinator: MtfCoordinator,
    generator: SignalGenerator,
    tz: Tz,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        let drummond = Arc::new(config.drummond.clone());
        let cache = Arc::new(CalcCache::new(&drummond.cache));
        let analyzer = TimeframeAnalyzer::new(Arc::clone(&cache), Arc::clone(&drummond));
        let detector = PatternDetector::new(drummond.pattern, drummond.price_scale);
        let coordinator = MtfCoordinator::new(drummond.coordinator);
        let generator = SignalGenerator::new(Arc::clone(&drummond));
        let tz: Tz = drummond
            .scheduler
            .timezone
            .parse()
            .unwrap_or(chrono_tz::UTC);
        Self {
            config,
            drummond,
            analyzer,
            detector,
            coordinator,
            generator,
            tz,
        }
    }

    pub async fn run(&self, store: &BarStore) -> Result<BacktestResult, DrummondError> {
        let trading_interval = self.drummond.intervals.trading;
        let mut errors: Vec<String> = Vec::new();

        let mut series_by_symbol: BTreeMap<String, BarSeries> = BTreeMap::new();
        for symbol in &self.config.symbols {
            match store.get_bars(symbol, trading_interval, self.config.start, self.config.end) {
                Ok(series) => {
                    series_by_symbol.insert(symbol.clone(), series);
                }
                Err(e) => errors.push(format!("{symbol}: {e}")),
            }
        }
        if series_by_symbol.is_empty() {
            return Err(DrummondError::NotFound(
                "no symbol has bars in the backtest range".to_string(),
            ));
        }

        let timeline: BTreeSet<DateTime<Utc>> = series_by_symbol
            .values()
            .flat_map(|s| s.bars().iter().map(|b| b.timestamp))
            .collect();

        let initial_capital = self.drummond.portfolio.initial_capital;
        let mut manager = PositionManager::new(initial_capital);
        let mut sampler = EquitySampler::new(self.drummond.equity_sampler);
        let mut prices: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut trades: Vec<BacktestTrade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = vec![EquityPoint {
            timestamp: self.config.start,
            equity: initial_capital,
            drawdown_pct: 0.0,
        }];
        let mut peak_equity = initial_capital;
        let mut total_commission = Decimal::ZERO;
        let mut total_slippage = Decimal::ZERO;
        let mut exposed_bars = 0usize;
        let total_steps = timeline.len();

        for (step, &t) in timeline.iter().enumerate() {
            let mut trade_event = false;

            // 1. Update open positions from the bars at t; stops and targets
            //    resolve on high/low before the close, stop winning ties.
            for (symbol, series) in &series_by_symbol {
                let Some(bar) = bar_at(series, t) else {
                    continue;
                };
                prices.insert(symbol.clone(), bar.close);
                if manager.position(symbol).is_none() {
                    continue;
                }
                manager.update_excursions(symbol, bar.high, bar.low);
                let exit = manager
                    .position(symbol)
                    .and_then(|p| resolve_exit(p, &bar));
                if let Some((raw_price, reason)) = exit {
                    if let Some(trade) = self.close_position(
                        &mut manager,
                        symbol,
                        raw_price,
                        t,
                        reason,
                        &mut total_commission,
                        &mut total_slippage,
                    ) {
                        trades.push(trade);
                        trade_event = true;
                    }
                }
            }

            // 2-3. Re-run the analytic pipeline for symbols with a fresh bar.
            let mut exits: Vec<Signal> = Vec::new();
            let mut candidates: Vec<Candidate> = Vec::new();
            for (symbol, series) in &series_by_symbol {
                if bar_at(series, t).is_none() {
                    continue;
                }
                let visible = series.up_to(t);
                if visible.len() < self.config.warmup_bars {
                    continue;
                }
                let window =
                    BarSeries::from_bars(symbol.clone(), trading_interval, visible.to_vec())?;
                match self
                    .evaluate_symbol(symbol, &window, manager.position(symbol))
                    .await
                {
                    Ok(Some(signal)) if signal.signal_type.is_entry() => {
                        candidates.push(Candidate {
                            sector: self.config.sector_of(symbol).map(String::from),
                            signal,
                        });
                    }
                    Ok(Some(signal)) => exits.push(signal),
                    Ok(None) => {}
                    // Per-symbol errors abort this symbol's timestep only.
                    Err(e) => errors.push(format!("{symbol} @ {t}: {e}")),
                }
            }

            // Signal-driven exits settle before new capital is deployed.
            for exit in exits {
                if manager.position(&exit.symbol).is_none() {
                    continue;
                }
                let Some(price) = prices.get(&exit.symbol).copied() else {
                    continue;
                };
                if let Some(trade) = self.close_position(
                    &mut manager,
                    &exit.symbol,
                    price,
                    t,
                    ExitReason::Signal,
                    &mut total_commission,
                    &mut total_slippage,
                ) {
                    trades.push(trade);
                    trade_event = true;
                }
            }

            // 4-6. Rank candidates and open what the limits allow.
            let mut sector_counts: HashMap<String, usize> = HashMap::new();
            for position in manager.positions() {
                if let Some(sector) = self.config.sector_of(&position.symbol) {
                    *sector_counts.entry(sector.to_string()).or_default() += 1;
                }
            }
            rank_candidates(&mut candidates, &sector_counts);

            let equity_now = manager.equity(t, &prices);
            for candidate in candidates {
                if self.try_open(
                    &mut manager,
                    &candidate,
                    equity_now,
                    t,
                    &mut sector_counts,
                    &mut total_commission,
                    &mut total_slippage,
                ) {
                    trade_event = true;
                }
            }

            let equity = manager.equity(t, &prices);
            peak_equity = peak_equity.max(equity);
            if manager.open_count() > 0 {
                exposed_bars += 1;
            }
            let drawdown_pct = drawdown(peak_equity, equity);
            if sampler.observe(equity, trade_event) || step + 1 == total_steps {
                equity_curve.push(EquityPoint {
                    timestamp: t,
                    equity,
                    drawdown_pct,
                });
            }
        }

        // Unwind whatever is still open at the last seen price.
        let end = timeline.iter().last().copied().unwrap_or(self.config.end);
        let open_symbols: Vec<String> =
            manager.positions().map(|p| p.symbol.clone()).collect();
        for symbol in open_symbols {
            let Some(price) = prices.get(&symbol).copied() else {
                continue;
            };
            if let Some(trade) = self.close_position(
                &mut manager,
                &symbol,
                price,
                end,
                ExitReason::EndOfData,
                &mut total_commission,
                &mut total_slippage,
            ) {
                trades.push(trade);
            }
        }
        let final_equity = manager.equity(end, &prices);
        if equity_curve.last().map(|p| p.equity) != Some(final_equity) {
            equity_curve.push(EquityPoint {
                timestamp: end,
                equity: final_equity,
                drawdown_pct: drawdown(peak_equity.max(final_equity), final_equity),
            });
        }

        Ok(compute_result(ResultInputs {
            symbols: series_by_symbol.keys().cloned().collect(),
            start: self.config.start,
            end: self.config.end,
            initial_capital,
            final_equity,
            equity_curve,
            trades,
            total_bars: total_steps,
            exposed_bars,
            total_commission,
            total_slippage,
            errors,
        }))
    }

    /// Full per-symbol pipeline for one timestep: analyze the trading TF,
    /// aggregate and analyze the HTF, coordinate, detect, generate.
    async fn evaluate_symbol(
        &self,
        symbol: &str,
        window: &BarSeries,
        position: Option<&Position>,
    ) -> Result<Option<Signal>, DrummondError> {
        let trading = self.analyzer.analyze(window).await?;
        let htf_series = aggregate(window, self.drummond.intervals.htf, self.tz)?;
        let htf = self.analyzer.analyze(&htf_series).await?;
        let ctx = self.coordinator.coordinate(&htf, &trading);

        let view = MtfAlignmentView {
            htf_direction: htf.trend_direction(),
            htf_confidence: htf.state_confidence(),
            tf_direction: trading.trend_direction(),
            tf_confidence: trading.state_confidence(),
        };
        let patterns = self.detector.detect_all(
            trading.series.bars(),
            &trading.pldots,
            &trading.envelopes,
            &ctx.confluence_zones,
            Some(view),
            None,
        );
        let position_view = position.map(|p| OpenPositionView {
            direction: p.direction,
            entry_price: p.entry_price,
        });
        self.generator
            .generate(symbol, &trading, &ctx, &patterns, position_view.as_ref())
    }

    #[allow(clippy::too_many_arguments)]
    fn try_open(
        &self,
        manager: &mut PositionManager,
        candidate: &Candidate,
        equity: Decimal,
        t: DateTime<Utc>,
        sector_counts: &mut HashMap<String, usize>,
        total_commission: &mut Decimal,
        total_slippage: &mut Decimal,
    ) -> bool {
        let signal = &candidate.signal;
        let portfolio = &self.drummond.portfolio;

        if signal.confidence < self.drummond.signal.min_confidence_act {
            return false;
        }
        if manager.position(&signal.symbol).is_some() {
            return false;
        }
        if manager.open_count() >= portfolio.max_positions {
            return false;
        }
        if portfolio.max_per_sector > 0 {
            if let Some(sector) = &candidate.sector {
                if sector_counts.get(sector).copied().unwrap_or(0) >= portfolio.max_per_sector {
                    return false;
                }
            }
        }

        let confidence_multiplier = self
            .config
            .use_confidence_multiplier
            .then_some(signal.confidence);
        let quantity = position_size(
            equity,
            portfolio.risk_per_trade_pct,
            confidence_multiplier,
            signal.entry,
            signal.stop,
        );
        if quantity == 0 {
            return false;
        }

        let risk = Decimal::from(quantity) * (signal.entry - signal.stop).abs();
        let max_total_risk = equity
            * Decimal::from_f64(portfolio.max_total_risk_pct).unwrap_or(Decimal::ZERO);
        if manager.total_open_risk() + risk > max_total_risk {
            return false;
        }

        let direction: i8 = if signal.signal_type == SignalType::Long {
            1
        } else {
            -1
        };
        let fill = self.fill_price(signal.entry, direction);
        let commission = self.commission_on(fill, quantity);
        let slippage = Decimal::from(quantity) * (fill - signal.entry).abs();

        // Longs must be funded from cash after costs.
        if direction > 0 && Decimal::from(quantity) * fill + commission > manager.cash() {
            return false;
        }

        *total_commission += commission;
        *total_slippage += slippage;
        if let Some(sector) = &candidate.sector {
            *sector_counts.entry(sector.clone()).or_default() += 1;
        }
        manager.open(
            Position {
                symbol: signal.symbol.clone(),
                direction,
                quantity,
                entry_price: fill,
                entry_time: t,
                stop: signal.stop,
                target: signal.target,
                confidence: signal.confidence,
                open_risk: risk,
                max_favorable_excursion: Decimal::ZERO,
                max_adverse_excursion: Decimal::ZERO,
                entry_commission: commission,
                entry_slippage: slippage,
            },
            fill,
            commission,
        );
        tracing::debug!(
            symbol = %signal.symbol,
            direction,
            quantity,
            fill = %fill,
            "opened position"
        );
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn close_position(
        &self,
        manager: &mut PositionManager,
        symbol: &str,
        raw_price: Decimal,
        t: DateTime<Utc>,
        reason: ExitReason,
        total_commission: &mut Decimal,
        total_slippage: &mut Decimal,
    ) -> Option<BacktestTrade> {
        let direction = manager.position(symbol)?.direction;
        let quantity = manager.position(symbol)?.quantity;
        // Exits slip against the position.
        let fill = self.fill_price(raw_price, -direction);
        let commission = self.commission_on(fill, quantity);
        let slippage = Decimal::from(quantity) * (fill - raw_price).abs();
        let position = manager.close(symbol, fill, commission)?;

        *total_commission += commission;
        *total_slippage += slippage;

        let gross = Decimal::from(position.direction)
            * Decimal::from(position.quantity)
            * (fill - position.entry_price);
        let pnl = gross - commission - position.entry_commission;
        let notional = position.entry_price * Decimal::from(position.quantity);
        let pnl_pct = if notional.is_zero() {
            0.0
        } else {
            (pnl / notional).to_f64().unwrap_or(0.0) * 100.0
        };
        tracing::debug!(symbol, reason = reason.name(), pnl = %pnl, "closed position");

        Some(BacktestTrade {
            symbol: position.symbol.clone(),
            direction: position.direction,
            quantity: position.quantity,
            entry_time: position.entry_time,
            exit_time: t,
            entry_price: position.entry_price,
            exit_price: fill,
            pnl,
            pnl_pct,
            exit_reason: reason,
            confidence: position.confidence,
            max_favorable_excursion: position.max_favorable_excursion,
            max_adverse_excursion: position.max_adverse_excursion,
            commission: commission + position.entry_commission,
            slippage: slippage + position.entry_slippage,
        })
    }

    /// Apply slippage in the adverse direction for the acting side.
    /// `side` is +1 when buying (long entry / short exit), -1 when selling.
    fn fill_price(&self, raw: Decimal, side: i8) -> Decimal {
        let bps = Decimal::from_f64(self.drummond.execution.slippage_bps)
            .unwrap_or(Decimal::ZERO)
            / Decimal::from(10_000);
        let adjusted = if side > 0 {
            raw * (Decimal::ONE + bps)
        } else {
            raw * (Decimal::ONE - bps)
        };
        quantize(adjusted, self.drummond.price_scale)
    }

    fn commission_on(&self, fill: Decimal, quantity: u64) -> Decimal {
        let rate = Decimal::from_f64(self.drummond.execution.commission_pct)
            .unwrap_or(Decimal::ZERO);
        quantize(
            fill * Decimal::from(quantity) * rate,
            self.drummond.price_scale,
        )
    }
}

fn drawdown(peak: Decimal, equity: Decimal) -> f64 {
    if peak <= Decimal::ZERO {
        return 0.0;
    }
    ((peak - equity) / peak).to_f64().unwrap_or(0.0).max(0.0) * 100.0
}

fn bar_at(series: &BarSeries, t: DateTime<Utc>) -> Option<Bar> {
    let bars = series.bars();
    let idx = bars.partition_point(|b| b.timestamp < t);
    (idx < bars.len() && bars[idx].timestamp == t).then(|| bars[idx])
}

/// Stop/target resolution on one bar, using high/low before close. When
/// both levels sit inside the bar's range the stop wins.
pub fn resolve_exit(position: &Position, bar: &Bar) -> Option<(Decimal, ExitReason)> {
    if position.direction > 0 {
        if bar.low <= position.stop {
            return Some((position.stop, ExitReason::Stop));
        }
        if bar.high >= position.target {
            return Some((position.target, ExitReason::Target));
        }
    } else {
        if bar.high >= position.stop {
            return Some((position.stop, ExitReason::Stop));
        }
        if bar.low <= position.target {
            return Some((position.target, ExitReason::Target));
        }
    }
    None
}

/// quantity = floor(risk_budget / per-share risk), where
/// risk_budget = equity x risk_per_trade_pct x optional confidence.
pub fn position_size(
    equity: Decimal,
    risk_per_trade_pct: f64,
    confidence_multiplier: Option<f64>,
    entry: Decimal,
    stop: Decimal,
) -> u64 {
    let per_unit = (entry - stop).abs();
    if per_unit.is_zero() || equity <= Decimal::ZERO {
        return 0;
    }
    let mut budget =
        equity * Decimal::from_f64(risk_per_trade_pct).unwrap_or(Decimal::ZERO);
    if let Some(confidence) = confidence_multiplier {
        budget *= Decimal::from_f64(confidence.clamp(0.0, 1.0)).unwrap_or(Decimal::ONE);
    }
    (budget / per_unit).floor().to_u64().unwrap_or(0)
}
