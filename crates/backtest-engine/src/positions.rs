use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{PortfolioState, Position};

/// Owns cash and open positions; the only mutator of both. Keeps a cached
/// equity scalar per timestep that position changes invalidate.
pub struct PositionManager {
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    cached_equity: Option<(DateTime<Utc>, Decimal)>,
}

impl PositionManager {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            cash: initial_capital,
            positions: BTreeMap::new(),
            cached_equity: None,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Sum of open risk across positions.
    pub fn total_open_risk(&self) -> Decimal {
        self.positions.values().map(|p| p.open_risk).sum()
    }

    /// Open a position at `fill_price` (slippage already applied). Longs
    /// spend cash; shorts credit the proceeds. Commission always debits.
    pub fn open(&mut self, position: Position, fill_price: Decimal, commission: Decimal) {
        let gross = Decimal::from(position.quantity) * fill_price;
        if position.direction > 0 {
            self.cash -= gross;
        } else {
            self.cash += gross;
        }
        self.cash -= commission;
        self.positions.insert(position.symbol.clone(), position);
        self.cached_equity = None;
    }

    /// Close and return the position; the caller turns it into a trade.
    pub fn close(
        &mut self,
        symbol: &str,
        fill_price: Decimal,
        commission: Decimal,
    ) -> Option<Position> {
        let position = self.positions.remove(symbol)?;
        let gross = Decimal::from(position.quantity) * fill_price;
        if position.direction > 0 {
            self.cash += gross;
        } else {
            self.cash -= gross;
        }
        self.cash -= commission;
        self.cached_equity = None;
        Some(position)
    }

    pub fn update_excursions(&mut self, symbol: &str, high: Decimal, low: Decimal) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.update_excursions(high, low);
        }
    }

    /// total_equity = cash + sum of position market values at the latest
    /// prices. Cached per timestep; open/close invalidates.
    pub fn equity(&mut self, timestamp: DateTime<Utc>, prices: &BTreeMap<String, Decimal>) -> Decimal {
        if let Some((cached_at, value)) = self.cached_equity {
            if cached_at == timestamp {
                return value;
            }
        }
        let value = self.cash
            + self
                .positions
                .values()
                .map(|p| {
                    let price = prices.get(&p.symbol).copied().unwrap_or(p.entry_price);
                    p.market_value(price)
                })
                .sum::<Decimal>();
        self.cached_equity = Some((timestamp, value));
        value
    }

    pub fn snapshot(&mut self, timestamp: DateTime<Utc>, prices: &BTreeMap<String, Decimal>) -> PortfolioState {
        let total_equity = self.equity(timestamp, prices);
        PortfolioState {
            timestamp,
            cash: self.cash,
            positions: self.positions.values().cloned().collect(),
            total_equity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap() + chrono::Duration::minutes(30 * i)
    }

    fn long(symbol: &str, quantity: u64, entry: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            direction: 1,
            quantity,
            entry_price: entry,
            entry_time: ts(0),
            stop: entry - dec!(2),
            target: entry + dec!(4),
            confidence: 0.7,
            open_risk: Decimal::from(quantity) * dec!(2),
            max_favorable_excursion: Decimal::ZERO,
            max_adverse_excursion: Decimal::ZERO,
            entry_commission: Decimal::ZERO,
            entry_slippage: Decimal::ZERO,
        }
    }

    #[test]
    fn equity_matches_cash_plus_market_value() {
        let mut manager = PositionManager::new(dec!(10000));
        manager.open(long("AAPL", 10, dec!(100)), dec!(100), dec!(1));
        assert_eq!(manager.cash(), dec!(8999));

        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), dec!(105));
        let equity = manager.equity(ts(1), &prices);
        assert_eq!(equity, dec!(8999) + dec!(1050));
    }

    #[test]
    fn short_positions_carry_liability() {
        let mut manager = PositionManager::new(dec!(10000));
        let mut position = long("AAPL", 10, dec!(100));
        position.direction = -1;
        manager.open(position, dec!(100), Decimal::ZERO);
        // Proceeds credited.
        assert_eq!(manager.cash(), dec!(11000));

        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), dec!(90));
        // Equity gains as price falls: 11000 - 900 = 10100.
        assert_eq!(manager.equity(ts(1), &prices), dec!(10100));

        manager.close("AAPL", dec!(90), Decimal::ZERO);
        assert_eq!(manager.cash(), dec!(10100));
        assert_eq!(manager.open_count(), 0);
    }

    #[test]
    fn equity_cache_invalidated_by_position_changes() {
        let mut manager = PositionManager::new(dec!(10000));
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), dec!(100));

        let before = manager.equity(ts(1), &prices);
        assert_eq!(before, dec!(10000));
        // Same timestamp, cached.
        assert_eq!(manager.equity(ts(1), &prices), dec!(10000));

        manager.open(long("AAPL", 10, dec!(100)), dec!(100), Decimal::ZERO);
        // Same timestamp, but the open must be reflected.
        assert_eq!(manager.equity(ts(1), &prices), dec!(10000));
        prices.insert("AAPL".to_string(), dec!(110));
        assert_eq!(manager.equity(ts(2), &prices), dec!(10100));
    }

    #[test]
    fn excursions_track_high_and_low() {
        let mut manager = PositionManager::new(dec!(10000));
        manager.open(long("AAPL", 10, dec!(100)), dec!(100), Decimal::ZERO);
        manager.update_excursions("AAPL", dec!(104), dec!(98));
        manager.update_excursions("AAPL", dec!(102), dec!(95));
        let position = manager.position("AAPL").unwrap();
        assert_eq!(position.max_favorable_excursion, dec!(4));
        assert_eq!(position.max_adverse_excursion, dec!(5));
    }
}
