use crate::domain::trading::position::PositionSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("No position for {0}")]
    NoPosition(String),

    #[error("Cannot close {requested} - only {available} available")]
    ExceedsPosition {
        requested: Decimal,
        available: Decimal,
    },
}

#[derive(Debug, Clone)]
pub struct VirtualPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub total_fees: Decimal,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub total_fees: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// In-memory portfolio for paper trading: balance, open positions with
/// weighted-average entries, and closed-trade history. All figures are
/// cash flows in USDT, fee-inclusive and unleveraged.
#[derive(Debug, Clone)]
pub struct VirtualPortfolio {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    positions: HashMap<String, VirtualPosition>,
    closed: Vec<ClosedTrade>,
}

impl VirtualPortfolio {
    pub fn new(initial_balance: Decimal) -> Self {
        info!(
            "VirtualPortfolio: Initialized with ${} USDT",
            initial_balance
        );
        Self {
            initial_balance,
            balance: initial_balance,
            positions: HashMap::new(),
            closed: Vec::new(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&VirtualPosition> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &VirtualPosition> {
        self.positions.values()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    /// Opens or adds to a position. Adding computes a weighted-average
    /// entry price over the combined quantity.
    pub fn open_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        fees: Decimal,
    ) {
        match self.positions.get_mut(symbol) {
            Some(position) => {
                let total_quantity = position.quantity + quantity;
                let avg_price = (position.entry_price * position.quantity
                    + entry_price * quantity)
                    / total_quantity;
                position.quantity = total_quantity;
                position.entry_price = avg_price;
                position.total_fees += fees;
                info!(
                    "VirtualPortfolio: Added to {symbol}: qty {total_quantity}, avg ${avg_price:.2}"
                );
            }
            None => {
                self.positions.insert(
                    symbol.to_string(),
                    VirtualPosition {
                        symbol: symbol.to_string(),
                        side,
                        quantity,
                        entry_price,
                        total_fees: fees,
                        opened_at: Utc::now(),
                    },
                );
                info!(
                    "VirtualPortfolio: Opened {side} {symbol}: qty {quantity} @ ${entry_price:.2}"
                );
            }
        }

        match side {
            PositionSide::Long => self.balance -= quantity * entry_price + fees,
            // Shorts credit proceeds up front
            PositionSide::Short => self.balance += quantity * entry_price - fees,
        }
    }

    /// Closes a position fully or partially and returns the realized
    /// P&L net of the closing fee.
    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: Decimal,
        fees: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<Decimal, PortfolioError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| PortfolioError::NoPosition(symbol.to_string()))?;

        let close_quantity = quantity.unwrap_or(position.quantity);
        if close_quantity > position.quantity {
            return Err(PortfolioError::ExceedsPosition {
                requested: close_quantity,
                available: position.quantity,
            });
        }

        let mut pnl = match position.side {
            PositionSide::Long => (exit_price - position.entry_price) * close_quantity,
            PositionSide::Short => (position.entry_price - exit_price) * close_quantity,
        };
        pnl -= fees;

        match position.side {
            PositionSide::Long => self.balance += close_quantity * exit_price - fees,
            PositionSide::Short => self.balance -= close_quantity * exit_price + fees,
        }

        let record = ClosedTrade {
            symbol: symbol.to_string(),
            side: position.side,
            quantity: close_quantity,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            total_fees: position.total_fees + fees,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        };
        self.closed.push(record);

        if close_quantity >= position.quantity {
            self.positions.remove(symbol);
            info!("VirtualPortfolio: Closed {symbol} fully, P&L ${pnl:.2}");
        } else {
            position.quantity -= close_quantity;
            info!(
                "VirtualPortfolio: Partially closed {symbol} ({close_quantity}), P&L ${pnl:.2}"
            );
        }

        Ok(pnl)
    }

    pub fn unrealized_pnl(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .filter_map(|position| {
                prices.get(&position.symbol).map(|price| match position.side {
                    PositionSide::Long => (*price - position.entry_price) * position.quantity,
                    PositionSide::Short => (position.entry_price - *price) * position.quantity,
                })
            })
            .sum()
    }

    pub fn equity(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.balance + self.unrealized_pnl(prices)
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.closed.iter().map(|t| t.pnl).sum()
    }

    /// Win/loss counters over closed trades.
    pub fn performance(&self) -> (usize, usize, Decimal) {
        let wins = self.closed.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        let losses = self.closed.iter().filter(|t| t.pnl < Decimal::ZERO).count();
        (wins, losses, self.realized_pnl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_round_trip_at_entry_loses_only_fees() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        portfolio.open_position("BTC/USDT:USDT", PositionSide::Long, dec!(0.1), dec!(100), dec!(0.01));
        let pnl = portfolio
            .close_position("BTC/USDT:USDT", dec!(100), dec!(0.01), None)
            .unwrap();

        assert_eq!(pnl, dec!(-0.01));
        assert_eq!(portfolio.balance, dec!(10000) - dec!(0.02));
        assert!(portfolio.position("BTC/USDT:USDT").is_none());
    }

    #[test]
    fn test_long_profit() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        portfolio.open_position("BTC/USDT:USDT", PositionSide::Long, dec!(1), dec!(100), Decimal::ZERO);
        let pnl = portfolio
            .close_position("BTC/USDT:USDT", dec!(110), Decimal::ZERO, None)
            .unwrap();
        assert_eq!(pnl, dec!(10));
        assert_eq!(portfolio.balance, dec!(10010));
    }

    #[test]
    fn test_short_profit() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        portfolio.open_position("ETH/USDT:USDT", PositionSide::Short, dec!(1), dec!(100), Decimal::ZERO);
        // Short credits proceeds on open
        assert_eq!(portfolio.balance, dec!(10100));
        let pnl = portfolio
            .close_position("ETH/USDT:USDT", dec!(90), Decimal::ZERO, None)
            .unwrap();
        assert_eq!(pnl, dec!(10));
        assert_eq!(portfolio.balance, dec!(10010));
    }

    #[test]
    fn test_weighted_average_entry() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        portfolio.open_position("BTC/USDT:USDT", PositionSide::Long, dec!(1), dec!(100), Decimal::ZERO);
        portfolio.open_position("BTC/USDT:USDT", PositionSide::Long, dec!(1), dec!(110), Decimal::ZERO);

        let position = portfolio.position("BTC/USDT:USDT").unwrap();
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.entry_price, dec!(105));
    }

    #[test]
    fn test_partial_close_keeps_remainder() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        portfolio.open_position("BTC/USDT:USDT", PositionSide::Long, dec!(2), dec!(100), Decimal::ZERO);
        let pnl = portfolio
            .close_position("BTC/USDT:USDT", dec!(105), Decimal::ZERO, Some(dec!(1)))
            .unwrap();
        assert_eq!(pnl, dec!(5));
        assert_eq!(portfolio.position("BTC/USDT:USDT").unwrap().quantity, dec!(1));
    }

    #[test]
    fn test_close_missing_position_errors() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        assert!(matches!(
            portfolio.close_position("BTC/USDT:USDT", dec!(100), Decimal::ZERO, None),
            Err(PortfolioError::NoPosition(_))
        ));
    }

    #[test]
    fn test_close_more_than_held_errors() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        portfolio.open_position("BTC/USDT:USDT", PositionSide::Long, dec!(1), dec!(100), Decimal::ZERO);
        assert!(matches!(
            portfolio.close_position("BTC/USDT:USDT", dec!(100), Decimal::ZERO, Some(dec!(2))),
            Err(PortfolioError::ExceedsPosition { .. })
        ));
    }

    #[test]
    fn test_unrealized_and_equity() {
        let mut portfolio = VirtualPortfolio::new(dec!(10000));
        portfolio.open_position("BTC/USDT:USDT", PositionSide::Long, dec!(1), dec!(100), Decimal::ZERO);

        let prices = HashMap::from([("BTC/USDT:USDT".to_string(), dec!(120))]);
        assert_eq!(portfolio.unrealized_pnl(&prices), dec!(20));
        // balance 9900 + unrealized 20 + position cost basis is embedded in balance
        assert_eq!(portfolio.equity(&prices), dec!(9920));
    }
}
