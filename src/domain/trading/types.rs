use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::StopMarket => write!(f, "STOP_MARKET"),
            OrderType::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// Lifecycle of an order from local creation to terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged by the exchange
    Pending,
    /// Resting on the exchange, awaiting fill
    Open,
    Filled,
    PartiallyFilled,
    Canceled,
    Failed,
    Expired,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    PostOnly,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
            TimeInForce::PostOnly => write!(f, "POST_ONLY"),
        }
    }
}

/// Per-symbol trading intent produced by the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Buy,
    Sell,
    Hold,
    Close,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Trading signal as emitted by a `SignalSource`.
///
/// `size_pct` is the fraction of capital to commit (0..=1);
/// `stop_loss_pct` / `take_profit_pct` are distances from entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub decision: Decision,
    pub confidence: Decimal,
    pub size_pct: Decimal,
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
    pub leverage: Option<u32>,
    pub reasoning: String,
}

impl Signal {
    pub fn hold(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            decision: Decision::Hold,
            confidence: Decimal::ZERO,
            size_pct: Decimal::ZERO,
            stop_loss_pct: None,
            take_profit_pct: None,
            leverage: None,
            reasoning: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
}

/// USDT account balance as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub total: Decimal,
    pub free: Decimal,
    pub used: Decimal,
}

/// Open exposure as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub contracts: Decimal,
    pub side: super::position::PositionSide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: i64,
}

/// Market snapshot handed to the decision engine: last ticker plus
/// whatever candle history the provider keeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub ticker: Ticker,
    pub candles: Vec<Candle>,
}

// ===== Symbol validation =====

/// Checks that a symbol names a perpetual contract in `BASE/QUOTE:SETTLE`
/// form (e.g. `BTC/USDT:USDT`). Spot-style symbols without a settlement
/// currency are rejected before any API call is made.
pub fn is_perpetual_symbol(symbol: &str) -> bool {
    match symbol.split_once(':') {
        Some((pair, settle)) => pair.contains('/') && !settle.is_empty(),
        None => false,
    }
}

/// Extracts the base currency from a perpetual symbol.
pub fn base_currency(symbol: &str) -> Option<&str> {
    symbol.split_once('/').map(|(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perpetual_symbol_accepted() {
        assert!(is_perpetual_symbol("BTC/USDT:USDT"));
        assert!(is_perpetual_symbol("ETH/USDT:USDT"));
        assert!(is_perpetual_symbol("DOGE/USDT:USDT"));
    }

    #[test]
    fn test_spot_symbol_rejected() {
        assert!(!is_perpetual_symbol("BTC/USDT"));
        assert!(!is_perpetual_symbol("BTCUSDT"));
        assert!(!is_perpetual_symbol("BTC/USDT:"));
        assert!(!is_perpetual_symbol(""));
    }

    #[test]
    fn test_base_currency() {
        assert_eq!(base_currency("BTC/USDT:USDT"), Some("BTC"));
        assert_eq!(base_currency("SOL/USDT:USDT"), Some("SOL"));
        assert_eq!(base_currency("NOSLASH"), None);
    }

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }
}
