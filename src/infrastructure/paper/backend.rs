use super::virtual_portfolio::{PortfolioError, VirtualPortfolio};
use crate::domain::errors::ExchangeError;
use crate::domain::ports::{ExchangeAdapter, MarketDataProvider};
use crate::domain::trading::money::round8;
use crate::domain::trading::order::{Order, OrderAck};
use crate::domain::trading::position::PositionSide;
use crate::domain::trading::types::{
    Balance, ExchangePosition, OrderSide, OrderStatus, OrderType, Ticker,
};
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub initial_balance: Decimal,
    pub taker_fee_pct: Decimal,
    pub slippage_enabled: bool,
    pub partial_fills_enabled: bool,
    /// Simulated exchange latency range in milliseconds.
    pub latency_ms: (u64, u64),
}

impl Default for PaperConfig {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            initial_balance: dec!(10000),
            taker_fee_pct: dec!(0.001),
            slippage_enabled: true,
            partial_fills_enabled: true,
            latency_ms: (50, 150),
        }
    }
}

/// Drop-in `ExchangeAdapter` that fills orders against a virtual
/// portfolio at live ticker prices. Never talks to a real exchange.
///
/// Market orders simulate latency, adverse slippage, partial fills, and
/// taker fees. Stop orders are accepted and rest as `Open` without ever
/// being matched; in paper mode the application monitor layers are the
/// effective stop enforcement.
pub struct PaperBackend {
    market_data: Arc<dyn MarketDataProvider>,
    config: PaperConfig,
    portfolio: RwLock<VirtualPortfolio>,
    resting_stops: RwLock<HashMap<String, Order>>,
    order_seq: AtomicU64,
}

impl PaperBackend {
    pub fn new(market_data: Arc<dyn MarketDataProvider>, config: PaperConfig) -> Self {
        info!(
            "PaperBackend: Initialized with ${} USDT (fees {}, slippage {}, partial fills {})",
            config.initial_balance,
            config.taker_fee_pct,
            config.slippage_enabled,
            config.partial_fills_enabled
        );
        let portfolio = VirtualPortfolio::new(config.initial_balance);
        Self {
            market_data,
            config,
            portfolio: RwLock::new(portfolio),
            resting_stops: RwLock::new(HashMap::new()),
            order_seq: AtomicU64::new(0),
        }
    }

    pub async fn portfolio(&self) -> VirtualPortfolio {
        self.portfolio.read().await.clone()
    }

    pub async fn resting_stop_count(&self) -> usize {
        self.resting_stops.read().await.len()
    }

    async fn simulate_latency(&self) {
        let (min, max) = self.config.latency_ms;
        if max == 0 {
            return;
        }
        let wait = {
            let mut rng = rand::rng();
            rng.random_range(min..=max.max(min))
        };
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }

    /// Execution price with 0-0.2% slippage, always adverse: buys fill
    /// higher, sells fill lower.
    fn apply_slippage(&self, side: OrderSide, price: Decimal) -> Decimal {
        if !self.config.slippage_enabled {
            return price;
        }
        let slip = rand::rng().random_range(0.0..=0.002);
        let slip = Decimal::from_f64(slip).unwrap_or(Decimal::ZERO);
        let adjusted = match side {
            OrderSide::Buy => price * (Decimal::ONE + slip),
            OrderSide::Sell => price * (Decimal::ONE - slip),
        };
        round8(adjusted)
    }

    /// 95-100% fill of the requested quantity.
    fn apply_partial_fill(&self, quantity: Decimal) -> Decimal {
        if !self.config.partial_fills_enabled {
            return quantity;
        }
        let fraction = rand::rng().random_range(0.95..=1.0);
        let fraction = Decimal::from_f64(fraction).unwrap_or(Decimal::ONE);
        round8(quantity * fraction)
    }

    fn next_order_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.market_data
            .latest_snapshot(symbol)
            .await
            .map(|snapshot| snapshot.ticker.last)
            .map_err(|e| ExchangeError::Network(format!("ticker unavailable: {e}")))
    }

    async fn fill_market(&self, order: &Order) -> Result<OrderAck, ExchangeError> {
        let last = self.last_price(&order.symbol).await?;
        let execution_price = self.apply_slippage(order.side, last);
        let filled_quantity = self.apply_partial_fill(order.quantity);
        let fees = round8(filled_quantity * execution_price * self.config.taker_fee_pct);

        let mut portfolio = self.portfolio.write().await;

        if order.side == OrderSide::Buy && !order.reduce_only {
            let cost = filled_quantity * execution_price + fees;
            if cost > portfolio.balance {
                return Err(ExchangeError::InsufficientFunds {
                    need: cost,
                    available: portfolio.balance,
                });
            }
        }

        if order.reduce_only {
            let pnl = portfolio
                .close_position(&order.symbol, execution_price, fees, Some(filled_quantity))
                .map_err(|e: PortfolioError| ExchangeError::InvalidOrder(e.to_string()))?;
            info!(
                "PaperBackend: Closed {} - P&L ${:.2}",
                order.symbol, pnl
            );
        } else {
            let side = match order.side {
                OrderSide::Buy => PositionSide::Long,
                OrderSide::Sell => PositionSide::Short,
            };
            portfolio.open_position(&order.symbol, side, filled_quantity, execution_price, fees);
            info!(
                "PaperBackend: Opened {} - qty {}, price ${:.2}",
                order.symbol, filled_quantity, execution_price
            );
        }

        Ok(OrderAck {
            exchange_order_id: self.next_order_id("paper"),
            status: OrderStatus::Filled,
            filled_quantity,
            average_fill_price: Some(execution_price),
            fees_paid: fees,
        })
    }

    async fn rest_stop(&self, order: &Order) -> Result<OrderAck, ExchangeError> {
        let Some(stop_price) = order.stop_price else {
            return Err(ExchangeError::InvalidOrder(
                "stop order without stop price".to_string(),
            ));
        };

        let exchange_order_id = self.next_order_id("paper_sl");
        let mut resting = order.clone();
        resting.exchange_order_id = Some(exchange_order_id.clone());
        resting.status = OrderStatus::Open;
        self.resting_stops
            .write()
            .await
            .insert(exchange_order_id.clone(), resting);

        debug!(
            "PaperBackend: Stop order resting for {} @ {}",
            order.symbol, stop_price
        );
        Ok(OrderAck {
            exchange_order_id,
            status: OrderStatus::Open,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            fees_paid: Decimal::ZERO,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for PaperBackend {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let last = self.last_price(symbol).await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: last,
            ask: last,
        })
    }

    async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        let portfolio = self.portfolio.read().await;
        Ok(Balance {
            total: portfolio.balance,
            free: portfolio.balance,
            used: Decimal::ZERO,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let portfolio = self.portfolio.read().await;
        Ok(portfolio
            .positions()
            .map(|position| ExchangePosition {
                symbol: position.symbol.clone(),
                contracts: position.quantity,
                side: position.side,
            })
            .collect())
    }

    async fn place_order(&self, order: &Order) -> Result<OrderAck, ExchangeError> {
        self.simulate_latency().await;

        match order.order_type {
            OrderType::Market => self.fill_market(order).await,
            OrderType::StopMarket => self.rest_stop(order).await,
            other => Err(ExchangeError::InvalidOrder(format!(
                "paper backend does not support {other} orders"
            ))),
        }
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let removed = self.resting_stops.write().await.remove(order_id);
        if removed.is_some() {
            debug!("PaperBackend: Canceled resting stop {order_id} for {symbol}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::StaticMarketData;
    use rust_decimal_macros::dec;

    fn flat_config() -> PaperConfig {
        PaperConfig {
            slippage_enabled: false,
            partial_fills_enabled: false,
            latency_ms: (0, 0),
            ..Default::default()
        }
    }

    async fn backend() -> (PaperBackend, Arc<StaticMarketData>) {
        let market = Arc::new(StaticMarketData::new());
        market.set_price("BTC/USDT:USDT", dec!(50000)).await;
        (PaperBackend::new(market.clone(), flat_config()), market)
    }

    #[tokio::test]
    async fn test_market_buy_fills_and_charges_taker_fee() {
        let (backend, _) = backend().await;
        let order = Order::market("BTC/USDT:USDT", OrderSide::Buy, dec!(0.01), false, None);

        let ack = backend.place_order(&order).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_quantity, dec!(0.01));
        assert_eq!(ack.average_fill_price, Some(dec!(50000)));
        // 0.01 * 50000 * 0.001
        assert_eq!(ack.fees_paid, dec!(0.5));

        let balance = backend.fetch_balance().await.unwrap();
        assert_eq!(balance.total, dec!(10000) - dec!(500) - dec!(0.5));
    }

    #[tokio::test]
    async fn test_round_trip_balance_is_initial_minus_fees() {
        let (backend, _) = backend().await;
        let open = Order::market("BTC/USDT:USDT", OrderSide::Buy, dec!(0.01), false, None);
        let open_ack = backend.place_order(&open).await.unwrap();

        let close = Order::market(
            "BTC/USDT:USDT",
            OrderSide::Sell,
            dec!(0.01),
            true,
            Some(uuid::Uuid::new_v4()),
        );
        let close_ack = backend.place_order(&close).await.unwrap();

        let balance = backend.fetch_balance().await.unwrap();
        assert_eq!(
            balance.total,
            dec!(10000) - open_ack.fees_paid - close_ack.fees_paid
        );
        assert!(backend.fetch_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejected() {
        let (backend, _) = backend().await;
        // 1 BTC at 50000 > 10000 balance
        let order = Order::market("BTC/USDT:USDT", OrderSide::Buy, dec!(1), false, None);
        let err = backend.place_order(&order).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_slippage_is_adverse() {
        let market = Arc::new(StaticMarketData::new());
        market.set_price("BTC/USDT:USDT", dec!(50000)).await;
        let backend = PaperBackend::new(
            market,
            PaperConfig {
                slippage_enabled: true,
                partial_fills_enabled: false,
                latency_ms: (0, 0),
                ..Default::default()
            },
        );

        for _ in 0..20 {
            let buy = Order::market("BTC/USDT:USDT", OrderSide::Buy, dec!(0.0001), false, None);
            let ack = backend.place_order(&buy).await.unwrap();
            let fill = ack.average_fill_price.unwrap();
            assert!(fill >= dec!(50000), "buy slipped favourably: {fill}");
            assert!(fill <= dec!(50100), "slippage above 0.2%: {fill}");
        }
    }

    #[tokio::test]
    async fn test_partial_fills_within_range() {
        let market = Arc::new(StaticMarketData::new());
        market.set_price("BTC/USDT:USDT", dec!(50000)).await;
        let backend = PaperBackend::new(
            market,
            PaperConfig {
                slippage_enabled: false,
                partial_fills_enabled: true,
                latency_ms: (0, 0),
                ..Default::default()
            },
        );

        let order = Order::market("BTC/USDT:USDT", OrderSide::Buy, dec!(0.01), false, None);
        let ack = backend.place_order(&order).await.unwrap();
        assert!(ack.filled_quantity >= dec!(0.0095));
        assert!(ack.filled_quantity <= dec!(0.01));
    }

    #[tokio::test]
    async fn test_stop_orders_rest_open_and_cancel() {
        let (backend, _) = backend().await;
        let open = Order::market("BTC/USDT:USDT", OrderSide::Buy, dec!(0.01), false, None);
        backend.place_order(&open).await.unwrap();

        let stop = Order::stop_market(
            "BTC/USDT:USDT",
            OrderSide::Sell,
            dec!(0.01),
            dec!(49000),
            Some(uuid::Uuid::new_v4()),
        );
        let ack = backend.place_order(&stop).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(ack.filled_quantity, Decimal::ZERO);
        assert_eq!(backend.resting_stop_count().await, 1);

        backend
            .cancel_order(&ack.exchange_order_id, "BTC/USDT:USDT")
            .await
            .unwrap();
        assert_eq!(backend.resting_stop_count().await, 0);
    }

    #[tokio::test]
    async fn test_short_open_reports_position() {
        let (backend, _) = backend().await;
        let order = Order::market("BTC/USDT:USDT", OrderSide::Sell, dec!(0.01), false, None);
        backend.place_order(&order).await.unwrap();

        let positions = backend.fetch_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].contracts, dec!(0.01));
    }
}
