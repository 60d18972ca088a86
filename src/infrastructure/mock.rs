//! In-memory implementations of the persistence and market-data ports.
//!
//! Used by the test suites and by paper-mode bootstrap when no database
//! is configured. All state lives under `Arc<RwLock>` so clones share.

use crate::domain::errors::StoreError;
use crate::domain::ports::{MarketDataProvider, MetricsSink, SignalSource};
use crate::domain::repositories::{AuditEvent, OrderStore, PositionStore, TradeHistory};
use crate::domain::trading::order::{Order, TradeRecord};
use crate::domain::trading::position::Position;
use crate::domain::trading::types::{Candle, Signal, Snapshot, Ticker};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct InMemoryPositionStore {
    positions: Arc<RwLock<HashMap<Uuid, Position>>>,
    audit: Arc<RwLock<Vec<AuditEvent>>>,
    daily_pnl: Arc<RwLock<HashMap<NaiveDate, Decimal>>>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.read().await.clone()
    }

    pub async fn daily_rollup(&self, date: NaiveDate) -> Decimal {
        self.daily_pnl
            .read()
            .await
            .get(&date)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn insert(&self, position: &Position, audit: &AuditEvent) -> Result<(), StoreError> {
        let mut positions = self.positions.write().await;
        if positions.contains_key(&position.id) {
            return Err(StoreError::Conflict(format!(
                "position {} already exists",
                position.id
            )));
        }
        positions.insert(position.id, position.clone());
        self.audit.write().await.push(audit.clone());
        Ok(())
    }

    async fn update(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = self.positions.write().await;
        match positions.get_mut(&position.id) {
            Some(existing) => {
                *existing = position.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("position {}", position.id))),
        }
    }

    async fn finalize_close(
        &self,
        position: &Position,
        audit: &AuditEvent,
    ) -> Result<(), StoreError> {
        {
            let mut positions = self.positions.write().await;
            match positions.get_mut(&position.id) {
                Some(existing) => *existing = position.clone(),
                None => {
                    return Err(StoreError::NotFound(format!("position {}", position.id)));
                }
            }
        }
        if let (Some(closed_at), Some(pnl)) = (position.closed_at, position.pnl_chf) {
            let mut rollup = self.daily_pnl.write().await;
            *rollup.entry(closed_at.date_naive()).or_default() += pnl;
        }
        self.audit.write().await.push(audit.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, StoreError> {
        let positions = self.positions.read().await;
        let mut open: Vec<Position> = positions
            .values()
            .filter(|p| p.is_open())
            .filter(|p| symbol.is_none_or(|s| p.symbol == s))
            .cloned()
            .collect();
        open.sort_by_key(|p| p.created_at);
        Ok(open)
    }

    async fn realized_pnl_for(&self, date: NaiveDate) -> Result<(Decimal, u64), StoreError> {
        let positions = self.positions.read().await;
        let mut total = Decimal::ZERO;
        let mut count = 0u64;
        for position in positions.values() {
            if let (Some(closed_at), Some(pnl)) = (position.closed_at, position.pnl_chf)
                && closed_at.date_naive() == date
            {
                total += pnl;
                count += 1;
            }
        }
        Ok((total, count))
    }

    async fn position_counts(&self) -> Result<(u64, u64, u64), StoreError> {
        let positions = self.positions.read().await;
        let total = positions.len() as u64;
        let open = positions.values().filter(|p| p.is_open()).count() as u64;
        Ok((total, open, total - open))
    }

    async fn append_audit(&self, audit: &AuditEvent) -> Result<(), StoreError> {
        self.audit.write().await.push(audit.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<Uuid, Order>>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Order> {
        self.orders.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save(&self, order: &Order) -> Result<(), StoreError> {
        self.orders.write().await.insert(order.id, order.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(&id).cloned())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTradeHistory {
    trades: Arc<RwLock<Vec<TradeRecord>>>,
}

impl InMemoryTradeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<TradeRecord> {
        self.trades.read().await.clone()
    }
}

#[async_trait]
impl TradeHistory for InMemoryTradeHistory {
    async fn record(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.trades.write().await.push(trade.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let trades = self.trades.read().await;
        Ok(trades.iter().rev().take(limit).cloned().collect())
    }
}

/// Market data provider backed by a settable price map. Snapshots carry
/// the last price as a flat ticker with no candle history.
#[derive(Clone, Default)]
pub struct StaticMarketData {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices
            .write()
            .await
            .insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl MarketDataProvider for StaticMarketData {
    async fn latest_snapshot(&self, symbol: &str) -> Result<Snapshot> {
        let prices = self.prices.read().await;
        let last = prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no price for {symbol}"))?;
        Ok(Snapshot {
            symbol: symbol.to_string(),
            ticker: Ticker {
                symbol: symbol.to_string(),
                last,
                bid: last,
                ask: last,
            },
            candles: Vec::new(),
        })
    }

    async fn ohlcv_history(&self, _symbol: &str, _limit: usize) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }
}

/// Signal source that replays a preloaded batch once, then holds.
/// Stands in for the external decision engine in tests and dry runs.
#[derive(Clone, Default)]
pub struct ScriptedSignalSource {
    pending: Arc<RwLock<Vec<HashMap<String, Signal>>>>,
}

impl ScriptedSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_batch(&self, signals: HashMap<String, Signal>) {
        self.pending.write().await.push(signals);
    }
}

#[async_trait]
impl SignalSource for ScriptedSignalSource {
    async fn generate_signals(
        &self,
        _snapshots: &[Snapshot],
        _capital_chf: Decimal,
        _open_positions: &[Position],
    ) -> Result<HashMap<String, Signal>> {
        let mut pending = self.pending.write().await;
        if pending.is_empty() {
            Ok(HashMap::new())
        } else {
            Ok(pending.remove(0))
        }
    }
}

/// Random-walk market data for dry runs without a live feed. Prices
/// drift a fraction of a percent on every read.
pub struct SimulatedMarketData {
    prices: RwLock<HashMap<String, Decimal>>,
}

impl SimulatedMarketData {
    pub fn new(symbols: &[String]) -> Self {
        use rust_decimal_macros::dec;
        let mut prices = HashMap::new();
        for symbol in symbols {
            let base = if symbol.contains("BTC") {
                dec!(96000)
            } else if symbol.contains("ETH") {
                dec!(3400)
            } else if symbol.contains("SOL") {
                dec!(150)
            } else if symbol.contains("BNB") {
                dec!(600)
            } else {
                dec!(0.5)
            };
            prices.insert(symbol.clone(), base);
        }
        Self {
            prices: RwLock::new(prices),
        }
    }
}

#[async_trait]
impl MarketDataProvider for SimulatedMarketData {
    async fn latest_snapshot(&self, symbol: &str) -> Result<Snapshot> {
        use rand::Rng;
        use rust_decimal::prelude::FromPrimitive;

        let mut prices = self.prices.write().await;
        let price = prices
            .get_mut(symbol)
            .ok_or_else(|| anyhow::anyhow!("unknown symbol {symbol}"))?;
        let drift = rand::rng().random_range(-0.001..=0.001);
        let drift = Decimal::from_f64(drift).unwrap_or(Decimal::ZERO);
        *price *= Decimal::ONE + drift;
        let last = *price;

        Ok(Snapshot {
            symbol: symbol.to_string(),
            ticker: Ticker {
                symbol: symbol.to_string(),
                last,
                bid: last,
                ask: last,
            },
            candles: Vec::new(),
        })
    }

    async fn ohlcv_history(&self, _symbol: &str, _limit: usize) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }
}

/// Signal source that always holds. The wiring point where a real
/// decision engine plugs in; useful for infrastructure dry runs.
#[derive(Clone, Copy, Default)]
pub struct HoldSignalSource;

#[async_trait]
impl SignalSource for HoldSignalSource {
    async fn generate_signals(
        &self,
        snapshots: &[Snapshot],
        _capital_chf: Decimal,
        _open_positions: &[Position],
    ) -> Result<HashMap<String, Signal>> {
        Ok(snapshots
            .iter()
            .map(|s| (s.symbol.clone(), Signal::hold(&s.symbol)))
            .collect())
    }
}

/// Metrics sink that drops everything.
#[derive(Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record_order(&self, _symbol: &str, _side: &str, _success: bool, _latency_ms: Decimal) {}
    fn record_trade(&self, _kind: &str, _fees: Decimal, _realized_pnl: Option<Decimal>) {}
    fn record_cycle(&self, _duration: Duration, _signals: usize, _executed: usize) {}
    fn set_open_positions(&self, _count: u64) {}
    fn set_daily_pnl_chf(&self, _pnl: Decimal) {}
    fn set_circuit_breaker_tripped(&self, _tripped: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_market_data_returns_set_price() {
        let market = StaticMarketData::new();
        market.set_price("BTC/USDT:USDT", dec!(50000)).await;

        let snapshot = market.latest_snapshot("BTC/USDT:USDT").await.unwrap();
        assert_eq!(snapshot.ticker.last, dec!(50000));
        assert!(market.latest_snapshot("ETH/USDT:USDT").await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_signals_replay_once() {
        let source = ScriptedSignalSource::new();
        let mut batch = HashMap::new();
        batch.insert("BTC/USDT:USDT".to_string(), Signal::hold("BTC/USDT:USDT"));
        source.push_batch(batch).await;

        let first = source.generate_signals(&[], dec!(1000), &[]).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = source.generate_signals(&[], dec!(1000), &[]).await.unwrap();
        assert!(second.is_empty());
    }
}
