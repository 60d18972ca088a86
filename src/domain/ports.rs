use crate::domain::errors::ExchangeError;
use crate::domain::trading::order::{ExecutionResult, Order, OrderAck};
use crate::domain::trading::position::{CloseReason, Position};
use crate::domain::trading::types::{Balance, ExchangePosition, Signal, Snapshot, Ticker};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

// Need async_trait for async functions in traits
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;
    async fn fetch_balance(&self) -> Result<Balance, ExchangeError>;
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;
    async fn place_order(&self, order: &Order) -> Result<OrderAck, ExchangeError>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;
}

/// Opaque decision engine. Idempotent for identical (rounded) inputs; a
/// caching implementation is free to serve repeated calls from cache.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn generate_signals(
        &self,
        snapshots: &[Snapshot],
        capital_chf: Decimal,
        open_positions: &[Position],
    ) -> Result<HashMap<String, Signal>>;
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn latest_snapshot(&self, symbol: &str) -> Result<Snapshot>;
    async fn ohlcv_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<crate::domain::trading::types::Candle>>;
}

/// Metrics emission point. Implementations must never fail the caller.
pub trait MetricsSink: Send + Sync {
    fn record_order(&self, symbol: &str, side: &str, success: bool, latency_ms: Decimal);
    fn record_trade(&self, kind: &str, fees: Decimal, realized_pnl: Option<Decimal>);
    fn record_cycle(&self, duration: Duration, signals: usize, executed: usize);
    fn set_open_positions(&self, count: u64);
    fn set_daily_pnl_chf(&self, pnl: Decimal);
    fn set_circuit_breaker_tripped(&self, tripped: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, level: AlertLevel, message: &str);
}

/// Narrow closing surface handed to the circuit breaker so it can flatten
/// the book without owning the whole executor.
#[async_trait]
pub trait PositionCloser: Send + Sync {
    async fn open_positions(&self) -> Result<Vec<Position>>;
    async fn close_position(&self, position: &Position, reason: CloseReason) -> ExecutionResult;
}
