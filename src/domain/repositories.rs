//! Repository traits for durable state.
//!
//! The position store is the single owner of position rows; the position
//! engine is its only mutator. Implementations must make `insert` and
//! `finalize_close` transactional (position row, audit entry, and daily
//! P&L rollup move together or not at all).

use crate::domain::errors::StoreError;
use crate::domain::trading::order::{Order, TradeRecord};
use crate::domain::trading::position::Position;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Append-only audit entry.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        details: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            details,
        }
    }
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Inserts a new position together with its audit entry, atomically.
    async fn insert(&self, position: &Position, audit: &AuditEvent) -> Result<(), StoreError>;

    /// Updates a mutable position row (price, quantity).
    async fn update(&self, position: &Position) -> Result<(), StoreError>;

    /// Persists a close: final position row, audit entry, and the daily
    /// P&L rollup for the close date, in one transaction.
    async fn finalize_close(
        &self,
        position: &Position,
        audit: &AuditEvent,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Position>, StoreError>;

    async fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, StoreError>;

    /// Realized P&L in CHF plus closed-position count for a calendar date.
    async fn realized_pnl_for(&self, date: NaiveDate) -> Result<(Decimal, u64), StoreError>;

    /// Position counts over the whole table: (total, open, closed).
    async fn position_counts(&self) -> Result<(u64, u64, u64), StoreError>;

    async fn append_audit(&self, audit: &AuditEvent) -> Result<(), StoreError>;
}

/// Order persistence. `save` upserts by local id so a retried submission
/// reuses its row.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save(&self, order: &Order) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError>;
}

/// Trade history sink; one record per fill.
#[async_trait]
pub trait TradeHistory: Send + Sync {
    async fn record(&self, trade: &TradeRecord) -> Result<(), StoreError>;
    async fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;
}
