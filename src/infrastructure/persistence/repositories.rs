//! SQLite-backed implementations of the repository traits.
//!
//! Monetary columns are stored as decimal TEXT and parsed back through
//! `rust_decimal`; timestamps are RFC 3339 TEXT in UTC.

use crate::domain::errors::StoreError;
use crate::domain::repositories::{AuditEvent, OrderStore, PositionStore, TradeHistory};
use crate::domain::trading::order::{Order, TradeKind, TradeRecord};
use crate::domain::trading::position::{Position, PositionSide, PositionStatus};
use crate::domain::trading::types::{OrderSide, OrderStatus, OrderType, TimeInForce};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
        sqlx::Error::PoolTimedOut => StoreError::Timeout("connection pool timed out".to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Backend(format!("unparseable {what}: {value}"))
}

fn parse_decimal(value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value).map_err(|_| corrupt("decimal", value))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", value))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::from_str(value).map_err(|_| corrupt("uuid", value))
}

fn position_side_from(value: &str) -> Result<PositionSide, StoreError> {
    match value {
        "LONG" => Ok(PositionSide::Long),
        "SHORT" => Ok(PositionSide::Short),
        other => Err(corrupt("position side", other)),
    }
}

fn position_status_from(value: &str) -> Result<PositionStatus, StoreError> {
    match value {
        "Open" => Ok(PositionStatus::Open),
        "Closed" => Ok(PositionStatus::Closed),
        "Liquidated" => Ok(PositionStatus::Liquidated),
        other => Err(corrupt("position status", other)),
    }
}

fn order_side_from(value: &str) -> Result<OrderSide, StoreError> {
    match value {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(corrupt("order side", other)),
    }
}

fn order_type_from(value: &str) -> Result<OrderType, StoreError> {
    match value {
        "MARKET" => Ok(OrderType::Market),
        "LIMIT" => Ok(OrderType::Limit),
        "STOP_MARKET" => Ok(OrderType::StopMarket),
        "STOP_LIMIT" => Ok(OrderType::StopLimit),
        other => Err(corrupt("order type", other)),
    }
}

fn order_status_from(value: &str) -> Result<OrderStatus, StoreError> {
    match value {
        "Pending" => Ok(OrderStatus::Pending),
        "Open" => Ok(OrderStatus::Open),
        "Filled" => Ok(OrderStatus::Filled),
        "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
        "Canceled" => Ok(OrderStatus::Canceled),
        "Failed" => Ok(OrderStatus::Failed),
        "Expired" => Ok(OrderStatus::Expired),
        other => Err(corrupt("order status", other)),
    }
}

fn time_in_force_from(value: &str) -> Result<TimeInForce, StoreError> {
    match value {
        "GTC" => Ok(TimeInForce::Gtc),
        "IOC" => Ok(TimeInForce::Ioc),
        "FOK" => Ok(TimeInForce::Fok),
        "POST_ONLY" => Ok(TimeInForce::PostOnly),
        other => Err(corrupt("time in force", other)),
    }
}

fn trade_kind_from(value: &str) -> Result<TradeKind, StoreError> {
    match value {
        "entry_long" => Ok(TradeKind::EntryLong),
        "entry_short" => Ok(TradeKind::EntryShort),
        "exit_long" => Ok(TradeKind::ExitLong),
        "exit_short" => Ok(TradeKind::ExitShort),
        "stop_loss" => Ok(TradeKind::StopLoss),
        "take_profit" => Ok(TradeKind::TakeProfit),
        "liquidation" => Ok(TradeKind::Liquidation),
        other => Err(corrupt("trade kind", other)),
    }
}

fn position_from_row(row: &SqliteRow) -> Result<Position, StoreError> {
    let take_profit: Option<String> = row.try_get("take_profit").map_err(map_sqlx)?;
    let pnl_chf: Option<String> = row.try_get("pnl_chf").map_err(map_sqlx)?;
    let closed_at: Option<String> = row.try_get("closed_at").map_err(map_sqlx)?;

    Ok(Position {
        id: parse_uuid(row.try_get("id").map_err(map_sqlx)?)?,
        symbol: row.try_get("symbol").map_err(map_sqlx)?,
        side: position_side_from(row.try_get("side").map_err(map_sqlx)?)?,
        quantity: parse_decimal(row.try_get("quantity").map_err(map_sqlx)?)?,
        entry_price: parse_decimal(row.try_get("entry_price").map_err(map_sqlx)?)?,
        current_price: parse_decimal(row.try_get("current_price").map_err(map_sqlx)?)?,
        leverage: row.try_get::<i64, _>("leverage").map_err(map_sqlx)? as u32,
        stop_loss: parse_decimal(row.try_get("stop_loss").map_err(map_sqlx)?)?,
        take_profit: take_profit.as_deref().map(parse_decimal).transpose()?,
        status: position_status_from(row.try_get("status").map_err(map_sqlx)?)?,
        pnl_chf: pnl_chf.as_deref().map(parse_decimal).transpose()?,
        created_at: parse_datetime(row.try_get("created_at").map_err(map_sqlx)?)?,
        updated_at: parse_datetime(row.try_get("updated_at").map_err(map_sqlx)?)?,
        closed_at: closed_at.as_deref().map(parse_datetime).transpose()?,
    })
}

#[derive(Clone)]
pub struct SqlitePositionStore {
    pool: SqlitePool,
}

impl SqlitePositionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_audit(
        conn: &mut sqlx::SqliteConnection,
        audit: &AuditEvent,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (timestamp, event_type, entity_type, entity_id, details)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(audit.timestamp.to_rfc3339())
        .bind(&audit.event_type)
        .bind(&audit.entity_type)
        .bind(&audit.entity_id)
        .bind(audit.details.to_string())
        .execute(conn)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn insert(&self, position: &Position, audit: &AuditEvent) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, side, quantity, entry_price, current_price,
                leverage, stop_loss, take_profit, status, pnl_chf,
                created_at, updated_at, closed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(position.id.to_string())
        .bind(&position.symbol)
        .bind(position.side.to_string())
        .bind(position.quantity.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.current_price.to_string())
        .bind(position.leverage as i64)
        .bind(position.stop_loss.to_string())
        .bind(position.take_profit.map(|tp| tp.to_string()))
        .bind(position.status.to_string())
        .bind(position.pnl_chf.map(|p| p.to_string()))
        .bind(position.created_at.to_rfc3339())
        .bind(position.updated_at.to_rfc3339())
        .bind(position.closed_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        Self::insert_audit(&mut *tx, audit).await?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn update(&self, position: &Position) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET quantity = ?1, current_price = ?2, stop_loss = ?3,
                take_profit = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(position.quantity.to_string())
        .bind(position.current_price.to_string())
        .bind(position.stop_loss.to_string())
        .bind(position.take_profit.map(|tp| tp.to_string()))
        .bind(position.updated_at.to_rfc3339())
        .bind(position.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("position {}", position.id)));
        }
        Ok(())
    }

    async fn finalize_close(
        &self,
        position: &Position,
        audit: &AuditEvent,
    ) -> Result<(), StoreError> {
        let (Some(closed_at), Some(pnl_chf)) = (position.closed_at, position.pnl_chf) else {
            return Err(StoreError::Conflict(format!(
                "position {} is not closed",
                position.id
            )));
        };

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = ?1, current_price = ?2, pnl_chf = ?3,
                closed_at = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(position.status.to_string())
        .bind(position.current_price.to_string())
        .bind(pnl_chf.to_string())
        .bind(closed_at.to_rfc3339())
        .bind(position.updated_at.to_rfc3339())
        .bind(position.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("position {}", position.id)));
        }

        Self::insert_audit(&mut *tx, audit).await?;

        // Roll realized P&L into the per-date aggregate. TEXT decimals
        // cannot be summed in SQL, so accumulate inside the transaction.
        let date = closed_at.date_naive().to_string();
        let existing: Option<String> =
            sqlx::query_scalar("SELECT pnl_chf FROM daily_pnl WHERE date = ?1")
                .bind(&date)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        let rolled = match existing.as_deref() {
            Some(value) => parse_decimal(value)? + pnl_chf,
            None => pnl_chf,
        };
        sqlx::query(
            r#"
            INSERT INTO daily_pnl (date, pnl_chf) VALUES (?1, ?2)
            ON CONFLICT (date) DO UPDATE SET pnl_chf = excluded.pnl_chf
            "#,
        )
        .bind(&date)
        .bind(rolled.to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, StoreError> {
        let rows = match symbol {
            Some(symbol) => {
                sqlx::query(
                    "SELECT * FROM positions WHERE status = 'Open' AND symbol = ?1 ORDER BY created_at",
                )
                .bind(symbol)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM positions WHERE status = 'Open' ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;

        rows.iter().map(position_from_row).collect()
    }

    async fn realized_pnl_for(&self, date: NaiveDate) -> Result<(Decimal, u64), StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT pnl_chf FROM positions
            WHERE status IN ('Closed', 'Liquidated')
              AND pnl_chf IS NOT NULL
              AND closed_at LIKE ?1 || '%'
            "#,
        )
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut total = Decimal::ZERO;
        for row in &rows {
            total += parse_decimal(row.try_get("pnl_chf").map_err(map_sqlx)?)?;
        }
        Ok((total, rows.len() as u64))
    }

    async fn position_counts(&self) -> Result<(u64, u64, u64), StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN status = 'Open' THEN 1 ELSE 0 END) AS open
            FROM positions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let total: i64 = row.try_get("total").map_err(map_sqlx)?;
        let open: Option<i64> = row.try_get("open").map_err(map_sqlx)?;
        let open = open.unwrap_or(0);
        Ok((total as u64, open as u64, (total - open) as u64))
    }

    async fn append_audit(&self, audit: &AuditEvent) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        Self::insert_audit(&mut *conn, audit).await
    }
}

#[derive(Clone)]
pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn save(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO orders (
                id, exchange_order_id, symbol, order_type, side, quantity,
                price, stop_price, filled_quantity, average_fill_price,
                status, time_in_force, reduce_only, position_id, fees_paid,
                latency_ms, created_at, submitted_at, filled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
        )
        .bind(order.id.to_string())
        .bind(order.exchange_order_id.as_deref())
        .bind(&order.symbol)
        .bind(order.order_type.to_string())
        .bind(order.side.to_string())
        .bind(order.quantity.to_string())
        .bind(order.price.map(|p| p.to_string()))
        .bind(order.stop_price.map(|p| p.to_string()))
        .bind(order.filled_quantity.to_string())
        .bind(order.average_fill_price.map(|p| p.to_string()))
        .bind(order.status.to_string())
        .bind(order.time_in_force.to_string())
        .bind(order.reduce_only as i64)
        .bind(order.position_id.map(|id| id.to_string()))
        .bind(order.fees_paid.to_string())
        .bind(order.latency_ms.map(|l| l.to_string()))
        .bind(order.created_at.to_rfc3339())
        .bind(order.submitted_at.map(|t| t.to_rfc3339()))
        .bind(order.filled_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else { return Ok(None) };

        let exchange_order_id: Option<String> =
            row.try_get("exchange_order_id").map_err(map_sqlx)?;
        let price: Option<String> = row.try_get("price").map_err(map_sqlx)?;
        let stop_price: Option<String> = row.try_get("stop_price").map_err(map_sqlx)?;
        let average_fill_price: Option<String> =
            row.try_get("average_fill_price").map_err(map_sqlx)?;
        let position_id: Option<String> = row.try_get("position_id").map_err(map_sqlx)?;
        let latency_ms: Option<String> = row.try_get("latency_ms").map_err(map_sqlx)?;
        let submitted_at: Option<String> = row.try_get("submitted_at").map_err(map_sqlx)?;
        let filled_at: Option<String> = row.try_get("filled_at").map_err(map_sqlx)?;

        Ok(Some(Order {
            id: parse_uuid(row.try_get("id").map_err(map_sqlx)?)?,
            exchange_order_id,
            symbol: row.try_get("symbol").map_err(map_sqlx)?,
            order_type: order_type_from(row.try_get("order_type").map_err(map_sqlx)?)?,
            side: order_side_from(row.try_get("side").map_err(map_sqlx)?)?,
            quantity: parse_decimal(row.try_get("quantity").map_err(map_sqlx)?)?,
            price: price.as_deref().map(parse_decimal).transpose()?,
            stop_price: stop_price.as_deref().map(parse_decimal).transpose()?,
            filled_quantity: parse_decimal(row.try_get("filled_quantity").map_err(map_sqlx)?)?,
            average_fill_price: average_fill_price
                .as_deref()
                .map(parse_decimal)
                .transpose()?,
            status: order_status_from(row.try_get("status").map_err(map_sqlx)?)?,
            time_in_force: time_in_force_from(row.try_get("time_in_force").map_err(map_sqlx)?)?,
            reduce_only: row.try_get::<i64, _>("reduce_only").map_err(map_sqlx)? != 0,
            position_id: position_id.as_deref().map(parse_uuid).transpose()?,
            fees_paid: parse_decimal(row.try_get("fees_paid").map_err(map_sqlx)?)?,
            latency_ms: latency_ms.as_deref().map(parse_decimal).transpose()?,
            created_at: parse_datetime(row.try_get("created_at").map_err(map_sqlx)?)?,
            submitted_at: submitted_at.as_deref().map(parse_datetime).transpose()?,
            filled_at: filled_at.as_deref().map(parse_datetime).transpose()?,
        }))
    }
}

#[derive(Clone)]
pub struct SqliteTradeHistory {
    pool: SqlitePool,
}

impl SqliteTradeHistory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeHistory for SqliteTradeHistory {
    async fn record(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                kind, symbol, order_id, side, quantity, price, fees,
                position_id, realized_pnl, latency_ms, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(trade.kind.as_str())
        .bind(&trade.symbol)
        .bind(&trade.order_id)
        .bind(trade.side.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.price.to_string())
        .bind(trade.fees.to_string())
        .bind(trade.position_id.map(|id| id.to_string()))
        .bind(trade.realized_pnl.map(|p| p.to_string()))
        .bind(trade.latency_ms.to_string())
        .bind(trade.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY id DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let position_id: Option<String> = row.try_get("position_id").map_err(map_sqlx)?;
                let realized_pnl: Option<String> =
                    row.try_get("realized_pnl").map_err(map_sqlx)?;
                Ok(TradeRecord {
                    kind: trade_kind_from(row.try_get("kind").map_err(map_sqlx)?)?,
                    symbol: row.try_get("symbol").map_err(map_sqlx)?,
                    order_id: row.try_get("order_id").map_err(map_sqlx)?,
                    side: order_side_from(row.try_get("side").map_err(map_sqlx)?)?,
                    quantity: parse_decimal(row.try_get("quantity").map_err(map_sqlx)?)?,
                    price: parse_decimal(row.try_get("price").map_err(map_sqlx)?)?,
                    fees: parse_decimal(row.try_get("fees").map_err(map_sqlx)?)?,
                    position_id: position_id.as_deref().map(parse_uuid).transpose()?,
                    realized_pnl: realized_pnl.as_deref().map(parse_decimal).transpose()?,
                    latency_ms: parse_decimal(row.try_get("latency_ms").map_err(map_sqlx)?)?,
                    timestamp: parse_datetime(row.try_get("timestamp").map_err(map_sqlx)?)?,
                })
            })
            .collect()
    }
}
