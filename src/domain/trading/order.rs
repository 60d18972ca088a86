use super::position::CloseReason;
use super::types::{OrderSide, OrderStatus, OrderType, TimeInForce};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Request-to-exchange record.
///
/// The local `id` is assigned before submission and survives retries;
/// `exchange_order_id` is attached on the first acknowledgement. A
/// reduce-only order must reference an open position via `position_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub position_id: Option<Uuid>,
    pub fees_paid: Decimal,
    pub latency_ms: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
        position_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            exchange_order_id: None,
            symbol: symbol.into(),
            order_type: OrderType::Market,
            side,
            quantity,
            price: None,
            stop_price: None,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            status: OrderStatus::Pending,
            time_in_force: TimeInForce::Gtc,
            reduce_only,
            position_id,
            fees_paid: Decimal::ZERO,
            latency_ms: None,
            created_at: Utc::now(),
            submitted_at: None,
            filled_at: None,
        }
    }

    pub fn stop_market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
        position_id: Option<Uuid>,
    ) -> Self {
        let mut order = Self::market(symbol, side, quantity, true, position_id);
        order.order_type = OrderType::StopMarket;
        order.stop_price = Some(stop_price);
        order
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }
}

/// Exchange acknowledgement for a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub fees_paid: Decimal,
}

/// Machine-readable failure codes carried by `ExecutionResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionErrorCode {
    RiskValidationFailed,
    PositionNotFound,
    InvalidSymbol,
    InvalidOrder,
    InsufficientFunds,
    NetworkError,
    RateLimitExceeded,
    ReduceOnlyViolation,
    StopOrderError,
    PositionOpenError,
    ExecutionError,
}

impl ExecutionErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionErrorCode::RiskValidationFailed => "RISK_VALIDATION_FAILED",
            ExecutionErrorCode::PositionNotFound => "POSITION_NOT_FOUND",
            ExecutionErrorCode::InvalidSymbol => "INVALID_SYMBOL",
            ExecutionErrorCode::InvalidOrder => "INVALID_ORDER",
            ExecutionErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ExecutionErrorCode::NetworkError => "NETWORK_ERROR",
            ExecutionErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ExecutionErrorCode::ReduceOnlyViolation => "REDUCE_ONLY_VIOLATION",
            ExecutionErrorCode::StopOrderError => "STOP_ORDER_ERROR",
            ExecutionErrorCode::PositionOpenError => "POSITION_OPEN_ERROR",
            ExecutionErrorCode::ExecutionError => "EXECUTION_ERROR",
        }
    }
}

impl fmt::Display for ExecutionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one executor operation. Rejections and failures are values
/// here, not errors; callers inspect `success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub order: Option<Order>,
    pub error_code: Option<ExecutionErrorCode>,
    pub error_message: Option<String>,
    pub latency_ms: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn ok(order: Option<Order>, latency_ms: Decimal) -> Self {
        Self {
            success: true,
            order,
            error_code: None,
            error_message: None,
            latency_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        code: ExecutionErrorCode,
        message: impl Into<String>,
        latency_ms: Decimal,
    ) -> Self {
        Self {
            success: false,
            order: None,
            error_code: Some(code),
            error_message: Some(message.into()),
            latency_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn is_code(&self, code: ExecutionErrorCode) -> bool {
        self.error_code == Some(code)
    }
}

/// Classification of a fill for the trade history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeKind {
    EntryLong,
    EntryShort,
    ExitLong,
    ExitShort,
    StopLoss,
    TakeProfit,
    Liquidation,
}

impl TradeKind {
    /// Derives the trade kind from the order shape: opening orders map by
    /// side, closing orders map by close reason first, then side.
    pub fn classify(side: OrderSide, reduce_only: bool, reason: Option<CloseReason>) -> Self {
        if !reduce_only {
            return match side {
                OrderSide::Buy => TradeKind::EntryLong,
                OrderSide::Sell => TradeKind::EntryShort,
            };
        }
        match reason {
            Some(CloseReason::StopLoss) | Some(CloseReason::Layer2StopLoss) => TradeKind::StopLoss,
            Some(CloseReason::TakeProfit) => TradeKind::TakeProfit,
            Some(CloseReason::Liquidation) | Some(CloseReason::Layer3Emergency) => {
                TradeKind::Liquidation
            }
            _ => match side {
                OrderSide::Sell => TradeKind::ExitLong,
                OrderSide::Buy => TradeKind::ExitShort,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeKind::EntryLong => "entry_long",
            TradeKind::EntryShort => "entry_short",
            TradeKind::ExitLong => "exit_long",
            TradeKind::ExitShort => "exit_short",
            TradeKind::StopLoss => "stop_loss",
            TradeKind::TakeProfit => "take_profit",
            TradeKind::Liquidation => "liquidation",
        }
    }
}

/// One row of trade history: a fill plus its execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub kind: TradeKind,
    pub symbol: String,
    pub order_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub position_id: Option<Uuid>,
    pub realized_pnl: Option<Decimal>,
    pub latency_ms: Decimal,
    pub timestamp: DateTime<Utc>,
}
