use super::money::usd_to_chf;
use super::types::OrderSide;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens a position on this side.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position on this side.
    pub fn exit_order_side(self) -> OrderSide {
        self.entry_order_side().opposite()
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a position was closed. The wire form (`as_str`) is what lands in
/// the audit log and trade history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Manual,
    SignalClose,
    StopLoss,
    TakeProfit,
    Layer2StopLoss,
    Layer3Emergency,
    CircuitBreaker,
    Liquidation,
    ReconciliationNotOnExchange,
    OrderExecutionFailed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Manual => "manual_close",
            CloseReason::SignalClose => "signal_close",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Layer2StopLoss => "stop_loss_triggered_layer2",
            CloseReason::Layer3Emergency => "layer3_emergency_liquidation",
            CloseReason::CircuitBreaker => "circuit_breaker_triggered",
            CloseReason::Liquidation => "liquidation",
            CloseReason::ReconciliationNotOnExchange => "reconciliation_not_on_exchange",
            CloseReason::OrderExecutionFailed => "order_execution_failed",
        }
    }

    /// Liquidations get their own terminal status.
    pub fn terminal_status(self) -> PositionStatus {
        match self {
            CloseReason::Liquidation => PositionStatus::Liquidated,
            _ => PositionStatus::Closed,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authoritative local record of an open exposure.
///
/// A position is Open iff `closed_at` is `None`; `pnl_chf` is only set on
/// close. All mutations go through the position engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub leverage: u32,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    pub status: PositionStatus,
    pub pnl_chf: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open && self.closed_at.is_none()
    }

    /// Position value at entry, without leverage (margin commitment).
    pub fn value_usd(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Leveraged notional exposure at entry.
    pub fn exposure_usd(&self) -> Decimal {
        self.value_usd() * Decimal::from(self.leverage)
    }

    /// P&L at an arbitrary mark, leveraged, in USD.
    pub fn pnl_usd_at(&self, price: Decimal) -> Decimal {
        let per_unit = match self.side {
            PositionSide::Long => price - self.entry_price,
            PositionSide::Short => self.entry_price - price,
        };
        per_unit * self.quantity * Decimal::from(self.leverage)
    }

    pub fn unrealized_pnl_usd(&self) -> Decimal {
        self.pnl_usd_at(self.current_price)
    }

    pub fn unrealized_pnl_chf(&self, chf_to_usd_rate: Decimal) -> Decimal {
        usd_to_chf(self.unrealized_pnl_usd(), chf_to_usd_rate)
    }

    /// Adverse move from entry as a positive fraction; favourable moves
    /// report zero. Drives the emergency liquidation layer.
    pub fn loss_pct_at(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        let loss = match self.side {
            PositionSide::Long => self.entry_price - price,
            PositionSide::Short => price - self.entry_price,
        };
        (loss / self.entry_price).max(Decimal::ZERO)
    }

    /// True when `price` has crossed the stop in the adverse direction.
    pub fn stop_crossed_at(&self, price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price <= self.stop_loss,
            PositionSide::Short => price >= self.stop_loss,
        }
    }

    pub fn is_stop_loss_hit(&self) -> bool {
        self.stop_crossed_at(self.current_price)
    }

    pub fn is_take_profit_hit(&self) -> bool {
        match self.take_profit {
            Some(tp) => match self.side {
                PositionSide::Long => self.current_price >= tp,
                PositionSide::Short => self.current_price <= tp,
            },
            None => false,
        }
    }
}

/// Daily P&L rollup used by the circuit breaker and the risk gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPnlSummary {
    pub date: NaiveDate,
    pub total_pnl_chf: Decimal,
    pub realized_pnl_chf: Decimal,
    pub unrealized_pnl_chf: Decimal,
    pub open_positions: u64,
    pub closed_positions: u64,
    pub total_exposure_chf: Decimal,
    pub circuit_breaker_breached: bool,
}

/// Aggregate position counters for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionStatistics {
    pub total_positions: u64,
    pub open_positions: u64,
    pub closed_positions: u64,
    pub total_exposure_chf: Decimal,
    pub total_unrealized_pnl_chf: Decimal,
    pub total_realized_pnl_chf: Decimal,
    pub positions_at_stop_loss: u64,
    pub positions_at_take_profit: u64,
}
