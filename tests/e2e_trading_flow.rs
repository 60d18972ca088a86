//! End-to-end paper trading flow: signal in, sized order out, position
//! lifecycle, trade history, and daily P&L rollup.

use perpetuum::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use perpetuum::application::executor::{ExecutorConfig, TradeExecutor};
use perpetuum::application::position_engine::{PositionEngine, PositionEngineConfig};
use perpetuum::application::risk_gate::{RiskGate, RiskLimits};
use perpetuum::domain::ports::{AlertLevel, AlertSink, ExchangeAdapter};
use perpetuum::domain::trading::order::{ExecutionErrorCode, TradeKind};
use perpetuum::domain::trading::position::{PositionSide, PositionStatus};
use perpetuum::domain::trading::types::{Decision, Signal};
use perpetuum::infrastructure::mock::{
    InMemoryOrderStore, InMemoryPositionStore, InMemoryTradeHistory, NullMetrics, StaticMarketData,
};
use perpetuum::infrastructure::paper::backend::{PaperBackend, PaperConfig};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct SilentAlerts;

#[async_trait]
impl AlertSink for SilentAlerts {
    async fn send(&self, _level: AlertLevel, _message: &str) {}
}

struct PaperHarness {
    market: Arc<StaticMarketData>,
    paper: Arc<PaperBackend>,
    positions: Arc<PositionEngine>,
    history: Arc<InMemoryTradeHistory>,
    store: Arc<InMemoryPositionStore>,
    executor: Arc<TradeExecutor>,
    gate: RiskGate,
}

async fn paper_harness() -> PaperHarness {
    let market = Arc::new(StaticMarketData::new());
    market.set_price("BTC/USDT:USDT", dec!(50000)).await;

    let paper = Arc::new(PaperBackend::new(
        market.clone(),
        PaperConfig {
            initial_balance: dec!(10000),
            taker_fee_pct: dec!(0.001),
            slippage_enabled: false,
            partial_fills_enabled: false,
            latency_ms: (0, 0),
        },
    ));

    let store = Arc::new(InMemoryPositionStore::new());
    let positions = Arc::new(PositionEngine::new(
        store.clone(),
        PositionEngineConfig::default(),
    ));
    let history = Arc::new(InMemoryTradeHistory::new());
    let executor = Arc::new(TradeExecutor::new(
        paper.clone() as Arc<dyn ExchangeAdapter>,
        positions.clone(),
        Arc::new(InMemoryOrderStore::new()),
        history.clone(),
        Arc::new(NullMetrics),
        ExecutorConfig {
            rate_limit_buffer: Duration::from_millis(0),
            balance_cache_ttl: Duration::from_millis(0),
            ..Default::default()
        },
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::default(),
        Arc::new(SilentAlerts),
    ));
    let gate = RiskGate::new(RiskLimits::default(), positions.clone(), breaker);

    PaperHarness {
        market,
        paper,
        positions,
        history,
        store,
        executor,
        gate,
    }
}

fn buy_signal() -> Signal {
    Signal {
        symbol: "BTC/USDT:USDT".to_string(),
        decision: Decision::Buy,
        confidence: dec!(0.8),
        size_pct: dec!(0.01),
        stop_loss_pct: Some(dec!(0.02)),
        take_profit_pct: None,
        leverage: None,
        reasoning: "breakout".to_string(),
    }
}

#[tokio::test]
async fn test_long_round_trip_with_profit() {
    let h = paper_harness().await;

    // Open: 10000 CHF capital, 1% size at 50000
    let result = h
        .executor
        .execute_signal(&buy_signal(), dec!(10000), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.success, "{:?}", result.error_message);

    let expected_qty = dec!(0.00181818); // (10000/1.10 * 0.01) / 50000, 8 dp
    let open = h.positions.open_positions(None).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].side, PositionSide::Long);
    assert_eq!(open[0].quantity, expected_qty);
    assert_eq!(open[0].stop_loss, dec!(49000));

    let entry_fee = expected_qty * dec!(50000) * dec!(0.001);
    let balance = h.paper.portfolio().await.balance;
    assert_eq!(balance, dec!(10000) - expected_qty * dec!(50000) - entry_fee);

    // Price rallies, signal closes the position
    h.market.set_price("BTC/USDT:USDT", dec!(51000)).await;
    let mut close = buy_signal();
    close.decision = Decision::Close;
    let result = h
        .executor
        .execute_signal(&close, dec!(10000), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.success, "{:?}", result.error_message);

    // Both fills in trade history, exit carries net realized P&L
    let trades = h.history.all().await;
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].kind, TradeKind::EntryLong);
    assert_eq!(trades[1].kind, TradeKind::ExitLong);
    let exit_fee = expected_qty * dec!(51000) * dec!(0.001);
    let gross = (dec!(51000) - dec!(50000)) * expected_qty;
    assert_eq!(trades[1].realized_pnl, Some(gross - exit_fee));

    // Position closed with positive CHF P&L, daily rollup updated
    let closed = h.positions.get(open[0].id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert!(closed.pnl_chf.unwrap() > Decimal::ZERO);

    let today = chrono::Utc::now().date_naive();
    let summary = h.positions.daily_pnl(today).await.unwrap();
    assert_eq!(summary.closed_positions, 1);
    assert_eq!(summary.open_positions, 0);
    assert!(summary.realized_pnl_chf > Decimal::ZERO);
    assert_eq!(h.store.daily_rollup(today).await, summary.realized_pnl_chf);

    // Paper balance moved by gross P&L minus both fees
    let balance = h.paper.portfolio().await.balance;
    assert_eq!(balance, dec!(10000) + gross - entry_fee - exit_fee);
}

#[tokio::test]
async fn test_oversized_signal_rejected_no_order_placed() {
    let h = paper_harness().await;
    let mut signal = buy_signal();
    signal.size_pct = dec!(0.25);

    let result = h
        .executor
        .execute_signal(&signal, dec!(10000), dec!(1.10), Some(&h.gate))
        .await;

    assert!(result.is_code(ExecutionErrorCode::RiskValidationFailed));
    assert!(
        result
            .error_message
            .as_deref()
            .unwrap()
            .contains("Position Size")
    );
    assert!(h.positions.open_positions(None).await.unwrap().is_empty());
    assert_eq!(h.paper.portfolio().await.balance, dec!(10000));
    assert!(h.history.all().await.is_empty());
}

#[tokio::test]
async fn test_flat_round_trip_costs_exactly_the_fees() {
    let h = paper_harness().await;

    h.executor
        .execute_signal(&buy_signal(), dec!(10000), dec!(1.10), Some(&h.gate))
        .await;
    let mut close = buy_signal();
    close.decision = Decision::Close;
    h.executor
        .execute_signal(&close, dec!(10000), dec!(1.10), Some(&h.gate))
        .await;

    let expected_qty = dec!(0.00181818);
    let fees = expected_qty * dec!(50000) * dec!(0.001) * dec!(2);
    assert_eq!(h.paper.portfolio().await.balance, dec!(10000) - fees);

    // Realized P&L on the exit equals -fees for a flat close
    let trades = h.history.all().await;
    let exit_fee = expected_qty * dec!(50000) * dec!(0.001);
    assert_eq!(trades[1].realized_pnl, Some(-exit_fee));
}

#[tokio::test]
async fn test_short_round_trip() {
    let h = paper_harness().await;
    let mut signal = buy_signal();
    signal.decision = Decision::Sell;

    let result = h
        .executor
        .execute_signal(&signal, dec!(10000), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.success, "{:?}", result.error_message);

    let open = h.positions.open_positions(None).await.unwrap();
    assert_eq!(open[0].side, PositionSide::Short);
    // Short stop sits above entry
    assert_eq!(open[0].stop_loss, dec!(51000));

    h.market.set_price("BTC/USDT:USDT", dec!(49000)).await;
    let mut close = buy_signal();
    close.decision = Decision::Close;
    let result = h
        .executor
        .execute_signal(&close, dec!(10000), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.success);

    let closed = h.positions.get(open[0].id).await.unwrap().unwrap();
    assert!(closed.pnl_chf.unwrap() > Decimal::ZERO);
}
