//! Daily-loss kill switch: trip, lockout, token-gated manual reset.

use perpetuum::application::circuit_breaker::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig,
};
use perpetuum::application::executor::{ExecutorConfig, TradeExecutor};
use perpetuum::application::position_engine::{
    CreatePositionRequest, PositionEngine, PositionEngineConfig,
};
use perpetuum::application::risk_gate::{RiskGate, RiskLimits};
use perpetuum::domain::ports::{AlertLevel, AlertSink, ExchangeAdapter, PositionCloser};
use perpetuum::domain::trading::order::ExecutionErrorCode;
use perpetuum::domain::trading::position::{CloseReason, PositionSide};
use perpetuum::domain::trading::types::{Decision, Signal};
use perpetuum::infrastructure::mock::{
    InMemoryOrderStore, InMemoryPositionStore, InMemoryTradeHistory, NullMetrics, StaticMarketData,
};
use perpetuum::infrastructure::paper::backend::{PaperBackend, PaperConfig};
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct RecordingAlerts {
    messages: Mutex<Vec<(AlertLevel, String)>>,
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send(&self, level: AlertLevel, message: &str) {
        self.messages.lock().await.push((level, message.to_string()));
    }
}

struct Harness {
    market: Arc<StaticMarketData>,
    positions: Arc<PositionEngine>,
    executor: Arc<TradeExecutor>,
    breaker: Arc<CircuitBreaker>,
    gate: RiskGate,
    alerts: Arc<RecordingAlerts>,
}

async fn harness() -> Harness {
    let market = Arc::new(StaticMarketData::new());
    market.set_price("BTC/USDT:USDT", dec!(50000)).await;

    let paper = Arc::new(PaperBackend::new(
        market.clone(),
        PaperConfig {
            initial_balance: dec!(100000),
            slippage_enabled: false,
            partial_fills_enabled: false,
            latency_ms: (0, 0),
            ..Default::default()
        },
    ));

    let positions = Arc::new(PositionEngine::new(
        Arc::new(InMemoryPositionStore::new()),
        PositionEngineConfig::default(),
    ));
    let executor = Arc::new(TradeExecutor::new(
        paper as Arc<dyn ExchangeAdapter>,
        positions.clone(),
        Arc::new(InMemoryOrderStore::new()),
        Arc::new(InMemoryTradeHistory::new()),
        Arc::new(NullMetrics),
        ExecutorConfig {
            rate_limit_buffer: Duration::from_millis(0),
            ..Default::default()
        },
    ));

    let alerts = Arc::new(RecordingAlerts::default());
    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig {
            starting_balance_chf: dec!(2626.96),
            daily_loss_limit_chf: dec!(-183.89),
            reset_time_utc: chrono::NaiveTime::MIN,
        },
        alerts.clone(),
    ));
    breaker.set_closer(executor.clone()).await;

    let gate = RiskGate::new(RiskLimits::default(), positions.clone(), breaker.clone());

    Harness {
        market,
        positions,
        executor,
        breaker,
        gate,
        alerts,
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
        reasoning: String::new(),
    }
}

#[tokio::test]
async fn test_trip_reset_token_and_resume() {
    let h = harness().await;

    // Realize a CHF -200 loss: 0.008 BTC at 5x, 50000 -> 44500 gives
    // -220 USD = -200 CHF at the 1.10 rate.
    let position = h
        .positions
        .create_position(CreatePositionRequest {
            symbol: "BTC/USDT:USDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.008),
            entry_price: dec!(50000),
            leverage: 5,
            stop_loss: dec!(49000),
            take_profit: None,
        })
        .await
        .unwrap();
    let closed = h
        .positions
        .close_position(position.id, dec!(44500), CloseReason::StopLoss)
        .await
        .unwrap();
    assert_eq!(closed.pnl_chf, Some(dec!(-200)));

    let summary = h
        .positions
        .daily_pnl(chrono::Utc::now().date_naive())
        .await
        .unwrap();
    assert!(summary.circuit_breaker_breached);

    // Push the daily loss into the breaker, as the cycle engine does
    let status = h.breaker.check_daily_loss(summary.total_pnl_chf).await;
    assert_eq!(status.state, BreakerState::ManualResetRequired);

    // 16-char hex token emitted at critical level
    let token = status.reset_token.expect("token on trip");
    assert_eq!(token.len(), 16);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    {
        let alerts = h.alerts.messages.lock().await;
        assert!(
            alerts
                .iter()
                .any(|(level, msg)| *level == AlertLevel::Critical && msg.contains(&token))
        );
    }

    // Every non-Hold signal is now rejected
    let result = h
        .executor
        .execute_signal(&buy_signal(), dec!(2626.96), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.is_code(ExecutionErrorCode::RiskValidationFailed));

    let mut sell = buy_signal();
    sell.decision = Decision::Sell;
    let result = h
        .executor
        .execute_signal(&sell, dec!(2626.96), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.is_code(ExecutionErrorCode::RiskValidationFailed));

    // Hold passes through even while halted
    let mut hold = buy_signal();
    hold.decision = Decision::Hold;
    let result = h
        .executor
        .execute_signal(&hold, dec!(2626.96), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.success);

    // Wrong token refused, correct token resumes trading
    assert!(!h.breaker.manual_reset("wrong").await);
    assert!(!h.breaker.is_trading_allowed().await);
    assert!(h.breaker.manual_reset(&token).await);
    assert!(h.breaker.is_trading_allowed().await);

    let result = h
        .executor
        .execute_signal(&buy_signal(), dec!(2626.96), dec!(1.10), Some(&h.gate))
        .await;
    assert!(result.success, "{:?}", result.error_message);
}

#[tokio::test]
async fn test_trip_closes_open_positions_best_effort() {
    let h = harness().await;

    // Two open positions on the book when the breaker trips
    for symbol in ["BTC/USDT:USDT", "ETH/USDT:USDT"] {
        h.market.set_price(symbol, dec!(50000)).await;
        let mut signal = buy_signal();
        signal.symbol = symbol.to_string();
        let result = h
            .executor
            .execute_signal(&signal, dec!(2626.96), dec!(1.10), None)
            .await;
        assert!(result.success, "{:?}", result.error_message);
    }
    assert_eq!(h.positions.open_positions(None).await.unwrap().len(), 2);

    let status = h.breaker.check_daily_loss(dec!(-500)).await;
    assert_eq!(status.state, BreakerState::ManualResetRequired);

    // Flattened through the injected executor
    let open = PositionCloser::open_positions(h.executor.as_ref())
        .await
        .unwrap();
    assert!(open.is_empty());
}
