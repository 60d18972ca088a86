//! System/exchange position sync: corrections are applied once, audited,
//! and a second run finds nothing left to fix.

use perpetuum::application::position_engine::{
    CreatePositionRequest, PositionEngine, PositionEngineConfig,
};
use perpetuum::application::reconciler::{Reconciler, ReconcilerConfig};
use perpetuum::domain::errors::ExchangeError;
use perpetuum::domain::ports::{AlertLevel, AlertSink, ExchangeAdapter};
use perpetuum::domain::trading::order::{Order, OrderAck};
use perpetuum::domain::trading::position::{PositionSide, PositionStatus};
use perpetuum::domain::trading::types::{Balance, ExchangePosition, Ticker};
use perpetuum::infrastructure::mock::InMemoryPositionStore;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

struct ScriptedExchange {
    positions: RwLock<Vec<ExchangePosition>>,
}

#[async_trait]
impl ExchangeAdapter for ScriptedExchange {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: dec!(3000),
            bid: dec!(3000),
            ask: dec!(3000),
        })
    }
    async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        Ok(Balance {
            total: dec!(10000),
            free: dec!(10000),
            used: Decimal::ZERO,
        })
    }
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Ok(self.positions.read().await.clone())
    }
    async fn place_order(&self, _order: &Order) -> Result<OrderAck, ExchangeError> {
        Err(ExchangeError::InvalidOrder("read-only".to_string()))
    }
    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        Ok(())
    }
}

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
    reconciler: Reconciler,
    positions: Arc<PositionEngine>,
    store: Arc<InMemoryPositionStore>,
    alerts: Arc<RecordingAlerts>,
}

fn harness(exchange_positions: Vec<ExchangePosition>) -> Harness {
    let store = Arc::new(InMemoryPositionStore::new());
    let positions = Arc::new(PositionEngine::new(
        store.clone(),
        PositionEngineConfig::default(),
    ));
    let alerts = Arc::new(RecordingAlerts::default());
    let reconciler = Reconciler::new(
        Arc::new(ScriptedExchange {
            positions: RwLock::new(exchange_positions),
        }),
        positions.clone(),
        store.clone(),
        alerts.clone(),
        ReconcilerConfig::default(),
    );
    Harness {
        reconciler,
        positions,
        store,
        alerts,
    }
}

async fn open_eth(positions: &PositionEngine, quantity: Decimal) -> uuid::Uuid {
    positions
        .create_position(CreatePositionRequest {
            symbol: "ETH/USDT:USDT".to_string(),
            side: PositionSide::Long,
            quantity,
            entry_price: dec!(3000),
            leverage: 5,
            stop_loss: dec!(2900),
            take_profit: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_quantity_discrepancy_corrected_once() {
    let h = harness(vec![ExchangePosition {
        symbol: "ETH/USDT:USDT".to_string(),
        contracts: dec!(0.4),
        side: PositionSide::Long,
    }]);
    let id = open_eth(&h.positions, dec!(0.5)).await;

    let results = h.reconciler.run().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].needs_correction);
    assert_eq!(results[0].system_quantity, dec!(0.5));
    assert_eq!(results[0].exchange_quantity, dec!(0.4));

    // Audit trail carries the human-readable correction
    let events = h.store.audit_events().await;
    assert!(events.iter().any(|e| {
        e.event_type == "POSITION_QUANTITY_CORRECTED"
            && e.details.to_string().contains("Updated quantity from 0.5 to 0.4")
    }));

    // Second run: nothing to correct, quantity stays put
    let results = h.reconciler.run().await;
    assert!(!results[0].needs_correction);
    assert_eq!(
        h.positions.get(id).await.unwrap().unwrap().quantity,
        dec!(0.4)
    );
}

#[tokio::test]
async fn test_position_missing_on_exchange_closed_locally() {
    let h = harness(Vec::new());
    let id = open_eth(&h.positions, dec!(0.5)).await;
    h.positions.update_price(id, dec!(3100)).await.unwrap();

    let results = h.reconciler.run().await;
    assert!(results[0].needs_correction);
    assert!(
        results[0].corrections_applied[0].contains("not found on exchange"),
        "{:?}",
        results[0].corrections_applied
    );

    let position = h.positions.get(id).await.unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Closed);
    // Closed at the last known mark
    assert_eq!(position.current_price, dec!(3100));

    // Idempotent: a second run leaves the closed position alone
    let results = h.reconciler.run().await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_unknown_exchange_position_only_alerts() {
    let h = harness(vec![ExchangePosition {
        symbol: "BTC/USDT:USDT".to_string(),
        contracts: dec!(0.02),
        side: PositionSide::Long,
    }]);

    let results = h.reconciler.run().await;
    assert!(results.is_empty());
    assert!(h.positions.open_positions(None).await.unwrap().is_empty());

    let alerts = h.alerts.messages.lock().await;
    assert!(
        alerts
            .iter()
            .any(|(level, msg)| *level == AlertLevel::Warning && msg.contains("BTC/USDT:USDT"))
    );
}
