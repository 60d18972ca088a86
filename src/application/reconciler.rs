use crate::application::position_engine::PositionEngine;
use crate::domain::ports::{AlertLevel, AlertSink, ExchangeAdapter};
use crate::domain::repositories::{AuditEvent, PositionStore};
use crate::domain::trading::money::round8;
use crate::domain::trading::position::CloseReason;
use crate::domain::trading::types::ExchangePosition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of reconciling one position against the exchange.
#[derive(Debug, Clone)]
pub struct ReconciliationResult {
    pub position_id: Uuid,
    pub system_quantity: Decimal,
    pub exchange_quantity: Decimal,
    pub discrepancy: Decimal,
    pub needs_correction: bool,
    pub corrections_applied: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub periodic_interval: Duration,
    pub discrepancy_threshold: Decimal,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            periodic_interval: Duration::from_secs(300),
            discrepancy_threshold: dec!(0.00001),
        }
    }
}

/// Keeps local position state and the exchange in agreement.
///
/// Runs periodically and after every executed order. The exchange is
/// authoritative for quantities: a material discrepancy overwrites the
/// local quantity, a position missing from the exchange is closed
/// locally, and an exchange position with no local counterpart is only
/// flagged for human review.
pub struct Reconciler {
    exchange: Arc<dyn ExchangeAdapter>,
    engine: Arc<PositionEngine>,
    store: Arc<dyn PositionStore>,
    alerts: Arc<dyn AlertSink>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        engine: Arc<PositionEngine>,
        store: Arc<dyn PositionStore>,
        alerts: Arc<dyn AlertSink>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            exchange,
            engine,
            store,
            alerts,
            config,
        }
    }

    /// Full sweep over all open system positions. Idempotent: running it
    /// twice leaves the same state as running it once.
    pub async fn run(&self) -> Vec<ReconciliationResult> {
        info!("Reconciler: Starting full position reconciliation");

        let system_positions = match self.engine.open_positions(None).await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Reconciler: Failed to load system positions: {e}");
                return Vec::new();
            }
        };

        let exchange_positions = match self.exchange.fetch_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Reconciler: Failed to fetch exchange positions: {e}");
                return Vec::new();
            }
        };
        let exchange_map: HashMap<&str, &ExchangePosition> = exchange_positions
            .iter()
            .filter(|p| !p.contracts.is_zero())
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        let mut results = Vec::new();
        for position in &system_positions {
            let result = match exchange_map.get(position.symbol.as_str()) {
                Some(exchange_position) => {
                    self.reconcile_quantities(position, exchange_position).await
                }
                None => self.close_missing(position).await,
            };
            if let Err(e) = self.audit(&result).await {
                warn!("Reconciler: Failed to audit result: {e}");
            }
            results.push(result);
        }

        // Exchange-side positions with no local counterpart need a human:
        // auto-creating them would fabricate entry data we never had.
        for (symbol, exchange_position) in &exchange_map {
            if !system_positions.iter().any(|p| p.symbol == *symbol) {
                warn!(
                    "Reconciler: Exchange holds {} {} with no system position - manual review required",
                    exchange_position.contracts, symbol
                );
                self.alerts
                    .send(
                        AlertLevel::Warning,
                        &format!(
                            "Exchange position {} ({} contracts) has no system counterpart",
                            symbol, exchange_position.contracts
                        ),
                    )
                    .await;
            }
        }

        let corrections = results.iter().filter(|r| r.needs_correction).count();
        info!(
            "Reconciler: Complete, {} positions checked, {} discrepancies",
            results.len(),
            corrections
        );
        results
    }

    async fn reconcile_quantities(
        &self,
        position: &crate::domain::trading::position::Position,
        exchange_position: &ExchangePosition,
    ) -> ReconciliationResult {
        let system_quantity = position.quantity;
        let exchange_quantity = round8(exchange_position.contracts);
        let discrepancy = round8(system_quantity - exchange_quantity);

        let mut result = ReconciliationResult {
            position_id: position.id,
            system_quantity,
            exchange_quantity,
            discrepancy,
            needs_correction: false,
            corrections_applied: Vec::new(),
            timestamp: Utc::now(),
        };

        if discrepancy.abs() <= self.config.discrepancy_threshold {
            debug!(
                "Reconciler: {} in sync (diff {})",
                position.symbol,
                discrepancy.abs()
            );
            return result;
        }

        warn!(
            "Reconciler: Discrepancy on {}: system={}, exchange={}, diff={}",
            position.symbol, system_quantity, exchange_quantity, discrepancy
        );
        result.needs_correction = true;

        match self
            .engine
            .correct_quantity(position.id, exchange_quantity)
            .await
        {
            Ok(corrected) => {
                result.corrections_applied.push(format!(
                    "Updated quantity from {} to {}",
                    system_quantity, exchange_quantity
                ));
                // Recompute P&L against the corrected quantity
                if let Err(e) = self
                    .engine
                    .update_price(position.id, corrected.current_price)
                    .await
                {
                    warn!("Reconciler: P&L recompute failed for {}: {e}", position.id);
                }
                self.alerts
                    .send(
                        AlertLevel::Warning,
                        &format!(
                            "Reconciliation corrected {} quantity {} -> {}",
                            position.symbol, system_quantity, exchange_quantity
                        ),
                    )
                    .await;
            }
            Err(e) => {
                error!("Reconciler: Correction failed for {}: {e}", position.id);
                result
                    .corrections_applied
                    .push(format!("Correction failed: {e}"));
            }
        }

        result
    }

    async fn close_missing(
        &self,
        position: &crate::domain::trading::position::Position,
    ) -> ReconciliationResult {
        error!(
            "Reconciler: Position {} ({}) exists in system but not on exchange",
            position.id, position.symbol
        );

        let mut result = ReconciliationResult {
            position_id: position.id,
            system_quantity: position.quantity,
            exchange_quantity: Decimal::ZERO,
            discrepancy: position.quantity,
            needs_correction: true,
            corrections_applied: Vec::new(),
            timestamp: Utc::now(),
        };

        let close_price = if position.current_price.is_zero() {
            position.entry_price
        } else {
            position.current_price
        };
        match self
            .engine
            .close_position(
                position.id,
                close_price,
                CloseReason::ReconciliationNotOnExchange,
            )
            .await
        {
            Ok(_) => {
                result
                    .corrections_applied
                    .push("Position not found on exchange - closed in system".to_string());
                self.alerts
                    .send(
                        AlertLevel::Warning,
                        &format!(
                            "Closed {} locally: no matching exchange position",
                            position.symbol
                        ),
                    )
                    .await;
            }
            Err(e) => {
                error!("Reconciler: Failed to close {} locally: {e}", position.id);
                result
                    .corrections_applied
                    .push(format!("Close failed: {e}"));
            }
        }

        result
    }

    async fn audit(&self, result: &ReconciliationResult) -> anyhow::Result<()> {
        let audit = AuditEvent::new(
            "RECONCILIATION",
            "position",
            result.position_id,
            json!({
                "system_quantity": result.system_quantity.to_string(),
                "exchange_quantity": result.exchange_quantity.to_string(),
                "discrepancy": result.discrepancy.to_string(),
                "needs_correction": result.needs_correction,
                "corrections_applied": result.corrections_applied,
            }),
        );
        self.store.append_audit(&audit).await?;
        Ok(())
    }

    /// Spawns the periodic reconciliation task.
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        let reconciler = self;
        let interval = reconciler.config.periodic_interval;
        tokio::spawn(async move {
            info!(
                "Reconciler: Periodic reconciliation started (interval {:?})",
                interval
            );
            loop {
                tokio::time::sleep(interval).await;
                let results = reconciler.run().await;
                let discrepancies = results.iter().filter(|r| r.needs_correction).count();
                if discrepancies > 0 {
                    warn!(
                        "Reconciler: Periodic run found {} discrepancies",
                        discrepancies
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::position_engine::{
        CreatePositionRequest, PositionEngine, PositionEngineConfig,
    };
    use crate::domain::errors::ExchangeError;
    use crate::domain::ports::AlertSink;
    use crate::domain::trading::order::{Order, OrderAck};
    use crate::domain::trading::position::{PositionSide, PositionStatus};
    use crate::domain::trading::types::{Balance, Ticker};
    use crate::infrastructure::mock::InMemoryPositionStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::RwLock;

    struct FixedExchange {
        positions: RwLock<Vec<ExchangePosition>>,
    }

    #[async_trait]
    impl ExchangeAdapter for FixedExchange {
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
            Err(ExchangeError::InvalidOrder("not supported".into()))
        }
        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    struct SilentAlerts;

    #[async_trait]
    impl AlertSink for SilentAlerts {
        async fn send(&self, _level: AlertLevel, _message: &str) {}
    }

    async fn harness(
        exchange_positions: Vec<ExchangePosition>,
    ) -> (Reconciler, Arc<PositionEngine>) {
        let store = Arc::new(InMemoryPositionStore::new());
        let engine = Arc::new(PositionEngine::new(
            store.clone(),
            PositionEngineConfig::default(),
        ));
        let exchange = Arc::new(FixedExchange {
            positions: RwLock::new(exchange_positions),
        });
        let reconciler = Reconciler::new(
            exchange,
            engine.clone(),
            store,
            Arc::new(SilentAlerts),
            ReconcilerConfig::default(),
        );
        (reconciler, engine)
    }

    async fn open_eth(engine: &PositionEngine, quantity: Decimal) -> Uuid {
        engine
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
    async fn test_discrepancy_corrected_and_idempotent() {
        let (reconciler, engine) = harness(vec![ExchangePosition {
            symbol: "ETH/USDT:USDT".to_string(),
            contracts: dec!(0.4),
            side: PositionSide::Long,
        }])
        .await;
        let id = open_eth(&engine, dec!(0.5)).await;

        let results = reconciler.run().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].needs_correction);
        assert_eq!(results[0].discrepancy, dec!(0.1));
        assert!(
            results[0].corrections_applied[0].contains("Updated quantity from 0.5 to 0.4"),
            "{:?}",
            results[0].corrections_applied
        );
        assert_eq!(engine.get(id).await.unwrap().unwrap().quantity, dec!(0.4));

        // Second run: no further change
        let results = reconciler.run().await;
        assert!(!results[0].needs_correction);
        assert_eq!(engine.get(id).await.unwrap().unwrap().quantity, dec!(0.4));
    }

    #[tokio::test]
    async fn test_below_threshold_untouched() {
        let (reconciler, engine) = harness(vec![ExchangePosition {
            symbol: "ETH/USDT:USDT".to_string(),
            contracts: dec!(0.500000004),
            side: PositionSide::Long,
        }])
        .await;
        let id = open_eth(&engine, dec!(0.5)).await;

        let results = reconciler.run().await;
        assert!(!results[0].needs_correction);
        assert_eq!(engine.get(id).await.unwrap().unwrap().quantity, dec!(0.5));
    }

    #[tokio::test]
    async fn test_missing_on_exchange_closes_locally() {
        let (reconciler, engine) = harness(Vec::new()).await;
        let id = open_eth(&engine, dec!(0.5)).await;

        let results = reconciler.run().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].needs_correction);

        let position = engine.get(id).await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert!(position.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_exchange_only_position_not_auto_created() {
        let (reconciler, engine) = harness(vec![ExchangePosition {
            symbol: "BTC/USDT:USDT".to_string(),
            contracts: dec!(0.01),
            side: PositionSide::Long,
        }])
        .await;

        let results = reconciler.run().await;
        assert!(results.is_empty());
        assert!(engine.open_positions(None).await.unwrap().is_empty());
    }
}
