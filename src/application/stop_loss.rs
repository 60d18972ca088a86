use crate::application::executor::TradeExecutor;
use crate::application::position_engine::PositionEngine;
use crate::domain::ports::{AlertLevel, AlertSink};
use crate::domain::trading::position::{CloseReason, Position};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLayer {
    ExchangeStop,
    AppMonitor,
    Emergency,
}

impl std::fmt::Display for ProtectionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectionLayer::ExchangeStop => write!(f, "layer1"),
            ProtectionLayer::AppMonitor => write!(f, "layer2"),
            ProtectionLayer::Emergency => write!(f, "layer3"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Idle,
    Active,
    Triggered,
    Finalized,
    Canceled,
}

/// Per-position protection record. Cloneable snapshot; the live copy
/// sits in the supervisor's map.
#[derive(Debug, Clone)]
pub struct Protection {
    pub position_id: Uuid,
    pub symbol: String,
    pub stop_price: Decimal,
    pub emergency_threshold: Decimal,
    pub layer1_order_id: Option<String>,
    pub layer1_state: LayerState,
    pub layer2_state: LayerState,
    pub layer3_state: LayerState,
    pub triggered_by: Option<ProtectionLayer>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Protection {
    pub fn active_layers(&self) -> usize {
        [self.layer1_state, self.layer2_state, self.layer3_state]
            .iter()
            .filter(|s| **s == LayerState::Active)
            .count()
    }
}

struct ProtectionEntry {
    protection: Protection,
    layer2: Option<JoinHandle<()>>,
    layer3: Option<JoinHandle<()>>,
    finalized: bool,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub layer2_interval: Duration,
    pub layer3_interval: Duration,
    pub emergency_threshold: Decimal,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            layer2_interval: Duration::from_secs(2),
            layer3_interval: Duration::from_secs(1),
            emergency_threshold: dec!(0.15),
        }
    }
}

/// Three-layer stop-loss protection per position.
///
/// Layer 1 is a reduce-only stop-market order on the exchange. Layer 2
/// polls the price and closes through the executor when the stop is
/// crossed. Layer 3 polls faster and force-closes when the adverse move
/// exceeds the emergency threshold. The layers do not coordinate: the
/// first successful close wins and later triggers are no-ops because the
/// position is no longer open.
pub struct StopLossSupervisor {
    executor: Arc<TradeExecutor>,
    engine: Arc<PositionEngine>,
    alerts: Arc<dyn AlertSink>,
    config: SupervisorConfig,
    protections: Mutex<HashMap<Uuid, ProtectionEntry>>,
}

impl StopLossSupervisor {
    pub fn new(
        executor: Arc<TradeExecutor>,
        engine: Arc<PositionEngine>,
        alerts: Arc<dyn AlertSink>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            executor,
            engine,
            alerts,
            config,
            protections: Mutex::new(HashMap::new()),
        }
    }

    /// Installs all three layers for an open position and returns the
    /// protection record. A Layer 1 placement failure is logged and the
    /// remaining layers still start (defense in depth).
    pub async fn start_protection(
        self: Arc<Self>,
        position: &Position,
        stop_price: Decimal,
    ) -> Protection {
        info!(
            "StopLoss: Starting 3-layer protection for {} ({}) at stop {}",
            position.symbol, position.id, stop_price
        );

        let mut protection = Protection {
            position_id: position.id,
            symbol: position.symbol.clone(),
            stop_price,
            emergency_threshold: self.config.emergency_threshold,
            layer1_order_id: None,
            layer1_state: LayerState::Idle,
            layer2_state: LayerState::Active,
            layer3_state: LayerState::Active,
            triggered_by: None,
            triggered_at: None,
            created_at: Utc::now(),
        };

        // Layer 1: exchange stop order
        let layer1 = self
            .executor
            .create_stop_market_order(
                &position.symbol,
                position.side.exit_order_side(),
                position.quantity,
                stop_price,
                Some(position.id),
            )
            .await;
        if layer1.success {
            protection.layer1_order_id = layer1.order.and_then(|o| o.exchange_order_id);
            protection.layer1_state = LayerState::Active;
            info!(
                "StopLoss: Layer 1 active for {} (order {})",
                position.id,
                protection.layer1_order_id.as_deref().unwrap_or("-")
            );
        } else {
            warn!(
                "StopLoss: Layer 1 placement failed for {}: {}",
                position.id,
                layer1.error_message.as_deref().unwrap_or("unknown")
            );
        }

        let layer2 = tokio::spawn(Arc::clone(&self).monitor_layer2(position.clone(), stop_price));
        let layer3 = tokio::spawn(Arc::clone(&self).monitor_layer3(position.clone()));

        let snapshot = protection.clone();
        self.protections.lock().await.insert(
            position.id,
            ProtectionEntry {
                protection,
                layer2: Some(layer2),
                layer3: Some(layer3),
                finalized: false,
            },
        );

        info!(
            "StopLoss: Protection active for {} ({} layers)",
            position.id,
            snapshot.active_layers()
        );
        snapshot
    }

    /// Layer 2: application monitor. Wakes every `layer2_interval`,
    /// exits when the position is no longer open, and closes through the
    /// executor when the price crosses the stop adversely. Transient
    /// price-fetch errors never trigger.
    async fn monitor_layer2(self: Arc<Self>, position: Position, stop_price: Decimal) {
        let id = position.id;
        loop {
            tokio::time::sleep(self.config.layer2_interval).await;

            match self.engine.get(id).await {
                Ok(Some(current)) if current.is_open() => {}
                _ => {
                    info!("StopLoss: Layer 2 exiting, position {} no longer open", id);
                    self.finalize_natural(id, ProtectionLayer::AppMonitor).await;
                    return;
                }
            }

            let price = match self.executor.fetch_ticker(&position.symbol).await {
                Ok(ticker) => ticker.last,
                Err(e) => {
                    warn!(
                        "StopLoss: Layer 2 price fetch failed for {}: {e}",
                        position.symbol
                    );
                    continue;
                }
            };

            let crossed = {
                let mut probe = position.clone();
                probe.stop_loss = stop_price;
                probe.stop_crossed_at(price)
            };
            if !crossed {
                continue;
            }

            warn!(
                "StopLoss: Layer 2 TRIGGERED for {}: price {} crossed stop {}",
                id, price, stop_price
            );
            let result = self
                .executor
                .close_position(id, CloseReason::Layer2StopLoss)
                .await;
            if result.success {
                info!("StopLoss: Layer 2 closed position {}", id);
                self.finalize_triggered(id, ProtectionLayer::AppMonitor).await;
                return;
            }
            error!(
                "StopLoss: Layer 2 close failed for {}: {}. Will retry next wake",
                id,
                result.error_message.as_deref().unwrap_or("unknown")
            );
        }
    }

    /// Layer 3: emergency liquidation. Wakes every `layer3_interval`
    /// and force-closes once the adverse move exceeds the threshold.
    async fn monitor_layer3(self: Arc<Self>, position: Position) {
        let id = position.id;
        loop {
            tokio::time::sleep(self.config.layer3_interval).await;

            match self.engine.get(id).await {
                Ok(Some(current)) if current.is_open() => {}
                _ => {
                    info!("StopLoss: Layer 3 exiting, position {} no longer open", id);
                    self.finalize_natural(id, ProtectionLayer::Emergency).await;
                    return;
                }
            }

            let price = match self.executor.fetch_ticker(&position.symbol).await {
                Ok(ticker) => ticker.last,
                Err(e) => {
                    warn!(
                        "StopLoss: Layer 3 price fetch failed for {}: {e}",
                        position.symbol
                    );
                    continue;
                }
            };

            let loss_pct = position.loss_pct_at(price);
            if loss_pct <= self.config.emergency_threshold {
                continue;
            }

            error!(
                "StopLoss: Layer 3 EMERGENCY for {}: loss {:.2}% exceeds threshold {:.2}%",
                id,
                loss_pct * Decimal::ONE_HUNDRED,
                self.config.emergency_threshold * Decimal::ONE_HUNDRED
            );
            self.alerts
                .send(
                    AlertLevel::Critical,
                    &format!(
                        "EMERGENCY: position {} loss {:.2}% (price {})",
                        id,
                        loss_pct * Decimal::ONE_HUNDRED,
                        price
                    ),
                )
                .await;

            let result = self
                .executor
                .close_position(id, CloseReason::Layer3Emergency)
                .await;
            if result.success {
                error!("StopLoss: Layer 3 emergency close succeeded for {}", id);
                self.finalize_triggered(id, ProtectionLayer::Emergency).await;
                return;
            }
            error!(
                "StopLoss: Layer 3 emergency close FAILED for {}: {}. Will retry next wake",
                id,
                result.error_message.as_deref().unwrap_or("unknown")
            );
        }
    }

    /// Cancels monitors and the resting exchange stop. Safe to call
    /// repeatedly; a missing entry is a no-op.
    pub async fn stop_protection(&self, position_id: Uuid) {
        let entry = self.protections.lock().await.remove(&position_id);
        let Some(mut entry) = entry else {
            return;
        };

        info!("StopLoss: Stopping all protection for {}", position_id);
        if let Some(handle) = entry.layer2.take() {
            handle.abort();
        }
        if let Some(handle) = entry.layer3.take() {
            handle.abort();
        }
        if entry.protection.layer1_state == LayerState::Active
            && let Some(order_id) = entry.protection.layer1_order_id.as_deref()
            && let Err(e) = self
                .executor
                .cancel_order(order_id, &entry.protection.symbol)
                .await
        {
            warn!(
                "StopLoss: Failed to cancel exchange stop {} for {}: {e}",
                order_id, position_id
            );
        }
    }

    /// Marks the winning layer, aborts the sibling monitor, and cancels
    /// the resting exchange stop. Called from inside the winning task.
    async fn finalize_triggered(&self, position_id: Uuid, layer: ProtectionLayer) {
        let cancel_target = {
            let mut protections = self.protections.lock().await;
            let Some(entry) = protections.get_mut(&position_id) else {
                return;
            };
            if entry.finalized {
                return;
            }
            entry.finalized = true;

            entry.protection.triggered_by = Some(layer);
            entry.protection.triggered_at = Some(Utc::now());
            match layer {
                ProtectionLayer::AppMonitor => {
                    entry.protection.layer2_state = LayerState::Triggered;
                    entry.protection.layer3_state = LayerState::Canceled;
                    if let Some(handle) = entry.layer3.take() {
                        handle.abort();
                    }
                    entry.layer2.take();
                }
                ProtectionLayer::Emergency => {
                    entry.protection.layer3_state = LayerState::Triggered;
                    entry.protection.layer2_state = LayerState::Canceled;
                    if let Some(handle) = entry.layer2.take() {
                        handle.abort();
                    }
                    entry.layer3.take();
                }
                ProtectionLayer::ExchangeStop => {
                    entry.protection.layer1_state = LayerState::Triggered;
                }
            }

            if entry.protection.layer1_state == LayerState::Active {
                entry.protection.layer1_state = LayerState::Canceled;
                entry
                    .protection
                    .layer1_order_id
                    .clone()
                    .map(|order_id| (order_id, entry.protection.symbol.clone()))
            } else {
                None
            }
        };

        if let Some((order_id, symbol)) = cancel_target
            && let Err(e) = self.executor.cancel_order(&order_id, &symbol).await
        {
            warn!(
                "StopLoss: Failed to cancel exchange stop {} for {}: {e}",
                order_id, position_id
            );
        }
        info!(
            "StopLoss: Protection for {} finalized by {}",
            position_id, layer
        );
    }

    /// Position left the Open state without this supervisor closing it
    /// (signal close, reconciliation, circuit breaker). Winds the layers
    /// down without recording a trigger.
    async fn finalize_natural(&self, position_id: Uuid, exiting: ProtectionLayer) {
        let cancel_target = {
            let mut protections = self.protections.lock().await;
            let Some(entry) = protections.get_mut(&position_id) else {
                return;
            };

            match exiting {
                ProtectionLayer::AppMonitor => {
                    if entry.protection.layer2_state == LayerState::Active {
                        entry.protection.layer2_state = LayerState::Finalized;
                    }
                    entry.layer2.take();
                }
                ProtectionLayer::Emergency => {
                    if entry.protection.layer3_state == LayerState::Active {
                        entry.protection.layer3_state = LayerState::Finalized;
                    }
                    entry.layer3.take();
                }
                ProtectionLayer::ExchangeStop => {}
            }

            if entry.finalized {
                None
            } else if entry.protection.layer1_state == LayerState::Active {
                entry.finalized = true;
                entry.protection.layer1_state = LayerState::Canceled;
                entry
                    .protection
                    .layer1_order_id
                    .clone()
                    .map(|order_id| (order_id, entry.protection.symbol.clone()))
            } else {
                entry.finalized = true;
                None
            }
        };

        if let Some((order_id, symbol)) = cancel_target
            && let Err(e) = self.executor.cancel_order(&order_id, &symbol).await
        {
            warn!(
                "StopLoss: Failed to cancel exchange stop {} for {}: {e}",
                order_id, position_id
            );
        }
    }

    pub async fn protection(&self, position_id: Uuid) -> Option<Protection> {
        self.protections
            .lock()
            .await
            .get(&position_id)
            .map(|entry| entry.protection.clone())
    }

    /// True while any monitor task for this position is still running.
    pub async fn is_monitoring(&self, position_id: Uuid) -> bool {
        let protections = self.protections.lock().await;
        match protections.get(&position_id) {
            Some(entry) => {
                let layer2_live = entry.layer2.as_ref().is_some_and(|h| !h.is_finished());
                let layer3_live = entry.layer3.as_ref().is_some_and(|h| !h.is_finished());
                layer2_live || layer3_live
            }
            None => false,
        }
    }

    pub async fn protected_count(&self) -> usize {
        self.protections.lock().await.len()
    }
}
