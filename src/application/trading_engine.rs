use crate::application::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::application::executor::TradeExecutor;
use crate::application::position_engine::PositionEngine;
use crate::application::reconciler::Reconciler;
use crate::application::risk_gate::RiskGate;
use crate::application::scheduler::TradingCycle;
use crate::application::stop_loss::StopLossSupervisor;
use crate::domain::ports::{MarketDataProvider, MetricsSink, SignalSource};
use crate::domain::trading::types::{Decision, Signal, Snapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TradingEngineConfig {
    pub symbols: Vec<String>,
    pub capital_chf: Decimal,
    pub chf_to_usd_rate: Decimal,
}

/// The cycle body wired into the scheduler: market data in, signals
/// through the risk gate and executor, protection on every open, and a
/// reconciliation pass after any executed order.
pub struct TradingEngine {
    config: TradingEngineConfig,
    market_data: Arc<dyn MarketDataProvider>,
    signal_source: Arc<dyn SignalSource>,
    risk_gate: Arc<RiskGate>,
    executor: Arc<TradeExecutor>,
    supervisor: Arc<StopLossSupervisor>,
    reconciler: Arc<Reconciler>,
    positions: Arc<PositionEngine>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<dyn MetricsSink>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TradingEngineConfig,
        market_data: Arc<dyn MarketDataProvider>,
        signal_source: Arc<dyn SignalSource>,
        risk_gate: Arc<RiskGate>,
        executor: Arc<TradeExecutor>,
        supervisor: Arc<StopLossSupervisor>,
        reconciler: Arc<Reconciler>,
        positions: Arc<PositionEngine>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            market_data,
            signal_source,
            risk_gate,
            executor,
            supervisor,
            reconciler,
            positions,
            breaker,
            metrics,
        }
    }

    async fn collect_snapshots(&self) -> Vec<Snapshot> {
        let mut snapshots = Vec::with_capacity(self.config.symbols.len());
        for symbol in &self.config.symbols {
            match self.market_data.latest_snapshot(symbol).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Engine: No snapshot for {symbol}: {e}"),
            }
        }
        snapshots
    }

    /// Marks every open position at the latest snapshot price so daily
    /// P&L (and the breaker check behind it) sees fresh marks.
    async fn refresh_position_marks(&self, snapshots: &[Snapshot]) {
        let open = match self.positions.open_positions(None).await {
            Ok(open) => open,
            Err(e) => {
                warn!("Engine: Could not load open positions for mark refresh: {e}");
                return;
            }
        };
        for position in open {
            if let Some(snapshot) = snapshots.iter().find(|s| s.symbol == position.symbol)
                && let Err(e) = self
                    .positions
                    .update_price(position.id, snapshot.ticker.last)
                    .await
            {
                warn!("Engine: Mark refresh failed for {}: {e}", position.id);
            }
        }
    }

    async fn handle_result(
        &self,
        signal: &Signal,
        result: &crate::domain::trading::order::ExecutionResult,
    ) {
        if !result.success {
            debug!(
                "Engine: Signal {} {:?} not executed: {}",
                signal.symbol,
                signal.decision,
                result.error_message.as_deref().unwrap_or("-")
            );
            return;
        }

        match signal.decision {
            Decision::Buy | Decision::Sell => {
                let Some(position_id) = result.order.as_ref().and_then(|o| o.position_id) else {
                    return;
                };
                match self.positions.get(position_id).await {
                    Ok(Some(position)) if position.is_open() => {
                        let stop_price = position.stop_loss;
                        self.supervisor
                            .clone()
                            .start_protection(&position, stop_price)
                            .await;
                    }
                    _ => warn!(
                        "Engine: Opened position {position_id} not found for protection setup"
                    ),
                }
            }
            Decision::Close => {
                let Some(position_id) = result.order.as_ref().and_then(|o| o.position_id) else {
                    return;
                };
                if let Ok(Some(position)) = self.positions.get(position_id).await {
                    if let Some(pnl) = position.pnl_chf {
                        self.breaker
                            .record_trade_result(pnl > Decimal::ZERO)
                            .await;
                    }
                    self.supervisor.stop_protection(position_id).await;
                }
            }
            Decision::Hold => {}
        }
    }
}

#[async_trait]
impl TradingCycle for TradingEngine {
    async fn run_cycle(&self) -> Result<()> {
        let started = Instant::now();

        let snapshots = self.collect_snapshots().await;
        self.refresh_position_marks(&snapshots).await;

        let balance_chf = match self.executor.account_balance_chf().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("Engine: Balance unavailable ({e}), using configured capital");
                self.config.capital_chf
            }
        };

        let open_positions = self.positions.open_positions(None).await?;
        let signals = self
            .signal_source
            .generate_signals(&snapshots, balance_chf, &open_positions)
            .await
            .context("signal source failed")?;

        info!(
            "Engine: {} snapshots, {} signals, balance CHF {:.2}",
            snapshots.len(),
            signals.len(),
            balance_chf
        );

        // Order submissions run in parallel across symbols; the executor
        // serializes actual submissions through its rate-limit buffer.
        let executions = join_all(signals.values().map(|signal| async move {
            let result = self
                .executor
                .execute_signal(
                    signal,
                    balance_chf,
                    self.config.chf_to_usd_rate,
                    Some(&self.risk_gate),
                )
                .await;
            (signal, result)
        }))
        .await;

        let mut executed = 0usize;
        for (signal, result) in &executions {
            self.handle_result(signal, result).await;
            if result.success && signal.decision != Decision::Hold {
                executed += 1;
            }
        }

        if executed > 0 {
            self.reconciler.run().await;
        }

        let summary = self.positions.daily_pnl(Utc::now().date_naive()).await?;
        self.metrics.set_open_positions(summary.open_positions);
        self.metrics.set_daily_pnl_chf(summary.total_pnl_chf);
        let breaker_status = self.breaker.check_daily_loss(summary.total_pnl_chf).await;
        self.metrics
            .set_circuit_breaker_tripped(breaker_status.state != BreakerState::Active);

        self.metrics
            .record_cycle(started.elapsed(), signals.len(), executed);
        info!(
            "Engine: Cycle done in {:.2}s ({} executed, daily P&L CHF {:.2})",
            started.elapsed().as_secs_f64(),
            executed,
            summary.total_pnl_chf
        );
        Ok(())
    }
}
