use crate::application::position_engine::{CreatePositionRequest, PositionEngine};
use crate::domain::errors::ExchangeError;
use crate::domain::ports::{ExchangeAdapter, MetricsSink, PositionCloser};
use crate::domain::repositories::{OrderStore, TradeHistory};
use crate::domain::trading::money::{chf_to_usd, round8, usd_to_chf};
use crate::domain::trading::order::{
    ExecutionErrorCode, ExecutionResult, Order, TradeKind, TradeRecord,
};
use crate::domain::trading::position::{CloseReason, Position, PositionSide};
use crate::domain::trading::types::{is_perpetual_symbol, Decision, OrderSide, OrderStatus, Signal};
use crate::infrastructure::core::api_breaker::ApiCircuitBreaker;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub rate_limit_buffer: Duration,
    pub balance_cache_ttl: Duration,
    pub chf_to_usd_rate: Decimal,
    /// Applied when a signal carries no leverage of its own.
    pub default_leverage: u32,
    pub enable_api_breaker: bool,
    pub api_breaker_failure_threshold: usize,
    pub api_breaker_recovery_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            rate_limit_buffer: Duration::from_millis(100),
            balance_cache_ttl: Duration::from_secs(60),
            chf_to_usd_rate: dec!(1.10),
            default_leverage: 5,
            enable_api_breaker: true,
            api_breaker_failure_threshold: 5,
            api_breaker_recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Orchestrates signal execution: risk validation, sizing, order
/// submission with retry and idempotent pre-persist, position mutation,
/// and Layer-1 stop placement.
pub struct TradeExecutor {
    exchange: Arc<dyn ExchangeAdapter>,
    engine: Arc<PositionEngine>,
    orders: Arc<dyn OrderStore>,
    history: Arc<dyn TradeHistory>,
    metrics: Arc<dyn MetricsSink>,
    config: ExecutorConfig,
    api_breaker: Option<ApiCircuitBreaker>,
    balance_cache: RwLock<Option<(Decimal, Instant)>>,
    last_submit: Mutex<Option<Instant>>,
}

impl TradeExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        engine: Arc<PositionEngine>,
        orders: Arc<dyn OrderStore>,
        history: Arc<dyn TradeHistory>,
        metrics: Arc<dyn MetricsSink>,
        config: ExecutorConfig,
    ) -> Self {
        let api_breaker = config.enable_api_breaker.then(|| {
            ApiCircuitBreaker::new(
                config.api_breaker_failure_threshold,
                config.api_breaker_recovery_timeout,
            )
        });
        Self {
            exchange,
            engine,
            orders,
            history,
            metrics,
            config,
            api_breaker,
            balance_cache: RwLock::new(None),
            last_submit: Mutex::new(None),
        }
    }

    /// Routes every exchange call through the API breaker when enabled.
    async fn exchange_call<T, F>(&self, endpoint: &str, f: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        match &self.api_breaker {
            Some(breaker) => breaker.call(endpoint, f).await,
            None => f.await,
        }
    }

    /// Exchange balance in CHF, cached for `balance_cache_ttl`. A failed
    /// refresh falls back to the stale cached value when one exists.
    pub async fn account_balance_chf(&self) -> Result<Decimal, ExchangeError> {
        if let Some((balance, at)) = *self.balance_cache.read().await
            && at.elapsed() < self.config.balance_cache_ttl
        {
            debug!(
                "Executor: Using cached balance CHF {:.2} (age {:?})",
                balance,
                at.elapsed()
            );
            return Ok(balance);
        }

        match self.exchange_call("balance", self.exchange.fetch_balance()).await {
            Ok(balance) => {
                let chf = round8(usd_to_chf(balance.total, self.config.chf_to_usd_rate));
                *self.balance_cache.write().await = Some((chf, Instant::now()));
                info!("Executor: Balance fetched and cached: CHF {:.2}", chf);
                Ok(chf)
            }
            Err(e) => {
                if let Some((stale, _)) = *self.balance_cache.read().await {
                    warn!(
                        "Executor: Balance fetch failed ({e}), serving stale cached CHF {:.2}",
                        stale
                    );
                    return Ok(stale);
                }
                Err(e)
            }
        }
    }

    /// Main orchestrator: validate, size, and act on one signal.
    pub async fn execute_signal(
        &self,
        signal: &Signal,
        balance_chf: Decimal,
        chf_to_usd_rate: Decimal,
        risk_gate: Option<&crate::application::risk_gate::RiskGate>,
    ) -> ExecutionResult {
        let start = Instant::now();

        // Hold is a no-op regardless of gate state
        if signal.decision == Decision::Hold {
            debug!("Executor: HOLD signal for {}, no action", signal.symbol);
            return ExecutionResult::ok(None, elapsed_ms(start));
        }

        if let Some(gate) = risk_gate {
            let validation = gate.validate(signal).await;
            if !validation.approved {
                warn!(
                    "Executor: Signal for {} rejected by risk gate: {}",
                    signal.symbol,
                    validation.rejection_reasons.join(", ")
                );
                return ExecutionResult::failure(
                    ExecutionErrorCode::RiskValidationFailed,
                    format!(
                        "Risk validation failed: {}",
                        validation.rejection_reasons.join(", ")
                    ),
                    elapsed_ms(start),
                );
            }
        }

        let ticker = match self
            .exchange_call("ticker", self.exchange.fetch_ticker(&signal.symbol))
            .await
        {
            Ok(ticker) => ticker,
            Err(e) => {
                error!("Executor: Ticker fetch failed for {}: {e}", signal.symbol);
                return ExecutionResult::failure(
                    ExecutionErrorCode::ExecutionError,
                    e.to_string(),
                    elapsed_ms(start),
                );
            }
        };
        let current_price = ticker.last;

        match signal.decision {
            Decision::Buy => {
                self.open_from_signal(
                    signal,
                    balance_chf,
                    chf_to_usd_rate,
                    current_price,
                    PositionSide::Long,
                    start,
                )
                .await
            }
            Decision::Sell => {
                self.open_from_signal(
                    signal,
                    balance_chf,
                    chf_to_usd_rate,
                    current_price,
                    PositionSide::Short,
                    start,
                )
                .await
            }
            Decision::Close => self.close_for_symbol(&signal.symbol, start).await,
            Decision::Hold => ExecutionResult::ok(None, elapsed_ms(start)),
        }
    }

    async fn open_from_signal(
        &self,
        signal: &Signal,
        balance_chf: Decimal,
        chf_to_usd_rate: Decimal,
        current_price: Decimal,
        side: PositionSide,
        start: Instant,
    ) -> ExecutionResult {
        // A position without a stop never reaches the exchange.
        let Some(stop_loss_pct) = signal.stop_loss_pct else {
            warn!(
                "Executor: Refusing to open {} without stop-loss",
                signal.symbol
            );
            return ExecutionResult::failure(
                ExecutionErrorCode::InvalidOrder,
                "Stop-loss is required to open a position",
                elapsed_ms(start),
            );
        };

        let capital_usd = chf_to_usd(balance_chf, chf_to_usd_rate);
        let notional_usd = capital_usd * signal.size_pct;
        let quantity = if current_price.is_zero() {
            Decimal::ZERO
        } else {
            round8(notional_usd / current_price)
        };
        if quantity <= Decimal::ZERO {
            return ExecutionResult::failure(
                ExecutionErrorCode::InvalidOrder,
                format!("Computed quantity {quantity} is not tradable"),
                elapsed_ms(start),
            );
        }

        info!(
            "Executor: Sizing {} {}: qty {} (${:.2} @ ${:.2})",
            side, signal.symbol, quantity, notional_usd, current_price
        );

        let stop_loss_price = match side {
            PositionSide::Long => round8(current_price * (Decimal::ONE - stop_loss_pct)),
            PositionSide::Short => round8(current_price * (Decimal::ONE + stop_loss_pct)),
        };
        let take_profit = signal.take_profit_pct.map(|tp| match side {
            PositionSide::Long => round8(current_price * (Decimal::ONE + tp)),
            PositionSide::Short => round8(current_price * (Decimal::ONE - tp)),
        });

        let entry_side = side.entry_order_side();
        let mut result = self
            .create_market_order(&signal.symbol, entry_side, quantity, false, None, None, None)
            .await;
        if !result.success {
            return result;
        }

        let entry_price = result
            .order
            .as_ref()
            .and_then(|o| o.average_fill_price)
            .unwrap_or(current_price);
        let filled_quantity = result
            .order
            .as_ref()
            .map(|o| o.filled_quantity)
            .filter(|q| *q > Decimal::ZERO)
            .unwrap_or(quantity);

        let position = match self
            .engine
            .create_position(CreatePositionRequest {
                symbol: signal.symbol.clone(),
                side,
                quantity: filled_quantity,
                entry_price,
                leverage: signal.leverage.unwrap_or(self.config.default_leverage),
                stop_loss: stop_loss_price,
                take_profit,
            })
            .await
        {
            Ok(position) => position,
            Err(e) => {
                // The fill already happened; the book is now ahead of the
                // store and reconciliation will flag the orphan.
                error!(
                    "Executor: Position create failed after fill for {}: {e}",
                    signal.symbol
                );
                return ExecutionResult::failure(
                    ExecutionErrorCode::PositionOpenError,
                    e.to_string(),
                    elapsed_ms(start),
                );
            }
        };

        if let Some(order) = result.order.as_mut() {
            order.position_id = Some(position.id);
            if let Err(e) = self.orders.save(order).await {
                warn!("Executor: Failed to backfill position id on order: {e}");
            }
        }

        // Layer 1 protection. Failure is logged, never rolled back:
        // Layers 2/3 still cover the position.
        let stop_result = self
            .create_stop_market_order(
                &signal.symbol,
                entry_side.opposite(),
                filled_quantity,
                stop_loss_price,
                Some(position.id),
            )
            .await;
        if !stop_result.success {
            warn!(
                "Executor: Failed to place stop-loss order for {}: {}",
                signal.symbol,
                stop_result.error_message.as_deref().unwrap_or("unknown")
            );
        }

        info!(
            "Executor: Opened {} {} ({})",
            side, signal.symbol, position.id
        );
        result.latency_ms = elapsed_ms(start);
        result
    }

    async fn close_for_symbol(&self, symbol: &str, start: Instant) -> ExecutionResult {
        let position = match self.engine.open_positions(Some(symbol)).await {
            Ok(positions) => positions.into_iter().next(),
            Err(e) => {
                return ExecutionResult::failure(
                    ExecutionErrorCode::ExecutionError,
                    e.to_string(),
                    elapsed_ms(start),
                );
            }
        };
        let Some(position) = position else {
            warn!("Executor: No open position found for {symbol}");
            return ExecutionResult::failure(
                ExecutionErrorCode::PositionNotFound,
                format!("No open position for {symbol}"),
                elapsed_ms(start),
            );
        };
        self.close_position(position.id, CloseReason::SignalClose)
            .await
    }

    /// Closes an open position with a reduce-only market order, then
    /// finalizes it in the position engine. Closing a position that is
    /// already gone reports `POSITION_NOT_FOUND`, which makes repeated
    /// stop-layer triggers no-ops.
    pub async fn close_position(&self, position_id: Uuid, reason: CloseReason) -> ExecutionResult {
        let start = Instant::now();

        let position = match self.engine.get(position_id).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                return ExecutionResult::failure(
                    ExecutionErrorCode::PositionNotFound,
                    format!("Position {position_id} not found"),
                    elapsed_ms(start),
                );
            }
            Err(e) => {
                return ExecutionResult::failure(
                    ExecutionErrorCode::ExecutionError,
                    e.to_string(),
                    elapsed_ms(start),
                );
            }
        };
        if !position.is_open() {
            debug!(
                "Executor: Close of {} is a no-op, position already {}",
                position_id, position.status
            );
            return ExecutionResult::failure(
                ExecutionErrorCode::PositionNotFound,
                format!("Position {position_id} is not open"),
                elapsed_ms(start),
            );
        }

        info!("Executor: Closing position {position_id} ({reason})");

        let ticker = match self
            .exchange_call("ticker", self.exchange.fetch_ticker(&position.symbol))
            .await
        {
            Ok(ticker) => ticker,
            Err(e) => {
                error!(
                    "Executor: Ticker fetch failed while closing {}: {e}",
                    position.symbol
                );
                return ExecutionResult::failure(
                    ExecutionErrorCode::ExecutionError,
                    e.to_string(),
                    elapsed_ms(start),
                );
            }
        };
        let close_price = ticker.last;

        // Order-level cash flow, before fees and without leverage.
        let realized_before_fees = match position.side {
            PositionSide::Long => (close_price - position.entry_price) * position.quantity,
            PositionSide::Short => (position.entry_price - close_price) * position.quantity,
        };

        let result = self
            .create_market_order(
                &position.symbol,
                position.side.exit_order_side(),
                position.quantity,
                true,
                Some(position.id),
                Some(reason),
                Some(realized_before_fees),
            )
            .await;
        if !result.success {
            error!(
                "Executor: Failed to close position {position_id}: {}",
                result.error_message.as_deref().unwrap_or("unknown")
            );
            return result;
        }

        if let Err(e) = self
            .engine
            .close_position(position_id, close_price, reason)
            .await
        {
            error!("Executor: Exchange close succeeded but position finalize failed: {e}");
            return ExecutionResult::failure(
                ExecutionErrorCode::ExecutionError,
                e.to_string(),
                elapsed_ms(start),
            );
        }

        info!("Executor: Position {position_id} closed ({reason})");
        result
    }

    /// Market order path. See `submit` for the retry and idempotency
    /// contract.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
        position_id: Option<Uuid>,
        reason: Option<CloseReason>,
        realized_pnl_before_fees: Option<Decimal>,
    ) -> ExecutionResult {
        let order = Order::market(symbol, side, quantity, reduce_only, position_id);
        self.submit(order, reason, realized_pnl_before_fees).await
    }

    /// Stop-market order path, always reduce-only (Layer 1 protection).
    pub async fn create_stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
        position_id: Option<Uuid>,
    ) -> ExecutionResult {
        let order = Order::stop_market(symbol, side, quantity, stop_price, position_id);
        let mut result = self.submit(order, None, None).await;
        if !result.success {
            result.error_code = Some(ExecutionErrorCode::StopOrderError);
        }
        result
    }

    /// Order submission contract:
    /// - the local order is persisted before submission and keeps its id
    ///   across retries; the exchange id attaches on first ack;
    /// - `NetworkError`/`RateLimitExceeded`/timeouts retry with
    ///   exponential backoff up to `max_retries`; `InvalidOrder` and
    ///   `InsufficientFunds` fail immediately;
    /// - a reduce-only order that does not reference an open position is
    ///   refused before any API call.
    async fn submit(
        &self,
        mut order: Order,
        reason: Option<CloseReason>,
        realized_pnl_before_fees: Option<Decimal>,
    ) -> ExecutionResult {
        let start = Instant::now();

        if !is_perpetual_symbol(&order.symbol) {
            let msg = format!(
                "Invalid symbol format: {}. Must be 'BASE/QUOTE:SETTLE' (e.g. 'BTC/USDT:USDT')",
                order.symbol
            );
            error!("Executor: {msg}");
            return ExecutionResult::failure(
                ExecutionErrorCode::InvalidSymbol,
                msg,
                elapsed_ms(start),
            );
        }

        if order.reduce_only {
            let open = match order.position_id {
                Some(id) => matches!(self.engine.get(id).await, Ok(Some(p)) if p.is_open()),
                None => false,
            };
            if !open {
                error!(
                    "Executor: INVARIANT VIOLATION - reduce-only order for {} has no open position reference. Refusing submission.",
                    order.symbol
                );
                return ExecutionResult::failure(
                    ExecutionErrorCode::ReduceOnlyViolation,
                    "Reduce-only order must reference an open position",
                    elapsed_ms(start),
                );
            }
        }

        // Idempotency: persist as Pending before touching the exchange so
        // a retry after an ambiguous failure reuses the same local id.
        if let Err(e) = self.orders.save(&order).await {
            error!(
                "Executor: Failed to pre-persist order {}: {e}. Aborting submission.",
                order.id
            );
            return ExecutionResult::failure(
                ExecutionErrorCode::ExecutionError,
                format!("Order persistence failed: {e}"),
                elapsed_ms(start),
            );
        }

        self.respect_rate_limit().await;

        let mut attempt = 0u32;
        loop {
            debug!(
                "Executor: Submitting {} order (attempt {}/{}): {} {} {} (reduceOnly={})",
                order.order_type,
                attempt + 1,
                self.config.max_retries,
                order.side,
                order.quantity,
                order.symbol,
                order.reduce_only
            );
            order.submitted_at = Some(Utc::now());

            match self.exchange_call("order", self.exchange.place_order(&order)).await {
                Ok(ack) => {
                    order.exchange_order_id = Some(ack.exchange_order_id);
                    order.status = ack.status;
                    order.filled_quantity = ack.filled_quantity;
                    order.average_fill_price = ack.average_fill_price;
                    order.fees_paid = ack.fees_paid;
                    if order.is_fully_filled() {
                        order.status = OrderStatus::Filled;
                        order.filled_at = Some(Utc::now());
                    }
                    let latency = elapsed_ms(start);
                    order.latency_ms = Some(latency);

                    if let Err(e) = self.orders.save(&order).await {
                        warn!("Executor: Failed to persist order ack {}: {e}", order.id);
                    }
                    self.metrics
                        .record_order(&order.symbol, &order.side.to_string(), true, latency);

                    info!(
                        "Executor: {} order executed: {} (filled {}, latency {:.2}ms)",
                        order.order_type,
                        order.exchange_order_id.as_deref().unwrap_or("-"),
                        order.filled_quantity,
                        latency
                    );

                    self.record_trade(&order, reason, realized_pnl_before_fees, latency)
                        .await;

                    return ExecutionResult::ok(Some(order), latency);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.pow(attempt);
                    warn!(
                        "Executor: {} on attempt {}/{}: {e}. Retrying in {:?}",
                        error_code_for(&e),
                        attempt + 1,
                        self.config.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let latency = elapsed_ms(start);
                    error!("Executor: Order {} failed: {e}", order.id);

                    order.status = OrderStatus::Failed;
                    if let Err(save_err) = self.orders.save(&order).await {
                        warn!(
                            "Executor: Failed to persist failed order {}: {save_err}",
                            order.id
                        );
                    }
                    self.metrics
                        .record_order(&order.symbol, &order.side.to_string(), false, latency);

                    return ExecutionResult::failure(error_code_for(&e), e.to_string(), latency);
                }
            }
        }
    }

    async fn record_trade(
        &self,
        order: &Order,
        reason: Option<CloseReason>,
        realized_pnl_before_fees: Option<Decimal>,
        latency: Decimal,
    ) {
        if !order.is_fully_filled() {
            return;
        }
        let Some(price) = order.average_fill_price else {
            return;
        };

        let realized_pnl = if order.reduce_only {
            realized_pnl_before_fees.map(|pnl| pnl - order.fees_paid)
        } else {
            None
        };
        let kind = TradeKind::classify(order.side, order.reduce_only, reason);
        let record = TradeRecord {
            kind,
            symbol: order.symbol.clone(),
            order_id: order
                .exchange_order_id
                .clone()
                .unwrap_or_else(|| order.id.to_string()),
            side: order.side,
            quantity: order.filled_quantity,
            price,
            fees: order.fees_paid,
            position_id: order.position_id,
            realized_pnl,
            latency_ms: latency,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.history.record(&record).await {
            // A history gap must not fail the trade itself
            error!("Executor: Failed to log trade to history: {e}");
        }
        self.metrics
            .record_trade(kind.as_str(), order.fees_paid, realized_pnl);
    }

    /// Spaces submissions by `rate_limit_buffer`.
    async fn respect_rate_limit(&self) {
        let mut last = self.last_submit.lock().await;
        if let Some(at) = *last {
            let since = at.elapsed();
            if since < self.config.rate_limit_buffer {
                tokio::time::sleep(self.config.rate_limit_buffer - since).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        self.exchange_call("cancel", self.exchange.cancel_order(order_id, symbol))
            .await
    }

    pub async fn fetch_ticker(
        &self,
        symbol: &str,
    ) -> Result<crate::domain::trading::types::Ticker, ExchangeError> {
        self.exchange_call("ticker", self.exchange.fetch_ticker(symbol))
            .await
    }
}

#[async_trait]
impl PositionCloser for TradeExecutor {
    async fn open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.engine.open_positions(None).await?)
    }

    async fn close_position(&self, position: &Position, reason: CloseReason) -> ExecutionResult {
        TradeExecutor::close_position(self, position.id, reason).await
    }
}

fn elapsed_ms(start: Instant) -> Decimal {
    Decimal::from_f64(start.elapsed().as_secs_f64() * 1000.0)
        .unwrap_or(Decimal::ZERO)
        .round_dp(2)
}

fn error_code_for(error: &ExchangeError) -> ExecutionErrorCode {
    match error {
        ExchangeError::Network(_) | ExchangeError::Timeout { .. } => {
            ExecutionErrorCode::NetworkError
        }
        ExchangeError::RateLimitExceeded(_) => ExecutionErrorCode::RateLimitExceeded,
        ExchangeError::InvalidOrder(_) => ExecutionErrorCode::InvalidOrder,
        ExchangeError::InsufficientFunds { .. } => ExecutionErrorCode::InsufficientFunds,
        ExchangeError::Unavailable(_) => ExecutionErrorCode::ExecutionError,
    }
}
