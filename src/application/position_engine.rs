use crate::domain::errors::PositionError;
use crate::domain::repositories::{AuditEvent, PositionStore};
use crate::domain::trading::money::{round8, usd_to_chf};
use crate::domain::trading::position::{
    CloseReason, DailyPnlSummary, Position, PositionSide, PositionStatistics, PositionStatus,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PositionEngineConfig {
    pub capital_chf: Decimal,
    pub chf_to_usd_rate: Decimal,
    pub max_position_size_pct: Decimal,
    pub max_total_exposure_pct: Decimal,
    pub min_leverage: u32,
    pub max_leverage: u32,
    pub per_symbol_leverage: HashMap<String, u32>,
    pub daily_loss_limit_chf: Decimal,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for PositionEngineConfig {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        let per_symbol_leverage = HashMap::from([
            ("BTC/USDT:USDT".to_string(), 40),
            ("ETH/USDT:USDT".to_string(), 40),
            ("SOL/USDT:USDT".to_string(), 25),
            ("BNB/USDT:USDT".to_string(), 25),
            ("ADA/USDT:USDT".to_string(), 20),
            ("DOGE/USDT:USDT".to_string(), 20),
        ]);
        Self {
            capital_chf: dec!(2626.96),
            chf_to_usd_rate: dec!(1.10),
            max_position_size_pct: dec!(0.20),
            max_total_exposure_pct: dec!(0.80),
            min_leverage: 5,
            max_leverage: 40,
            per_symbol_leverage,
            daily_loss_limit_chf: dec!(-183.89),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatePositionRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
}

/// Position lifecycle engine: the only component allowed to mutate
/// position rows. Operations on the same id serialize through a per-id
/// lock; aggregate reads go straight to the store.
pub struct PositionEngine {
    store: Arc<dyn PositionStore>,
    config: PositionEngineConfig,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PositionEngine {
    pub fn new(store: Arc<dyn PositionStore>, config: PositionEngineConfig) -> Self {
        Self {
            store,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PositionEngineConfig {
        &self.config
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    /// Validates the request, assigns an id, and atomically inserts the
    /// position with its audit entry. Transient store errors are retried
    /// with exponential backoff.
    pub async fn create_position(
        &self,
        request: CreatePositionRequest,
    ) -> Result<Position, PositionError> {
        self.validate_create(&request).await?;

        let now = Utc::now();
        let position = Position {
            id: Uuid::new_v4(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: round8(request.quantity),
            entry_price: round8(request.entry_price),
            current_price: round8(request.entry_price),
            leverage: request.leverage,
            stop_loss: round8(request.stop_loss),
            take_profit: request.take_profit.map(round8),
            status: PositionStatus::Open,
            pnl_chf: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };

        let audit = AuditEvent::new(
            "POSITION_CREATED",
            "position",
            position.id,
            json!({
                "symbol": position.symbol,
                "side": position.side.to_string(),
                "quantity": position.quantity.to_string(),
                "entry_price": position.entry_price.to_string(),
                "leverage": position.leverage,
                "stop_loss": position.stop_loss.to_string(),
                "take_profit": position.take_profit.map(|tp| tp.to_string()),
            }),
        );

        self.with_store_retry(|| async { self.store.insert(&position, &audit).await })
            .await?;

        info!(
            "PositionEngine: Created {} {} {} @ {} ({}x, stop {})",
            position.side,
            position.quantity,
            position.symbol,
            position.entry_price,
            position.leverage,
            position.stop_loss
        );

        Ok(position)
    }

    async fn validate_create(&self, request: &CreatePositionRequest) -> Result<(), PositionError> {
        if request.quantity <= Decimal::ZERO {
            return Err(PositionError::Validation(
                "Quantity must be positive".to_string(),
            ));
        }
        if request.entry_price <= Decimal::ZERO {
            return Err(PositionError::Validation(
                "Entry price must be positive".to_string(),
            ));
        }
        if request.stop_loss <= Decimal::ZERO {
            return Err(PositionError::Validation(
                "Stop-loss is required and must be positive".to_string(),
            ));
        }
        match request.side {
            PositionSide::Long if request.stop_loss >= request.entry_price => {
                return Err(PositionError::Validation(format!(
                    "Long stop-loss {} must be below entry {}",
                    request.stop_loss, request.entry_price
                )));
            }
            PositionSide::Short if request.stop_loss <= request.entry_price => {
                return Err(PositionError::Validation(format!(
                    "Short stop-loss {} must be above entry {}",
                    request.stop_loss, request.entry_price
                )));
            }
            _ => {}
        }

        let max_leverage = match self.config.per_symbol_leverage.get(&request.symbol) {
            Some(max) => *max,
            None => {
                return Err(PositionError::RiskLimit(format!(
                    "Symbol {} is not in the trading allowlist",
                    request.symbol
                )));
            }
        };
        if request.leverage < self.config.min_leverage || request.leverage > max_leverage {
            return Err(PositionError::RiskLimit(format!(
                "Leverage {}x outside allowed range {}-{}x for {}",
                request.leverage, self.config.min_leverage, max_leverage, request.symbol
            )));
        }

        let value_chf = usd_to_chf(
            request.quantity * request.entry_price,
            self.config.chf_to_usd_rate,
        );
        let max_size_chf = self.config.capital_chf * self.config.max_position_size_pct;
        if value_chf > max_size_chf {
            return Err(PositionError::RiskLimit(format!(
                "Position value CHF {value_chf:.2} exceeds max CHF {max_size_chf:.2}"
            )));
        }

        let exposure_chf = usd_to_chf(
            request.quantity * request.entry_price * Decimal::from(request.leverage),
            self.config.chf_to_usd_rate,
        );
        let current_exposure_chf = self.total_exposure_chf().await?;
        let max_exposure_chf = self.config.capital_chf * self.config.max_total_exposure_pct;
        if current_exposure_chf + exposure_chf > max_exposure_chf {
            return Err(PositionError::RiskLimit(format!(
                "Total exposure CHF {:.2} would exceed max CHF {max_exposure_chf:.2}",
                current_exposure_chf + exposure_chf
            )));
        }

        Ok(())
    }

    /// Updates `current_price` and recomputes unrealized P&L. Never
    /// closes; a missing or closed position surfaces as `NotFound`.
    pub async fn update_price(
        &self,
        id: Uuid,
        current_price: Decimal,
    ) -> Result<Position, PositionError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut position = self
            .store
            .get(id)
            .await?
            .filter(|p| p.is_open())
            .ok_or(PositionError::NotFound(id))?;

        position.current_price = round8(current_price);
        position.updated_at = Utc::now();

        self.with_store_retry(|| async { self.store.update(&position).await })
            .await?;

        debug!(
            "PositionEngine: {} marked at {} (unrealized {:.2} USD)",
            position.symbol,
            position.current_price,
            position.unrealized_pnl_usd()
        );

        Ok(position)
    }

    /// Closes a position at `close_price`, realizing P&L in CHF and
    /// rolling it into the daily aggregate in the same transaction.
    /// Idempotent: closing an already-closed position returns the
    /// existing record without mutation.
    pub async fn close_position(
        &self,
        id: Uuid,
        close_price: Decimal,
        reason: CloseReason,
    ) -> Result<Position, PositionError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut position = self
            .store
            .get(id)
            .await?
            .ok_or(PositionError::NotFound(id))?;

        if !position.is_open() {
            debug!(
                "PositionEngine: Close of {} is a no-op, already {}",
                id, position.status
            );
            return Ok(position);
        }

        let close_price = round8(close_price);
        let pnl_usd = position.pnl_usd_at(close_price);
        let pnl_chf = round8(usd_to_chf(pnl_usd, self.config.chf_to_usd_rate));

        let now = Utc::now();
        position.status = reason.terminal_status();
        position.current_price = close_price;
        position.pnl_chf = Some(pnl_chf);
        position.closed_at = Some(now);
        position.updated_at = now;

        let audit = AuditEvent::new(
            "POSITION_CLOSED",
            "position",
            position.id,
            json!({
                "symbol": position.symbol,
                "side": position.side.to_string(),
                "close_price": close_price.to_string(),
                "pnl_usd": pnl_usd.to_string(),
                "pnl_chf": pnl_chf.to_string(),
                "reason": reason.as_str(),
            }),
        );

        self.with_store_retry(|| async { self.store.finalize_close(&position, &audit).await })
            .await?;

        info!(
            "PositionEngine: Closed {} ({}): pnl CHF {:.2} reason={}",
            position.symbol, position.id, pnl_chf, reason
        );

        Ok(position)
    }

    /// Overwrites the quantity of an open position with the authoritative
    /// exchange figure. Reconciliation-only path; audited.
    pub async fn correct_quantity(
        &self,
        id: Uuid,
        new_quantity: Decimal,
    ) -> Result<Position, PositionError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut position = self
            .store
            .get(id)
            .await?
            .filter(|p| p.is_open())
            .ok_or(PositionError::NotFound(id))?;

        let old_quantity = position.quantity;
        position.quantity = round8(new_quantity);
        position.updated_at = Utc::now();

        self.with_store_retry(|| async { self.store.update(&position).await })
            .await?;

        let audit = AuditEvent::new(
            "POSITION_QUANTITY_CORRECTED",
            "position",
            position.id,
            json!({
                "symbol": position.symbol,
                "correction": format!("Updated quantity from {} to {}", old_quantity, position.quantity),
            }),
        );
        if let Err(e) = self.store.append_audit(&audit).await {
            warn!("PositionEngine: Failed to audit quantity correction: {}", e);
        }

        info!(
            "PositionEngine: {} quantity corrected {} -> {}",
            position.symbol, old_quantity, position.quantity
        );

        Ok(position)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Position>, PositionError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<Position>, PositionError> {
        Ok(self.store.open_positions(symbol).await?)
    }

    /// Leveraged notional exposure over all open positions, in CHF.
    pub async fn total_exposure_chf(&self) -> Result<Decimal, PositionError> {
        let positions = self.store.open_positions(None).await?;
        let total_usd: Decimal = positions.iter().map(|p| p.exposure_usd()).sum();
        Ok(round8(usd_to_chf(total_usd, self.config.chf_to_usd_rate)))
    }

    /// Margin value (entry notional without leverage) over all open
    /// positions, in CHF. This is what the 20%/80% size fractions in the
    /// risk gate are measured against.
    pub async fn open_value_chf(&self) -> Result<Decimal, PositionError> {
        let positions = self.store.open_positions(None).await?;
        let total_usd: Decimal = positions.iter().map(|p| p.value_usd()).sum();
        Ok(round8(usd_to_chf(total_usd, self.config.chf_to_usd_rate)))
    }

    /// Realized + unrealized P&L for a calendar date, with the circuit
    /// breaker flag set when the total is at or below the daily limit.
    pub async fn daily_pnl(&self, date: NaiveDate) -> Result<DailyPnlSummary, PositionError> {
        let (realized_pnl_chf, closed_positions) = self.store.realized_pnl_for(date).await?;

        let open = self.store.open_positions(None).await?;
        let mut unrealized_pnl_chf = Decimal::ZERO;
        let mut total_exposure_chf = Decimal::ZERO;
        for position in &open {
            unrealized_pnl_chf += position.unrealized_pnl_chf(self.config.chf_to_usd_rate);
            total_exposure_chf += usd_to_chf(position.exposure_usd(), self.config.chf_to_usd_rate);
        }

        let total_pnl_chf = realized_pnl_chf + unrealized_pnl_chf;

        Ok(DailyPnlSummary {
            date,
            total_pnl_chf,
            realized_pnl_chf,
            unrealized_pnl_chf,
            open_positions: open.len() as u64,
            closed_positions,
            total_exposure_chf: round8(total_exposure_chf),
            circuit_breaker_breached: total_pnl_chf <= self.config.daily_loss_limit_chf,
        })
    }

    pub async fn statistics(&self) -> Result<PositionStatistics, PositionError> {
        let (total, open_count, closed) = self.store.position_counts().await?;
        let open = self.store.open_positions(None).await?;

        let mut stats = PositionStatistics {
            total_positions: total,
            open_positions: open_count,
            closed_positions: closed,
            ..Default::default()
        };
        for position in &open {
            stats.total_exposure_chf +=
                usd_to_chf(position.exposure_usd(), self.config.chf_to_usd_rate);
            stats.total_unrealized_pnl_chf +=
                position.unrealized_pnl_chf(self.config.chf_to_usd_rate);
            if position.is_stop_loss_hit() {
                stats.positions_at_stop_loss += 1;
            }
            if position.is_take_profit_hit() {
                stats.positions_at_take_profit += 1;
            }
        }
        let today = Utc::now().date_naive();
        stats.total_realized_pnl_chf = self.store.realized_pnl_for(today).await?.0;

        Ok(stats)
    }

    /// Open positions whose current price has crossed their stop. The
    /// sweep only identifies them; closing is the executor's job.
    pub async fn stop_loss_triggered(&self) -> Result<Vec<Position>, PositionError> {
        let open = self.store.open_positions(None).await?;
        Ok(open.into_iter().filter(|p| p.is_stop_loss_hit()).collect())
    }

    pub async fn take_profit_triggered(&self) -> Result<Vec<Position>, PositionError> {
        let open = self.store.open_positions(None).await?;
        Ok(open.into_iter().filter(|p| p.is_take_profit_hit()).collect())
    }

    async fn with_store_retry<F, Fut>(&self, mut op: F) -> Result<(), PositionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), crate::domain::errors::StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.pow(attempt);
                    warn!(
                        "PositionEngine: Store error on attempt {}/{}: {}. Retrying in {:?}",
                        attempt + 1,
                        self.config.max_retries,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::InMemoryPositionStore;
    use rust_decimal_macros::dec;

    fn engine() -> PositionEngine {
        PositionEngine::new(
            Arc::new(InMemoryPositionStore::new()),
            PositionEngineConfig::default(),
        )
    }

    fn long_request() -> CreatePositionRequest {
        CreatePositionRequest {
            symbol: "BTC/USDT:USDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.001),
            entry_price: dec!(50000),
            leverage: 10,
            stop_loss: dec!(49000),
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        assert!(position.is_open());
        assert_eq!(position.current_price, dec!(50000));

        let fetched = engine.get(position.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, position.id);
    }

    #[tokio::test]
    async fn test_create_rejects_missing_stop() {
        let engine = engine();
        let mut request = long_request();
        request.stop_loss = Decimal::ZERO;
        let err = engine.create_position(request).await.unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_stop_on_wrong_side() {
        let engine = engine();
        let mut request = long_request();
        request.stop_loss = dec!(51000);
        assert!(matches!(
            engine.create_position(request).await.unwrap_err(),
            PositionError::Validation(_)
        ));

        let mut request = long_request();
        request.side = PositionSide::Short;
        request.stop_loss = dec!(49000);
        assert!(matches!(
            engine.create_position(request).await.unwrap_err(),
            PositionError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_leverage_out_of_band() {
        let engine = engine();
        let mut request = long_request();
        request.leverage = 3;
        assert!(matches!(
            engine.create_position(request).await.unwrap_err(),
            PositionError::RiskLimit(_)
        ));

        // ADA caps at 20x
        let mut request = long_request();
        request.symbol = "ADA/USDT:USDT".to_string();
        request.entry_price = dec!(0.5);
        request.stop_loss = dec!(0.45);
        request.quantity = dec!(100);
        request.leverage = 25;
        assert!(matches!(
            engine.create_position(request).await.unwrap_err(),
            PositionError::RiskLimit(_)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_symbol() {
        let engine = engine();
        let mut request = long_request();
        request.symbol = "XRP/USDT:USDT".to_string();
        assert!(matches!(
            engine.create_position(request).await.unwrap_err(),
            PositionError::RiskLimit(_)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_position() {
        let engine = engine();
        let mut request = long_request();
        // 0.02 BTC * 50000 = 1000 USD ~ 909 CHF > 20% of 2626.96
        request.quantity = dec!(0.02);
        request.leverage = 5;
        assert!(matches!(
            engine.create_position(request).await.unwrap_err(),
            PositionError::RiskLimit(_)
        ));
    }

    #[tokio::test]
    async fn test_update_price_recomputes_pnl() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        let updated = engine.update_price(position.id, dec!(51000)).await.unwrap();
        assert_eq!(updated.current_price, dec!(51000));
        assert!(updated.is_open());
        // (51000 - 50000) * 0.001 * 10 = 10 USD
        assert_eq!(updated.unrealized_pnl_usd(), dec!(10.000));
    }

    #[tokio::test]
    async fn test_update_price_on_closed_is_not_found() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        engine
            .close_position(position.id, dec!(50000), CloseReason::Manual)
            .await
            .unwrap();
        assert!(matches!(
            engine.update_price(position.id, dec!(51000)).await,
            Err(PositionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_realizes_leveraged_pnl() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        let closed = engine
            .close_position(position.id, dec!(51000), CloseReason::SignalClose)
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(closed.closed_at.is_some());
        // (51000 - 50000) * 0.001 * 10 = 10 USD -> /1.10 CHF
        assert_eq!(closed.pnl_chf, Some(round8(dec!(10) / dec!(1.10))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        let first = engine
            .close_position(position.id, dec!(48000), CloseReason::StopLoss)
            .await
            .unwrap();
        let second = engine
            .close_position(position.id, dec!(60000), CloseReason::Manual)
            .await
            .unwrap();
        assert_eq!(first.pnl_chf, second.pnl_chf);
        assert_eq!(first.closed_at, second.closed_at);
        assert_eq!(first.current_price, second.current_price);
    }

    #[tokio::test]
    async fn test_liquidation_status() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        let closed = engine
            .close_position(position.id, dec!(40000), CloseReason::Liquidation)
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Liquidated);
    }

    #[tokio::test]
    async fn test_daily_pnl_combines_realized_and_unrealized() {
        let engine = engine();
        let closed = engine.create_position(long_request()).await.unwrap();
        engine
            .close_position(closed.id, dec!(51000), CloseReason::SignalClose)
            .await
            .unwrap();

        let mut request = long_request();
        request.symbol = "ETH/USDT:USDT".to_string();
        request.entry_price = dec!(3000);
        request.stop_loss = dec!(2900);
        request.quantity = dec!(0.01);
        let open = engine.create_position(request).await.unwrap();
        engine.update_price(open.id, dec!(3100)).await.unwrap();

        let summary = engine.daily_pnl(Utc::now().date_naive()).await.unwrap();
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.closed_positions, 1);
        let realized = round8(dec!(10) / dec!(1.10));
        let unrealized = round8(dec!(10) / dec!(1.10));
        assert_eq!(summary.realized_pnl_chf, realized);
        assert_eq!(summary.unrealized_pnl_chf, unrealized);
        assert_eq!(summary.total_pnl_chf, realized + unrealized);
        assert!(!summary.circuit_breaker_breached);
    }

    #[tokio::test]
    async fn test_correct_quantity_audits() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        let corrected = engine
            .correct_quantity(position.id, dec!(0.0008))
            .await
            .unwrap();
        assert_eq!(corrected.quantity, dec!(0.0008));
    }

    #[tokio::test]
    async fn test_stop_loss_sweep() {
        let engine = engine();
        let position = engine.create_position(long_request()).await.unwrap();
        assert!(engine.stop_loss_triggered().await.unwrap().is_empty());
        engine.update_price(position.id, dec!(48900)).await.unwrap();
        let triggered = engine.stop_loss_triggered().await.unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].id, position.id);
    }
}
