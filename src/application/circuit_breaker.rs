use crate::domain::ports::{AlertLevel, AlertSink, PositionCloser};
use crate::domain::trading::position::CloseReason;
use chrono::{DateTime, NaiveTime, Utc};
use rand::RngCore;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Active,
    Tripped,
    ManualResetRequired,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Snapshot of the breaker's state and daily counters.
#[derive(Debug, Clone)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub daily_pnl_chf: Decimal,
    pub daily_loss_limit_chf: Decimal,
    pub starting_balance_chf: Decimal,
    pub current_balance_chf: Decimal,
    pub daily_trade_count: u64,
    pub daily_winning_trades: u64,
    pub daily_losing_trades: u64,
    pub last_reset_at: DateTime<Utc>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub reset_token: Option<String>,
}

impl BreakerStatus {
    fn fresh(starting_balance_chf: Decimal, daily_loss_limit_chf: Decimal) -> Self {
        Self {
            state: BreakerState::Active,
            daily_pnl_chf: Decimal::ZERO,
            daily_loss_limit_chf,
            starting_balance_chf,
            current_balance_chf: starting_balance_chf,
            daily_trade_count: 0,
            daily_winning_trades: 0,
            daily_losing_trades: 0,
            last_reset_at: Utc::now(),
            tripped_at: None,
            reset_token: None,
        }
    }

    pub fn should_trip(&self) -> bool {
        self.state == BreakerState::Active && self.daily_pnl_chf < self.daily_loss_limit_chf
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub starting_balance_chf: Decimal,
    pub daily_loss_limit_chf: Decimal,
    pub reset_time_utc: NaiveTime,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            starting_balance_chf: dec!(2626.96),
            daily_loss_limit_chf: dec!(-183.89),
            reset_time_utc: NaiveTime::MIN,
        }
    }
}

/// Daily-loss kill switch.
///
/// Trips when cumulative daily P&L falls below the (negative) CHF limit,
/// makes a best-effort attempt to flatten the book, and then refuses all
/// trading until `manual_reset` is called with the token emitted at trip
/// time. A background task resets the counters at `reset_time_utc`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    status: RwLock<BreakerStatus>,
    alerts: Arc<dyn AlertSink>,
    closer: RwLock<Option<Arc<dyn PositionCloser>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, alerts: Arc<dyn AlertSink>) -> Self {
        info!(
            "CircuitBreaker: Initialized with starting balance CHF {}, daily loss limit CHF {}",
            config.starting_balance_chf, config.daily_loss_limit_chf
        );
        let status = BreakerStatus::fresh(config.starting_balance_chf, config.daily_loss_limit_chf);
        Self {
            config,
            status: RwLock::new(status),
            alerts,
            closer: RwLock::new(None),
        }
    }

    /// Wires the emergency closing surface. Done after construction since
    /// the executor is built later in the service graph.
    pub async fn set_closer(&self, closer: Arc<dyn PositionCloser>) {
        *self.closer.write().await = Some(closer);
    }

    pub async fn status(&self) -> BreakerStatus {
        self.status.read().await.clone()
    }

    pub async fn is_trading_allowed(&self) -> bool {
        self.status.read().await.state == BreakerState::Active
    }

    /// Updates daily P&L and trips if the limit is breached. Returns the
    /// post-check status.
    pub async fn check_daily_loss(&self, current_daily_pnl_chf: Decimal) -> BreakerStatus {
        {
            let mut status = self.status.write().await;
            status.daily_pnl_chf = current_daily_pnl_chf;
            status.current_balance_chf = status.starting_balance_chf + current_daily_pnl_chf;

            if status.state != BreakerState::Active {
                warn!("CircuitBreaker: Already in state {}", status.state);
                return status.clone();
            }
            if !status.should_trip() {
                return status.clone();
            }
            status.state = BreakerState::Tripped;
            status.tripped_at = Some(Utc::now());
        }

        self.trip().await;
        self.status.read().await.clone()
    }

    async fn trip(&self) {
        let pnl = self.status.read().await.daily_pnl_chf;
        error!(
            "CircuitBreaker: TRIPPED. Daily P&L CHF {:.2} below limit CHF {:.2}",
            pnl, self.config.daily_loss_limit_chf
        );
        self.alerts
            .send(
                AlertLevel::Critical,
                &format!("Circuit breaker TRIPPED: daily loss CHF {pnl:.2}"),
            )
            .await;

        // Best-effort flatten. Failures do not stop the lockout.
        self.close_all_positions().await;

        let token = generate_reset_token();
        {
            let mut status = self.status.write().await;
            status.state = BreakerState::ManualResetRequired;
            status.reset_token = Some(token.clone());
        }

        error!("CircuitBreaker: Manual reset required. Reset token: {token}");
        self.alerts
            .send(
                AlertLevel::Critical,
                &format!(
                    "Circuit breaker entered MANUAL RESET REQUIRED state. \
                     All trading halted. Reset token: {token}"
                ),
            )
            .await;
    }

    async fn close_all_positions(&self) {
        let closer = self.closer.read().await.clone();
        let Some(closer) = closer else {
            warn!("CircuitBreaker: No executor wired for emergency closure");
            return;
        };

        let positions = match closer.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("CircuitBreaker: Failed to list open positions: {e}");
                return;
            }
        };

        info!(
            "CircuitBreaker: Closing {} open positions",
            positions.len()
        );
        for position in positions {
            let result = closer
                .close_position(&position, CloseReason::CircuitBreaker)
                .await;
            if !result.success {
                error!(
                    "CircuitBreaker: Failed to close {} ({}): {}",
                    position.symbol,
                    position.id,
                    result.error_message.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    /// Exits `ManualResetRequired` when the supplied token matches.
    pub async fn manual_reset(&self, reset_token: &str) -> bool {
        {
            let status = self.status.read().await;
            if status.state != BreakerState::ManualResetRequired {
                warn!("CircuitBreaker: Not awaiting manual reset");
                return false;
            }
            if status.reset_token.as_deref() != Some(reset_token) {
                error!("CircuitBreaker: Invalid reset token provided");
                return false;
            }
        }

        warn!("CircuitBreaker: Manually reset");
        self.reset().await;
        self.alerts
            .send(
                AlertLevel::Warning,
                "Circuit breaker manually reset. Trading can resume.",
            )
            .await;
        true
    }

    /// Scheduled midnight reset. Zeroes counters and reactivates.
    pub async fn daily_reset(&self) {
        info!("CircuitBreaker: Performing daily reset");
        self.reset().await;
        self.alerts
            .send(AlertLevel::Info, "Circuit breaker daily reset complete")
            .await;
    }

    async fn reset(&self) {
        let mut status = self.status.write().await;
        *status = BreakerStatus::fresh(
            self.config.starting_balance_chf,
            self.config.daily_loss_limit_chf,
        );
    }

    pub async fn record_trade_result(&self, winning: bool) {
        let mut status = self.status.write().await;
        status.daily_trade_count += 1;
        if winning {
            status.daily_winning_trades += 1;
        } else {
            status.daily_losing_trades += 1;
        }
    }

    /// Spawns the daily-reset task: wakes every minute and resets when
    /// the wall clock is within one minute of `reset_time_utc`, unless a
    /// reset already happened in the last two minutes.
    pub fn spawn_daily_reset(self: Arc<Self>) -> JoinHandle<()> {
        let breaker = self;
        tokio::spawn(async move {
            info!("CircuitBreaker: Daily reset scheduler started");
            loop {
                let now = Utc::now();
                let recently_reset = {
                    let status = breaker.status.read().await;
                    now.signed_duration_since(status.last_reset_at)
                        < chrono::Duration::minutes(2)
                };
                if is_reset_time(now.time(), breaker.config.reset_time_utc) && !recently_reset {
                    breaker.daily_reset().await;
                    tokio::time::sleep(Duration::from_secs(120)).await;
                } else {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        })
    }
}

/// 16-char hex token from 8 random bytes.
fn generate_reset_token() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_reset_time(current: NaiveTime, reset: NaiveTime) -> bool {
    use chrono::Timelike;
    let current_minutes = current.hour() as i64 * 60 + current.minute() as i64;
    let reset_minutes = reset.hour() as i64 * 60 + reset.minute() as i64;
    let diff = (current_minutes - reset_minutes).abs();
    // Wraps across midnight: 23:59 is one minute from 00:00
    diff <= 1 || diff >= 24 * 60 - 1
}
