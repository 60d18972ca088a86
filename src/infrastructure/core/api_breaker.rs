use crate::domain::errors::ExchangeError;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    /// Connectivity looks healthy, calls pass through
    Closed,
    /// Too many consecutive connectivity failures, calls fail fast
    Open,
    /// Recovery window elapsed, the next call is a probe
    HalfOpen,
}

struct Inner {
    state: GuardState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

/// Guards exchange API calls against hammering a dead connection.
/// Not to be confused with the trading circuit breaker: this one watches
/// connectivity, not P&L.
///
/// Only connectivity-class errors count toward opening the circuit.
/// An `InvalidOrder` or `InsufficientFunds` rejection means the exchange
/// answered, so it clears the failure streak like a success would. While
/// open, every call fails fast with `ExchangeError::Unavailable`; once
/// `recovery_timeout` has elapsed the next call goes through as a probe
/// and its outcome decides whether the circuit closes or reopens.
pub struct ApiCircuitBreaker {
    inner: RwLock<Inner>,
    failure_threshold: usize,
    recovery_timeout: Duration,
}

impl ApiCircuitBreaker {
    /// # Arguments
    /// * `failure_threshold` - Consecutive connectivity failures before opening
    /// * `recovery_timeout` - Wait before letting a probe call through
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: GuardState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Runs one exchange call under the guard. `endpoint` only labels
    /// log lines and the fail-fast error.
    pub async fn call<T, F>(&self, endpoint: &str, f: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        if let Some(retry_in) = self.reject_or_probe(endpoint).await {
            return Err(ExchangeError::Unavailable(format!(
                "exchange API circuit open ({endpoint}), retry in {retry_in:?}"
            )));
        }

        match f.await {
            Ok(value) => {
                self.record_reachable(endpoint).await;
                Ok(value)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.record_connectivity_failure(endpoint, &e).await;
                } else {
                    // The exchange answered; a rejection is not an outage
                    self.record_reachable(endpoint).await;
                }
                Err(e)
            }
        }
    }

    /// Returns the remaining wait when the call must fail fast; `None`
    /// lets the call through (closed circuit or recovery probe).
    async fn reject_or_probe(&self, endpoint: &str) -> Option<Duration> {
        let mut inner = self.inner.write().await;
        if inner.state != GuardState::Open {
            return None;
        }

        let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
        if elapsed < self.recovery_timeout {
            return Some(self.recovery_timeout - elapsed);
        }

        info!("ApiCircuitBreaker: Recovery window elapsed, probing via {endpoint}");
        inner.state = GuardState::HalfOpen;
        None
    }

    async fn record_reachable(&self, endpoint: &str) {
        let mut inner = self.inner.write().await;
        if inner.state == GuardState::HalfOpen {
            info!("ApiCircuitBreaker: Probe via {endpoint} succeeded, circuit closed");
        }
        inner.state = GuardState::Closed;
        inner.consecutive_failures = 0;
    }

    async fn record_connectivity_failure(&self, endpoint: &str, cause: &ExchangeError) {
        let mut inner = self.inner.write().await;
        match inner.state {
            GuardState::HalfOpen => {
                warn!("ApiCircuitBreaker: Probe via {endpoint} failed ({cause}), circuit reopened");
                inner.state = GuardState::Open;
                inner.opened_at = Some(Instant::now());
            }
            GuardState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    error!(
                        "ApiCircuitBreaker: {} consecutive connectivity failures (last: {cause} via {endpoint}), circuit open for {:?}",
                        inner.consecutive_failures, self.recovery_timeout
                    );
                    inner.state = GuardState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            GuardState::Open => {}
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.state == GuardState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn network_err<T>() -> Result<T, ExchangeError> {
        Err(ExchangeError::Network("connection reset".into()))
    }

    async fn trip(guard: &ApiCircuitBreaker, failures: usize) {
        for _ in 0..failures {
            let _ = guard.call("ticker", async { network_err::<()>() }).await;
        }
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_connectivity_failures() {
        let guard = ApiCircuitBreaker::new(3, Duration::from_secs(60));
        trip(&guard, 3).await;
        assert!(guard.is_open().await);

        // Fail fast without running the inner call
        let executed = AtomicUsize::new(0);
        let result = guard
            .call("ticker", async {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ExchangeError>(())
            })
            .await;
        assert!(matches!(result, Err(ExchangeError::Unavailable(_))));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejections_do_not_open_circuit() {
        let guard = ApiCircuitBreaker::new(2, Duration::from_secs(60));
        for _ in 0..5 {
            let _ = guard
                .call("order", async {
                    Err::<(), _>(ExchangeError::InvalidOrder("bad qty".into()))
                })
                .await;
        }
        assert!(!guard.is_open().await);

        // A rejection mid-streak resets the connectivity counter
        let _ = guard.call("order", async { network_err::<()>() }).await;
        let _ = guard
            .call("order", async {
                Err::<(), _>(ExchangeError::InsufficientFunds {
                    need: dec!(100),
                    available: dec!(1),
                })
            })
            .await;
        let _ = guard.call("order", async { network_err::<()>() }).await;
        assert!(!guard.is_open().await);
    }

    #[tokio::test]
    async fn test_successful_probe_closes_circuit() {
        let guard = ApiCircuitBreaker::new(2, Duration::from_millis(50));
        trip(&guard, 2).await;
        assert!(guard.is_open().await);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Probe passes through and closes the circuit
        assert!(
            guard
                .call("balance", async { Ok::<(), ExchangeError>(()) })
                .await
                .is_ok()
        );
        assert!(!guard.is_open().await);
        assert!(
            guard
                .call("balance", async { Ok::<(), ExchangeError>(()) })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_circuit() {
        let guard = ApiCircuitBreaker::new(2, Duration::from_millis(50));
        trip(&guard, 2).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = guard.call("ticker", async { network_err::<()>() }).await;
        assert!(guard.is_open().await);

        // Back to failing fast until the next recovery window
        let result = guard
            .call("ticker", async { Ok::<(), ExchangeError>(()) })
            .await;
        assert!(matches!(result, Err(ExchangeError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_probe_rejection_also_closes() {
        let guard = ApiCircuitBreaker::new(2, Duration::from_millis(50));
        trip(&guard, 2).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        // The exchange answering with a rejection still proves it is back
        let _ = guard
            .call("order", async {
                Err::<(), _>(ExchangeError::InvalidOrder("bad qty".into()))
            })
            .await;
        assert!(!guard.is_open().await);
    }
}
