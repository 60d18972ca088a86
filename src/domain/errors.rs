use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by an exchange adapter.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Insufficient funds: need ${need}, available ${available}")]
    InsufficientFunds { need: Decimal, available: Decimal },

    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Exchange unavailable: {0}")]
    Unavailable(String),
}

impl ExchangeError {
    /// Network hiccups, rate limits and timeouts are worth retrying with
    /// backoff; order rejections and a tripped API breaker are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_)
                | ExchangeError::RateLimitExceeded(_)
                | ExchangeError::Timeout { .. }
        )
    }
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store timeout: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Backend(_))
    }
}

/// Errors raised by the position engine. Risk rejections are typed apart
/// from malformed input so callers can map them to distinct outcomes.
#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Risk limit exceeded: {0}")]
    RiskLimit(String),

    #[error("Position not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_retryable_exchange_errors() {
        assert!(ExchangeError::Network("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimitExceeded("429".into()).is_retryable());
        assert!(ExchangeError::Timeout { seconds: 10 }.is_retryable());
        assert!(!ExchangeError::InvalidOrder("bad qty".into()).is_retryable());
        assert!(
            !ExchangeError::InsufficientFunds {
                need: dec!(100),
                available: dec!(10)
            }
            .is_retryable()
        );
        assert!(!ExchangeError::Unavailable("breaker open".into()).is_retryable());
    }

    #[test]
    fn test_error_formatting() {
        let err = ExchangeError::InsufficientFunds {
            need: dec!(105.50),
            available: dec!(12.00),
        };
        let msg = err.to_string();
        assert!(msg.contains("105.50"));
        assert!(msg.contains("12.00"));
    }

    #[test]
    fn test_store_transience() {
        assert!(StoreError::Timeout("pool".into()).is_transient());
        assert!(!StoreError::NotFound("positions/abc".into()).is_transient());
        assert!(!StoreError::Conflict("row lock".into()).is_transient());
    }
}
