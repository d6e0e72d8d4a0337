//! Error classification for the SAGA participants.
//!
//! Business errors are terminal and surface as failure events that drive
//! compensation. Transient errors are retried through bus redelivery.
//! Everything else is fatal and keeps the offset uncommitted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Business
    PaymentDeclined,
    OutOfStock,
    InvalidOrder,
    OrderNotFound,
    DuplicateRequest,
    // Transient
    DatabaseError,
    NetworkError,
    TimeoutError,
    // Fatal
    SerializationError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PaymentDeclined => "PAYMENT_DECLINED",
            ErrorCode::OutOfStock => "OUT_OF_STOCK",
            ErrorCode::InvalidOrder => "INVALID_ORDER",
            ErrorCode::OrderNotFound => "ORDER_NOT_FOUND",
            ErrorCode::DuplicateRequest => "DUPLICATE_REQUEST",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
        }
    }

    /// Never retried; expressed as a failure event instead.
    pub fn is_business(self) -> bool {
        matches!(
            self,
            ErrorCode::PaymentDeclined
                | ErrorCode::OutOfStock
                | ErrorCode::InvalidOrder
                | ErrorCode::OrderNotFound
                | ErrorCode::DuplicateRequest
        )
    }

    /// Safe to retry via local retry or bus redelivery.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::DatabaseError | ErrorCode::NetworkError | ErrorCode::TimeoutError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified domain error.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct SagaError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SagaError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn is_business(&self) -> bool {
        self.code.is_business()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// True when the error chain bottoms out in a Postgres unique violation.
/// Handlers treat that as "already applied": the durable idempotency token
/// did its job, so the delivery is acknowledged without a second effect.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<diesel::result::Error>(),
        Some(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _
        ))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_splits_business_and_transient() {
        assert!(ErrorCode::PaymentDeclined.is_business());
        assert!(ErrorCode::OutOfStock.is_business());
        assert!(!ErrorCode::PaymentDeclined.is_retryable());

        assert!(ErrorCode::DatabaseError.is_retryable());
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(!ErrorCode::DatabaseError.is_business());

        assert!(!ErrorCode::SerializationError.is_business());
        assert!(!ErrorCode::SerializationError.is_retryable());
    }

    #[test]
    fn display_carries_the_code() {
        let err = SagaError::new(ErrorCode::InvalidOrder, "amount must be positive");
        assert_eq!(err.to_string(), "[INVALID_ORDER] amount must be positive");
    }

    #[test]
    fn wrapped_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "gateway timeout");
        let err = SagaError::wrap(ErrorCode::TimeoutError, "refund call timed out", io);
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::PaymentDeclined).unwrap();
        assert_eq!(json, "\"PAYMENT_DECLINED\"");
    }
}
