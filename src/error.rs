//! Error types for the Checkstand SDK

use crate::billing::BillingResponseCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckstandError>;

/// Stable error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Platform billing service unreachable or not connected
    ConnectionError,
    /// Retryable network-level failure (timeout, 5xx, connection reset)
    TransientNetworkError,
    /// 401 / 402 / 422 - the ledger authority rejected the request; never retried
    PermanentServerError,
    /// 429 - retried exactly once after an extended delay
    RateLimited,
    /// Name resolution failed; triggers host failover when repeated
    UnknownHostError,
    /// The ledger authority rejected the purchase payload
    ValidationError,
    /// The user dismissed the platform purchase UI; terminal, not a failure
    UserCanceled,
    /// A billing-service call failed with a platform response code
    BillingError,
    /// Retry budget exhausted without a recorded error
    RetriesExhausted,
}

#[derive(Debug, Error)]
pub enum CheckstandError {
    #[error("billing service unavailable: {0}")]
    Connection(String),

    #[error("{message}")]
    Transient {
        message: String,
        details: Option<String>,
    },

    #[error("server rejected request ({status}): {message}")]
    Permanent {
        status: u16,
        message: String,
        details: Option<String>,
    },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("could not resolve host: {0}")]
    UnknownHost(String),

    #[error("purchase validation failed: {message}")]
    Validation {
        message: String,
        details: Option<String>,
    },

    #[error("purchase canceled by user")]
    UserCanceled,

    #[error("billing call failed with {code:?}: {message}")]
    Billing {
        code: BillingResponseCode,
        message: String,
    },

    #[error("ran out of time to retry")]
    RetriesExhausted,
}

impl CheckstandError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn billing(code: BillingResponseCode, message: impl Into<String>) -> Self {
        Self::Billing {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection(_) => ErrorCode::ConnectionError,
            Self::Transient { .. } => ErrorCode::TransientNetworkError,
            Self::Permanent { .. } => ErrorCode::PermanentServerError,
            Self::RateLimited(_) => ErrorCode::RateLimited,
            Self::UnknownHost(_) => ErrorCode::UnknownHostError,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::UserCanceled => ErrorCode::UserCanceled,
            Self::Billing { .. } => ErrorCode::BillingError,
            Self::RetriesExhausted => ErrorCode::RetriesExhausted,
        }
    }

    /// Whether the retry loop may attempt this call again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::TransientNetworkError
                | ErrorCode::UnknownHostError
                | ErrorCode::ConnectionError
        )
    }

    /// Optional secondary message (server debug detail).
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Transient { details, .. }
            | Self::Permanent { details, .. }
            | Self::Validation { details, .. } => details.as_deref(),
            _ => None,
        }
    }
}

/// Map an HTTP status and server message to a typed error.
///
/// Only 401, 402 and 422 are permanent; 429 gets a single delayed retry;
/// every other non-2xx status is treated as transient.
pub fn classify_status(status: u16, message: String, details: Option<String>) -> CheckstandError {
    match status {
        401 | 402 => CheckstandError::Permanent {
            status,
            message,
            details,
        },
        422 => CheckstandError::Validation { message, details },
        429 => CheckstandError::RateLimited(message),
        _ => CheckstandError::Transient {
            message: format!("request failed with status {}: {}", status, message),
            details,
        },
    }
}
