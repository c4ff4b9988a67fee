use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Coarse classification used by the throttler, the circuit breakers and the
/// relay engine to decide whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Upstream asked us to slow down.
    RateLimit,
    /// The call did not complete within its deadline.
    Timeout,
    /// Transport-level failure before the call reached the service.
    Connection,
    /// The service answered that it cannot serve right now.
    ServiceUnavailable,
    /// On-chain semantic rejection; retrying the same call cannot help.
    ChainReject,
    /// Anything we could not classify.
    Unknown,
}

impl ErrorClass {
    /// Classes worth retrying with back-off.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimit
                | ErrorClass::Timeout
                | ErrorClass::Connection
                | ErrorClass::ServiceUnavailable
        )
    }
}

/// Failure talking to a chain RPC or executing an on-chain action.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The endpoint rate limited the request.
    #[error("rate limited: {0}")]
    RateLimit(String),
    /// The call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Connecting to or speaking with the endpoint failed.
    #[error("connection error: {0}")]
    Connection(String),
    /// The endpoint reported itself unavailable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The chain rejected the transaction semantically, e.g. a wrong
    /// preimage or an already-withdrawn HTLC.
    #[error("rejected on chain: {0}")]
    Rejected(String),
    /// No healthy endpoint remained for the target chain.
    #[error("no healthy endpoint for {0}")]
    NoHealthyEndpoint(String),
    /// Unclassified failure.
    #[error("chain error: {0}")]
    Other(String),
}

impl ChainError {
    /// Map onto the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ChainError::RateLimit(_) => ErrorClass::RateLimit,
            ChainError::Timeout(_) => ErrorClass::Timeout,
            ChainError::Connection(_) | ChainError::NoHealthyEndpoint(_) => ErrorClass::Connection,
            ChainError::ServiceUnavailable(_) => ErrorClass::ServiceUnavailable,
            ChainError::Rejected(_) => ErrorClass::ChainReject,
            ChainError::Other(_) => ErrorClass::Unknown,
        }
    }

    /// Whether the engine should retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Stable machine-readable code surfaced across the process boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ChainError::RateLimit(_) => "CHAIN_RATE_LIMIT",
            ChainError::Timeout(_) => "CHAIN_TIMEOUT",
            ChainError::Connection(_) => "CHAIN_CONNECTION",
            ChainError::ServiceUnavailable(_) => "CHAIN_UNAVAILABLE",
            ChainError::Rejected(_) => "CHAIN_REJECT",
            ChainError::NoHealthyEndpoint(_) => "CHAIN_NO_ENDPOINT",
            ChainError::Other(_) => "CHAIN_UNKNOWN",
        }
    }
}

/// Failure against the truth or cache store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Retryable I/O failure; the operation may succeed if repeated.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Constraint violation; the write is invalid and must not be retried.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The store schema does not match what this build expects.
    #[error("schema mismatch: {0}")]
    Schema(String),
    /// Requested record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `relay`.
        kind: &'static str,
        /// Identifier that missed.
        id: String,
    },
    /// A state transition the data model forbids.
    #[error("illegal relay transition {from} -> {to}")]
    IllegalTransition {
        /// Status persisted now.
        from: crate::RelayStatus,
        /// Status the caller tried to write.
        to: crate::RelayStatus,
    },
    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The requested operation is not supported by this provider, e.g. ACID
    /// transactions against the cache backend.
    #[error("unsupported by this store provider: {0}")]
    Unsupported(&'static str),
    /// The migration registry or lock is in a state that needs an operator.
    #[error("migration error: {0}")]
    Migration(String),
}

impl StoreError {
    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Stable machine-readable code surfaced across the process boundary.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Transient(_) => "STORE_TRANSIENT",
            StoreError::Constraint(_) => "STORE_CONSTRAINT",
            StoreError::Schema(_) => "STORE_SCHEMA",
            StoreError::NotFound { .. } => "STORE_NOT_FOUND",
            StoreError::IllegalTransition { .. } => "STORE_ILLEGAL_TRANSITION",
            StoreError::Serde(_) => "STORE_SERDE",
            StoreError::Unsupported(_) => "STORE_UNSUPPORTED",
            StoreError::Migration(_) => "STORE_MIGRATION",
        }
    }
}

/// Convenience alias for chain-facing calls.
pub type ChainResult<T> = Result<T, ChainError>;

/// Convenience alias for store-facing calls.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_set_matches_taxonomy() {
        assert!(ErrorClass::RateLimit.is_retryable());
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::Connection.is_retryable());
        assert!(ErrorClass::ServiceUnavailable.is_retryable());
        assert!(!ErrorClass::ChainReject.is_retryable());
        assert!(!ErrorClass::Unknown.is_retryable());
    }

    #[test]
    fn chain_reject_is_not_retryable() {
        let err = ChainError::Rejected("wrong preimage".into());
        assert_eq!(err.class(), ErrorClass::ChainReject);
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "CHAIN_REJECT");
    }
}
