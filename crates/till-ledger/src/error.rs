//! # Service Error Types
//!
//! What callers of the ledger services see.
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Service Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │     Ledger      │  │    Database     │  │    Configuration        │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  400 amount,    │  │  503 busy,      │  │  InvalidConfig          │ │
//! │  │      funds,     │  │      pool,      │  │  ConfigLoadFailed       │ │
//! │  │      lifecycle  │  │      connection │  │  ConfigSaveFailed       │ │
//! │  │  403 closed     │  │  500 other      │  │                         │ │
//! │  │  404 missing    │  │                 │  │                         │ │
//! │  │  409 duplicate  │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Only infrastructure failures are retryable. Ledger rule violations    │
//! │  go back to the operator unchanged.                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use till_core::{LedgerError, ValidationError};
use till_db::DbError;

/// Result type alias for ledger service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    // =========================================================================
    // Ledger Errors
    // =========================================================================
    /// A ledger rule rejected the request.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The ledger store failed.
    #[error("Database error: {0}")]
    Db(DbError),

    /// The idempotency backend failed.
    #[error("Idempotency guard error: {0}")]
    Guard(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Input / Internal Errors
    // =========================================================================
    /// An event or file could not be decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

/// Rule violations detected inside a transaction surface as ledger errors,
/// not as database errors.
impl From<DbError> for ServiceError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Ledger(ledger) => ServiceError::Ledger(ledger),
            other => ServiceError::Db(other),
        }
    }
}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        ServiceError::Ledger(LedgerError::Validation(err))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for ServiceError {
    fn from(err: toml::de::Error) -> Self {
        ServiceError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for ServiceError {
    fn from(err: toml::ser::Error) -> Self {
        ServiceError::ConfigSaveFailed(err.to_string())
    }
}

#[cfg(feature = "redis-guard")]
impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::Guard(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl ServiceError {
    /// HTTP-style status an API layer should answer with.
    ///
    /// ## Mapping
    /// ```text
    /// InvalidAmount, InsufficientFunds, AlreadyOpen,
    /// AlreadyClosed, Validation                        → 400
    /// ShiftClosed                                      → 403
    /// RegisterNotFound, StoreNotFound, Db(NotFound)    → 404
    /// DuplicateEvent                                   → 409
    /// busy / pool / connection / guard backend         → 503
    /// everything else                                  → 500
    /// ```
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Ledger(err) => match err {
                LedgerError::InvalidAmount { .. }
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::AlreadyOpen { .. }
                | LedgerError::AlreadyClosed { .. }
                | LedgerError::Validation(_) => 400,
                LedgerError::ShiftClosed { .. } => 403,
                LedgerError::RegisterNotFound(_) | LedgerError::StoreNotFound(_) => 404,
                LedgerError::DuplicateEvent { .. } => 409,
            },
            ServiceError::Db(DbError::NotFound { .. }) => 404,
            ServiceError::Serialization(_) => 400,
            ServiceError::Guard(_) => 503,
            ServiceError::Db(err) if err.is_transient() => 503,
            _ => 500,
        }
    }

    /// Returns true if retrying the same call later may succeed.
    ///
    /// Ledger rule violations are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Db(err) => err.is_transient(),
            ServiceError::Guard(_) => true,
            _ => false,
        }
    }

    /// Returns true if the caller should treat the outcome as success.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ServiceError::Ledger(err) if err.is_duplicate())
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidConfig(_)
                | ServiceError::ConfigLoadFailed(_)
                | ServiceError::ConfigSaveFailed(_)
        )
    }
}
