//! # Database Error Types
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  sqlx::Error ──────────► DbError (classified: unique, FK, pool, ...)   │
//! │                                                                         │
//! │  LedgerError ──────────► DbError::Ledger                               │
//! │  (rule rejected inside a transaction, e.g. insufficient funds)         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ServiceError (till-ledger) ← adds status code + retry classification  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use till_core::LedgerError;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Opening a second shift for the same store and day
    /// - Writing a second history row for the same sale reference
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation (unknown store, register, sale).
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// A ledger rule rejected the operation.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The database was locked by another writer for longer than the busy timeout.
    #[error("Database busy: {0}")]
    Busy(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// True when the unique violation came from the given index or column.
    pub fn is_unique_violation_on(&self, needle: &str) -> bool {
        matches!(self, DbError::UniqueViolation { field, .. } if field.contains(needle))
    }

    /// True for failures that may succeed if tried again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::ConnectionFailed(_) | DbError::Busy(_) | DbError::PoolExhausted
        )
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type / lock
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// sqlx::Error::Io             → DbError::ConnectionFailed
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // SQLite reports constraints by message:
                // "UNIQUE constraint failed: cash_registers.store_id, cash_registers.business_date"
                // "FOREIGN KEY constraint failed"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else if msg.contains("database is locked") || msg.contains("database is busy") {
                    DbError::Busy(msg.to_string())
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            sqlx::Error::Io(e) => DbError::ConnectionFailed(e.to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
