//! PostgreSQL storage backend for OctoAuth access tokens.
//!
//! Provides persistent storage for:
//!
//! - Access tokens and their lifecycle (`oauth_access_token`)
//! - The session to token binding index (`oauth_token_session_mapping`)
//!
//! Token values live in one of two columns: `access_token` for plaintext
//! and `access_token_hash` for digests. A partial unique index keeps at most
//! one `ACTIVE` row per logical key, and every multi-row operation runs in a
//! single transaction that locks the rows it changes with `FOR UPDATE`.
//!
//! # Example
//!
//! ```ignore
//! use octoauth::prelude::*;
//! use octoauth_postgres::PostgresTokenStore;
//!
//! let config = AuthConfig::from_file("octoauth.toml")?;
//! let store = PostgresTokenStore::from_config(&config).await?;
//! store.create_tables_if_not_exist().await?;
//!
//! let latest = store
//!     .get_latest("my-app", &user, None, "openid", &QueryOptions::new())
//!     .await?;
//! ```

pub mod pool;
mod row;
pub mod schema;
pub mod session_token_index;
pub mod token;

use octoauth::config::ConfigError;
use octoauth::error::AuthError;
use sqlx_core::pool::Pool;
use sqlx_postgres::Postgres;

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

pub use pool::create_pool;
pub use token::PostgresTokenStore;

/// Partial unique index holding one `ACTIVE` row per logical key.
pub(crate) const ACTIVE_KEY_INDEX: &str = "uq_oauth_access_token_active_key";

/// Unique index over the stored token value of rows that are not `INACTIVE`.
pub(crate) const VALUE_INDEX: &str = "uq_oauth_access_token_value";

pub(crate) const PRIMARY_KEY: &str = "oauth_access_token_pkey";

// SQLSTATE codes PostgreSQL raises when concurrent transactions collide.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur inside the PostgreSQL token store.
///
/// Never surfaced directly: every variant converts into an [`AuthError`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(sqlx_core::Error),

    /// A concurrent writer won; the operation may be retried.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Token id or token value is already taken.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// A stored row could not be decoded.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// The store configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The request was rejected before or during the transaction.
    #[error(transparent)]
    Rejected(#[from] AuthError),
}

impl StorageError {
    /// Create a `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create an `InvalidRow` error.
    #[must_use]
    pub fn invalid_row(message: impl Into<String>) -> Self {
        Self::InvalidRow(message.into())
    }

    /// Returns `true` if retrying the whole transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns `true` if this is a database error.
    #[must_use]
    pub fn is_database_error(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx_core::Error> for StorageError {
    fn from(err: sqlx_core::Error) -> Self {
        if let sqlx_core::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return match db_err.constraint() {
                    // Another transaction filed an ACTIVE row for the same key
                    Some(ACTIVE_KEY_INDEX) => Self::conflict(db_err.message().to_string()),
                    Some(PRIMARY_KEY) => Self::Duplicate("token_id".to_string()),
                    Some(VALUE_INDEX) => Self::Duplicate("access token value".to_string()),
                    Some(constraint) => Self::Duplicate(constraint.to_string()),
                    None => Self::Duplicate(db_err.message().to_string()),
                };
            }
            let code = db_err.code();
            if matches!(
                code.as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
            ) {
                return Self::conflict(db_err.message().to_string());
            }
        }
        Self::Database(err)
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Rejected(err) => err,
            StorageError::Duplicate(what) => AuthError::duplicate_token(&what),
            StorageError::Conflict(message) => AuthError::serialization_conflict(message),
            StorageError::Config(err) => AuthError::storage(err),
            err @ (StorageError::Database(_) | StorageError::InvalidRow(_)) => {
                AuthError::storage(err)
            }
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// Tests
// =============================================================================
