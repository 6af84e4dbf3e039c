//! Connection pool management for the PostgreSQL token store.

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::Postgres;
use tracing::{debug, info, instrument};

use octoauth::config::{ConfigError, StorageConfig};

use crate::{PgPool, StorageResult};

/// Type alias for PostgreSQL pool options.
pub type PgPoolOptions = PoolOptions<Postgres>;

/// Creates a connection pool from the `storage` section.
///
/// # Errors
///
/// Returns `ConfigError::Missing` without a URL, or the driver error if the
/// first connection cannot be established.
#[instrument(skip(config), fields(url = %config.url.as_deref().map(mask_password).unwrap_or_default()))]
pub async fn create_pool(config: &StorageConfig) -> StorageResult<PgPool> {
    let url = config
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ConfigError::Missing("storage.url".to_string()))?;

    info!(
        max_connections = config.max_connections,
        acquire_timeout = ?config.acquire_timeout,
        "Creating PostgreSQL connection pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(url)
        .await?;

    debug!("PostgreSQL connection pool created successfully");

    Ok(pool)
}

/// Masks the password in a database URL for logging.
pub(crate) fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@')
        && let Some(colon_pos) = url[..at_pos].rfind(':')
    {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if colon_pos > scheme_end {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
