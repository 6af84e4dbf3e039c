//! Table definitions for the token store.
//!
//! `oauth_access_token` holds one row per issued token. Plaintext and hashed
//! values go to separate columns so that a row can never hold both. The
//! logical key is spread over `consumer_key`, `authz_user_key`,
//! `user_domain`, `tenant_id`, `token_scope_hash` and `token_binding_ref`.
//!
//! `oauth_token_session_mapping` is the binding index. Rows cascade away
//! with their token.

use sqlx_core::query::query;
use tracing::{info, instrument};

use crate::{PgPool, StorageResult};

const CREATE_ACCESS_TOKEN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS oauth_access_token (
    token_id                        TEXT PRIMARY KEY,
    access_token                    TEXT,
    access_token_hash               VARCHAR(128),
    hash_algorithm                  TEXT,
    refresh_token                   TEXT,
    refresh_token_hash              VARCHAR(128),
    refresh_token_id                TEXT,
    consumer_key                    TEXT NOT NULL,
    authz_user                      TEXT NOT NULL,
    authz_user_key                  TEXT NOT NULL,
    user_domain                     TEXT NOT NULL,
    tenant_id                       INTEGER NOT NULL,
    federated                       BOOLEAN NOT NULL DEFAULT FALSE,
    token_scope                     TEXT NOT NULL,
    token_scope_hash                TEXT NOT NULL,
    grant_type                      TEXT NOT NULL,
    token_state                     TEXT NOT NULL,
    token_state_id                  TEXT NOT NULL,
    time_created                    TIMESTAMPTZ NOT NULL,
    refresh_token_time_created      TIMESTAMPTZ,
    validity_period                 BIGINT NOT NULL,
    refresh_token_validity_period   BIGINT NOT NULL,
    token_binding_ref               TEXT NOT NULL DEFAULT 'NONE',
    consented_token                 BOOLEAN NOT NULL DEFAULT FALSE,
    revoked_by                      TEXT,
    CONSTRAINT chk_oauth_access_token_value
        CHECK ((access_token IS NULL) <> (access_token_hash IS NULL)),
    CONSTRAINT chk_oauth_refresh_token_value
        CHECK (refresh_token IS NULL OR refresh_token_hash IS NULL),
    CONSTRAINT chk_oauth_access_token_state
        CHECK (token_state IN ('ACTIVE', 'EXPIRED', 'REVOKED', 'INACTIVE'))
)
"#;

const CREATE_VALUE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS uq_oauth_access_token_value
    ON oauth_access_token ((COALESCE(access_token_hash, access_token)))
    WHERE token_state <> 'INACTIVE'
"#;

const CREATE_ACTIVE_KEY_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS uq_oauth_access_token_active_key
    ON oauth_access_token (
        consumer_key, authz_user_key, user_domain, tenant_id,
        token_scope_hash, token_binding_ref
    )
    WHERE token_state = 'ACTIVE'
"#;

const CREATE_KEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_oauth_access_token_key
    ON oauth_access_token (
        consumer_key, authz_user_key, tenant_id, user_domain,
        token_scope_hash, token_binding_ref, token_state
    )
"#;

const CREATE_TENANT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_oauth_access_token_tenant
    ON oauth_access_token (tenant_id, user_domain, token_state)
"#;

const CREATE_SESSION_MAPPING_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS oauth_token_session_mapping (
    session_id  TEXT NOT NULL,
    token_id    TEXT NOT NULL REFERENCES oauth_access_token (token_id) ON DELETE CASCADE,
    tenant_id   INTEGER NOT NULL,
    PRIMARY KEY (session_id, token_id, tenant_id)
)
"#;

const CREATE_SESSION_TOKEN_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_oauth_token_session_mapping_token
    ON oauth_token_session_mapping (token_id)
"#;

/// Statements in dependency order.
const STATEMENTS: [&str; 7] = [
    CREATE_ACCESS_TOKEN_TABLE,
    CREATE_VALUE_INDEX,
    CREATE_ACTIVE_KEY_INDEX,
    CREATE_KEY_INDEX,
    CREATE_TENANT_INDEX,
    CREATE_SESSION_MAPPING_TABLE,
    CREATE_SESSION_TOKEN_INDEX,
];

/// Creates the token tables and indexes if they do not exist yet.
///
/// Idempotent; runs in one transaction.
///
/// # Errors
///
/// Returns an error if any statement fails.
#[instrument(skip(pool))]
pub async fn create_tables_if_not_exist(pool: &PgPool) -> StorageResult<()> {
    let mut tx = pool.begin().await?;
    for statement in STATEMENTS {
        query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!("Access token tables are ready");
    Ok(())
}
