//! Access token storage over `oauth_access_token`.
//!
//! Every write runs in its own transaction. Rows that change state are
//! locked with `SELECT ... FOR UPDATE` first, so concurrent writers on the
//! same token serialize, and the partial unique index on the logical key
//! turns a lost insert race into a retryable conflict.

use std::collections::BTreeSet;
use std::future::Future;
use std::slice;
use std::sync::Arc;

use async_trait::async_trait;
use octoauth::AuthResult;
use octoauth::config::AuthConfig;
use octoauth::error::AuthError;
use octoauth::storage::{
    AccessTokenStorage, BindingIndexStorage, ConsentFlagStorage, OpenIdScopeViews, PreparedRecord,
    QueryOptions, RevocationFailure, RevocationMode, RevocationReport, RevokeOptions,
    RotateRequest, StoreSettings, UserStoreDomainMigration,
};
use octoauth::token::{
    OPENID_SCOPE, TokenForm, TokenKey, mask_token, normalize_binding, normalize_domain,
};
use octoauth::types::{ACTIVE_STATE_ID, AccessTokenRecord, AuthenticatedUser, TokenState};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::PgConnection;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::row::{
    NEWEST_FIRST, STORED_VALUE, TOKEN_COLUMNS, algorithm_of, record_from_row, records_from_rows,
    split_value,
};
use crate::session_token_index::SessionTokenIndex;
use crate::{PgPool, StorageError, StorageResult, create_pool, schema};

/// Default number of retries after a write conflict.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

// =============================================================================
// Transaction Steps
// =============================================================================

fn admitted_states(include_expired: bool) -> Vec<String> {
    let mut states = vec![TokenState::Active.to_string()];
    if include_expired {
        states.push(TokenState::Expired.to_string());
    }
    states
}

/// Locks a row, returning its state and consumer key.
async fn lock_row(
    conn: &mut PgConnection,
    token_id: &str,
) -> StorageResult<Option<(TokenState, String)>> {
    let row: Option<(String, String)> = query_as(
        r#"
        SELECT token_state, consumer_key
        FROM oauth_access_token
        WHERE token_id = $1
        FOR UPDATE
        "#,
    )
    .bind(token_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|(state, consumer_key)| {
        state
            .parse::<TokenState>()
            .map(|state| (state, consumer_key))
            .map_err(|e| StorageError::invalid_row(e.to_string()))
    })
    .transpose()
}

/// Moves a locked row to `next`.
///
/// A row leaving `ACTIVE` gets `state_id`, or a fresh one when none is
/// given, and loses its session mappings.
async fn transition(
    conn: &mut PgConnection,
    token_id: &str,
    current: TokenState,
    next: TokenState,
    state_id: Option<String>,
) -> StorageResult<()> {
    let state_id = match state_id {
        Some(state_id) => Some(state_id),
        None if current == TokenState::Active => Some(Uuid::new_v4().to_string()),
        None => None,
    };

    query(
        r#"
        UPDATE oauth_access_token
        SET token_state = $2, token_state_id = COALESCE($3, token_state_id)
        WHERE token_id = $1
        "#,
    )
    .bind(token_id)
    .bind(next.as_str())
    .bind(state_id)
    .execute(&mut *conn)
    .await?;

    if next != TokenState::Active {
        SessionTokenIndex::new(conn)
            .delete_for_tokens(&[token_id.to_string()])
            .await?;
    }
    Ok(())
}

/// Expires the `ACTIVE` row of a key, returning its id.
async fn supersede_active(
    conn: &mut PgConnection,
    key: &TokenKey,
) -> StorageResult<Option<String>> {
    let superseded = query_scalar::<_, String>(
        r#"
        UPDATE oauth_access_token
        SET token_state = 'EXPIRED', token_state_id = $7
        WHERE consumer_key = $1
          AND authz_user_key = $2
          AND user_domain = $3
          AND tenant_id = $4
          AND token_scope_hash = $5
          AND token_binding_ref = $6
          AND token_state = 'ACTIVE'
        RETURNING token_id
        "#,
    )
    .bind(&key.consumer_key)
    .bind(&key.user.username)
    .bind(&key.user.user_store_domain)
    .bind(key.user.tenant_id)
    .bind(key.scope_hash())
    .bind(&key.binding_ref)
    .bind(Uuid::new_v4().to_string())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(token_id) = &superseded {
        SessionTokenIndex::new(conn)
            .delete_for_tokens(slice::from_ref(token_id))
            .await?;
    }
    Ok(superseded)
}

async fn insert_row(conn: &mut PgConnection, prepared: &PreparedRecord) -> StorageResult<()> {
    let PreparedRecord { record, key } = prepared;
    let (access_token, access_token_hash) = split_value(&record.access_token);
    let (refresh_token, refresh_token_hash) = record
        .refresh_token
        .as_ref()
        .map(split_value)
        .unwrap_or((None, None));

    query(
        r#"
        INSERT INTO oauth_access_token (
            token_id, access_token, access_token_hash, hash_algorithm,
            refresh_token, refresh_token_hash, refresh_token_id, consumer_key,
            authz_user, authz_user_key, user_domain, tenant_id, federated,
            token_scope, token_scope_hash, grant_type, token_state, token_state_id,
            time_created, refresh_token_time_created, validity_period,
            refresh_token_validity_period, token_binding_ref, consented_token, revoked_by
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
        )
        "#,
    )
    .bind(&record.token_id)
    .bind(access_token)
    .bind(access_token_hash)
    .bind(algorithm_of(record))
    .bind(refresh_token)
    .bind(refresh_token_hash)
    .bind(&record.refresh_token_id)
    .bind(&record.consumer_key)
    .bind(&record.authenticated_user.username)
    .bind(&key.user.username)
    .bind(&record.authenticated_user.user_store_domain)
    .bind(record.authenticated_user.tenant_id)
    .bind(record.authenticated_user.federated)
    .bind(&key.scope)
    .bind(key.scope_hash())
    .bind(&record.grant_type)
    .bind(record.token_state.as_str())
    .bind(&record.token_state_id)
    .bind(record.issued_time)
    .bind(record.refresh_token_issued_time)
    .bind(record.validity_period_ms)
    .bind(record.refresh_token_validity_period_ms)
    .bind(&record.token_binding_reference)
    .bind(record.is_consented_grant)
    .bind(&record.revoked_by)
    .execute(&mut *conn)
    .await?;

    if record.token_state == TokenState::Active && record.is_bound() {
        SessionTokenIndex::new(conn)
            .insert(
                &record.token_binding_reference,
                &record.token_id,
                record.authenticated_user.tenant_id,
            )
            .await?;
    }
    Ok(())
}

/// Inserts a row, expiring the `ACTIVE` row it supersedes.
async fn write_prepared(
    conn: &mut PgConnection,
    prepared: &PreparedRecord,
) -> StorageResult<Option<String>> {
    let superseded = if prepared.record.token_state == TokenState::Active {
        supersede_active(&mut *conn, &prepared.key).await?
    } else {
        None
    };
    insert_row(conn, prepared).await?;
    Ok(superseded)
}

/// Revokes the `ACTIVE` row holding a stored value.
async fn revoke_value(conn: &mut PgConnection, stored: &str) -> StorageResult<Option<String>> {
    let revoked = query_scalar::<_, String>(&format!(
        r#"
        UPDATE oauth_access_token
        SET token_state = 'REVOKED', token_state_id = $2
        WHERE {STORED_VALUE} = $1 AND token_state = 'ACTIVE'
        RETURNING token_id
        "#
    ))
    .bind(stored)
    .bind(Uuid::new_v4().to_string())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(token_id) = &revoked {
        SessionTokenIndex::new(conn)
            .delete_for_tokens(slice::from_ref(token_id))
            .await?;
    }
    Ok(revoked)
}

// =============================================================================
// PostgreSQL Token Store
// =============================================================================

/// PostgreSQL access token store.
///
/// Implements the full access token contract, including every optional
/// facet. Cloning is cheap and clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresTokenStore {
    pool: Arc<PgPool>,
    settings: StoreSettings,
    conflict_retries: u32,
}

impl PostgresTokenStore {
    /// Create a new store with an existing connection pool.
    #[must_use]
    pub fn new(pool: Arc<PgPool>, settings: StoreSettings) -> Self {
        Self {
            pool,
            settings,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    /// How many times a write that lost a race is retried.
    #[must_use]
    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }

    /// Create a new store by connecting to the configured database.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the connection
    /// fails.
    pub async fn from_config(config: &AuthConfig) -> StorageResult<Self> {
        config.validate()?;
        let settings = StoreSettings::from_config(config)?;
        let pool = create_pool(&config.storage).await?;
        Ok(Self::new(Arc::new(pool), settings)
            .with_conflict_retries(config.storage.conflict_retries))
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a reference to the Arc-wrapped pool.
    #[must_use]
    pub fn pool_arc(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    #[must_use]
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Creates the token tables and indexes if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the DDL fails.
    pub async fn create_tables_if_not_exist(&self) -> AuthResult<()> {
        Ok(schema::create_tables_if_not_exist(&self.pool).await?)
    }

    /// Runs `attempt` until it succeeds, fails for good, or the retry budget
    /// is spent. Each attempt is a whole transaction.
    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> AuthResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(err) if err.is_retryable() && retries < self.conflict_retries => {
                    retries += 1;
                    warn!(operation, retries, error = %err, "Retrying after write conflict");
                }
                result => return result.map_err(AuthError::from),
            }
        }
    }

    fn prepare_active(
        &self,
        record: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<PreparedRecord> {
        let mut prepared = self.settings.prepare(record, user_store_domain)?;
        prepared.record.token_state = TokenState::Active;
        prepared.record.token_state_id = ACTIVE_STATE_ID.to_string();
        Ok(prepared)
    }

    // -------------------------------------------------------------------------
    // Write transactions
    // -------------------------------------------------------------------------

    async fn try_insert(&self, prepared: &PreparedRecord) -> StorageResult<Option<String>> {
        let mut tx = self.pool.begin().await?;
        let superseded = write_prepared(&mut tx, prepared).await?;
        tx.commit().await?;
        Ok(superseded)
    }

    async fn try_insert_conditional(
        &self,
        prepared: &PreparedRecord,
        existing_id: &str,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        if !matches!(
            lock_row(&mut tx, existing_id).await?,
            Some((TokenState::Active, _))
        ) {
            return Ok(false);
        }

        transition(
            &mut tx,
            existing_id,
            TokenState::Active,
            TokenState::Expired,
            None,
        )
        .await?;
        write_prepared(&mut tx, prepared).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn try_rotate(
        &self,
        request: &RotateRequest,
        prepared: &PreparedRecord,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        let (current, consumer_key) = lock_row(&mut tx, &request.old_token_id)
            .await?
            .ok_or_else(|| AuthError::token_not_found(&request.old_token_id))?;

        if consumer_key != request.consumer_key {
            return Err(AuthError::invalid_request(format!(
                "token {} was not issued to {}",
                request.old_token_id, request.consumer_key
            ))
            .into());
        }
        let next = request.old_token_state;
        if next == TokenState::Active || (current != next && !current.can_transition_to(next)) {
            return Err(AuthError::invalid_transition(current, next).into());
        }

        if current != next {
            transition(
                &mut tx,
                &request.old_token_id,
                current,
                next,
                request.old_token_state_id.clone(),
            )
            .await?;
        }
        write_prepared(&mut tx, prepared).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn try_update_state(
        &self,
        token_id: &str,
        next: TokenState,
        grant_type: Option<&str>,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        let (current, _) = lock_row(&mut tx, token_id)
            .await?
            .ok_or_else(|| AuthError::token_not_found(token_id))?;
        if current == next {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            return Err(AuthError::invalid_transition(current, next).into());
        }

        transition(&mut tx, token_id, current, next, None).await?;
        if let Some(grant_type) = grant_type {
            query("UPDATE oauth_access_token SET grant_type = $2 WHERE token_id = $1")
                .bind(token_id)
                .bind(grant_type)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn try_revoke_by_id(&self, token_id: &str, acting_user_id: &str) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        let (current, _) = lock_row(&mut tx, token_id)
            .await?
            .ok_or_else(|| AuthError::token_not_found(token_id))?;
        if current != TokenState::Active {
            return Ok(false);
        }

        transition(&mut tx, token_id, current, TokenState::Revoked, None).await?;
        query("UPDATE oauth_access_token SET revoked_by = $2 WHERE token_id = $1")
            .bind(token_id)
            .bind(acting_user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn try_revoke_batch(&self, values: &[String]) -> StorageResult<RevocationReport> {
        let mut report = RevocationReport::default();
        let mut tx = self.pool.begin().await?;
        for value in values {
            match revoke_value(&mut tx, value).await? {
                Some(token_id) => report.revoked.push(token_id),
                None => report.skipped += 1,
            }
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn try_revoke_one(&self, value: &str) -> StorageResult<Option<String>> {
        let mut tx = self.pool.begin().await?;
        let revoked = revoke_value(&mut tx, value).await?;
        tx.commit().await?;
        Ok(revoked)
    }

    async fn try_store_session_mapping(
        &self,
        session_id: &str,
        token_id: &str,
        tenant_id: i32,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        let state = query_scalar::<_, String>(
            "SELECT token_state FROM oauth_access_token WHERE token_id = $1 FOR SHARE",
        )
        .bind(token_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AuthError::token_not_found(token_id))?;
        if state != TokenState::Active.as_str() {
            return Ok(false);
        }

        SessionTokenIndex::new(&mut tx)
            .insert(session_id, token_id, tenant_id)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Returns (relabelled, superseded).
    async fn try_rename_user_store(
        &self,
        tenant_id: i32,
        old_domain: &str,
        new_domain: &str,
    ) -> StorageResult<(u64, u64)> {
        let mut tx = self.pool.begin().await?;

        // Old-domain ACTIVE rows whose relabelled key already has an ACTIVE row
        let colliding = query_scalar::<_, String>(
            r#"
            SELECT o.token_id
            FROM oauth_access_token o
            WHERE o.tenant_id = $1
              AND o.user_domain = $2
              AND o.token_state = 'ACTIVE'
              AND EXISTS (
                  SELECT 1
                  FROM oauth_access_token n
                  WHERE n.tenant_id = o.tenant_id
                    AND n.user_domain = $3
                    AND n.token_state = 'ACTIVE'
                    AND n.consumer_key = o.consumer_key
                    AND n.authz_user_key = o.authz_user_key
                    AND n.token_scope_hash = o.token_scope_hash
                    AND n.token_binding_ref = o.token_binding_ref
              )
            FOR UPDATE OF o
            "#,
        )
        .bind(tenant_id)
        .bind(old_domain)
        .bind(new_domain)
        .fetch_all(&mut *tx)
        .await?;

        for token_id in &colliding {
            transition(
                &mut tx,
                token_id,
                TokenState::Active,
                TokenState::Expired,
                None,
            )
            .await?;
        }

        let relabelled = query(
            r#"
            UPDATE oauth_access_token
            SET user_domain = $3
            WHERE tenant_id = $1 AND user_domain = $2
            "#,
        )
        .bind(tenant_id)
        .bind(old_domain)
        .bind(new_domain)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok((relabelled, colliding.len() as u64))
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    async fn fetch_active_where(
        &self,
        predicate: &str,
        binds: &[&str],
        tenant_id: Option<i32>,
    ) -> StorageResult<Vec<AccessTokenRecord>> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM oauth_access_token \
             WHERE token_state = 'ACTIVE' AND {predicate} {NEWEST_FIRST}"
        );
        let mut q = query(&sql);
        for bind in binds {
            q = q.bind(*bind);
        }
        if let Some(tenant_id) = tenant_id {
            q = q.bind(tenant_id);
        }
        let rows = q.fetch_all(&*self.pool).await?;
        records_from_rows(&rows)
    }
}

#[async_trait]
impl AccessTokenStorage for PostgresTokenStore {
    #[instrument(skip(self, record), fields(token_id = %record.token_id))]
    async fn insert(
        &self,
        record: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<()> {
        let prepared = self.settings.prepare(record, user_store_domain)?;
        let superseded = self
            .with_retries("insert", || self.try_insert(&prepared))
            .await?;
        if let Some(previous) = superseded {
            debug!(previous = %previous, "Expired superseded access token");
        }
        Ok(())
    }

    #[instrument(
        skip(self, new_record, existing),
        fields(new_id = %new_record.token_id, existing_id = %existing.token_id)
    )]
    async fn insert_conditional(
        &self,
        new_record: &AccessTokenRecord,
        existing: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<bool> {
        let prepared = self.prepare_active(new_record, user_store_domain)?;
        let replaced = self
            .with_retries("insert_conditional", || {
                self.try_insert_conditional(&prepared, &existing.token_id)
            })
            .await?;
        if !replaced {
            debug!("Existing token is no longer the active token of its key");
        }
        Ok(replaced)
    }

    #[instrument(skip(self, user))]
    async fn get_latest_many(
        &self,
        consumer_key: &str,
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        scope: &str,
        options: &QueryOptions,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let key = self.settings.query_key(
            consumer_key,
            user,
            user_store_domain,
            scope,
            options.binding_ref.as_deref(),
        );
        let binding = options.binding_ref.as_ref().map(|_| key.binding_ref.as_str());
        let limit = options
            .limit
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));

        let sql = format!(
            r#"
            SELECT {TOKEN_COLUMNS}
            FROM oauth_access_token
            WHERE consumer_key = $1
              AND authz_user_key = $2
              AND user_domain = $3
              AND tenant_id = $4
              AND token_scope_hash = $5
              AND ($6::TEXT IS NULL OR token_binding_ref = $6)
              AND token_state = ANY($7)
            {NEWEST_FIRST}
            LIMIT $8
            "#
        );
        let rows = query(&sql)
            .bind(&key.consumer_key)
            .bind(&key.user.username)
            .bind(&key.user.user_store_domain)
            .bind(key.user.tenant_id)
            .bind(key.scope_hash())
            .bind(binding)
            .bind(admitted_states(options.include_expired))
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(records_from_rows(&rows)?)
    }

    #[instrument(skip(self, user))]
    async fn get_all_for_client_user(
        &self,
        consumer_key: &str,
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        include_expired: bool,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let user_key = self.settings.user_key(user, user_store_domain);
        let sql = format!(
            r#"
            SELECT {TOKEN_COLUMNS}
            FROM oauth_access_token
            WHERE consumer_key = $1
              AND authz_user_key = $2
              AND user_domain = $3
              AND tenant_id = $4
              AND token_state = ANY($5)
            {NEWEST_FIRST}
            "#
        );
        let rows = query(&sql)
            .bind(consumer_key)
            .bind(&user_key.username)
            .bind(&user_key.user_store_domain)
            .bind(user_key.tenant_id)
            .bind(admitted_states(include_expired))
            .fetch_all(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(records_from_rows(&rows)?)
    }

    #[instrument(skip(self))]
    async fn get_active_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let sql = format!(
            r#"
            SELECT {TOKEN_COLUMNS}
            FROM oauth_access_token
            WHERE consumer_key = $1
              AND token_state = 'ACTIVE'
              AND (
                  validity_period < 0
                  OR EXTRACT(EPOCH FROM ($2 - time_created)) * 1000 < validity_period
              )
            {NEWEST_FIRST}
            "#
        );
        let rows = query(&sql)
            .bind(consumer_key)
            .bind(OffsetDateTime::now_utc())
            .fetch_all(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(records_from_rows(&rows)?)
    }

    #[instrument(skip(self, user), fields(user = %user.qualified_name()))]
    async fn get_by_user(&self, user: &AuthenticatedUser) -> AuthResult<Vec<String>> {
        let user_key = self.settings.user_key(user, None);
        let sql = format!(
            r#"
            SELECT {STORED_VALUE}
            FROM oauth_access_token
            WHERE authz_user_key = $1
              AND user_domain = $2
              AND tenant_id = $3
              AND token_state = 'ACTIVE'
            {NEWEST_FIRST}
            "#
        );
        let values = query_scalar::<_, String>(&sql)
            .bind(&user_key.username)
            .bind(&user_key.user_store_domain)
            .bind(user_key.tenant_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(values)
    }

    #[instrument(skip(self))]
    async fn get_by_tenant(&self, tenant_id: i32) -> AuthResult<Vec<AccessTokenRecord>> {
        Ok(self
            .fetch_active_where("tenant_id = $1", &[], Some(tenant_id))
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_by_user_store(
        &self,
        tenant_id: i32,
        user_store_domain: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let domain = normalize_domain(user_store_domain);
        Ok(self
            .fetch_active_where(
                "user_domain = $1 AND tenant_id = $2",
                &[domain.as_str()],
                Some(tenant_id),
            )
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_by_token_id(&self, token_id: &str) -> AuthResult<Option<AccessTokenRecord>> {
        let sql = format!("SELECT {TOKEN_COLUMNS} FROM oauth_access_token WHERE token_id = $1");
        let row = query(&sql)
            .bind(token_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    #[instrument(skip(self, access_token))]
    async fn get_token_id_by_access_token(
        &self,
        access_token: &str,
    ) -> AuthResult<Option<String>> {
        let stored = self.settings.lookup_value(access_token, TokenForm::Detect);
        let sql = format!(
            "SELECT token_id FROM oauth_access_token \
             WHERE {STORED_VALUE} = $1 AND token_state <> 'INACTIVE'"
        );
        let token_id = query_scalar::<_, String>(&sql)
            .bind(stored)
            .fetch_optional(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(token_id)
    }

    #[instrument(skip(self, access_token))]
    async fn get_by_access_token(
        &self,
        access_token: &str,
        include_expired: bool,
    ) -> AuthResult<Option<AccessTokenRecord>> {
        let stored = self.settings.lookup_value(access_token, TokenForm::Detect);
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM oauth_access_token \
             WHERE {STORED_VALUE} = $1 AND token_state <> 'INACTIVE'"
        );
        let row = query(&sql)
            .bind(stored)
            .fetch_optional(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        let record = row.as_ref().map(record_from_row).transpose()?;
        Ok(record.filter(|r| include_expired || r.token_state == TokenState::Active))
    }

    #[instrument(skip(self, tokens), fields(count = tokens.len()))]
    async fn revoke(
        &self,
        tokens: &[String],
        options: &RevokeOptions,
    ) -> AuthResult<RevocationReport> {
        let form = TokenForm::from_is_hashed(options.is_hashed);
        let values: Vec<String> = tokens
            .iter()
            .map(|t| self.settings.lookup_value(t, form))
            .collect();

        let report = match self.settings.revocation_mode(options) {
            RevocationMode::Batch => {
                self.with_retries("revoke", || self.try_revoke_batch(&values))
                    .await?
            }
            RevocationMode::Individual => {
                let mut report = RevocationReport::default();
                for (token, value) in tokens.iter().zip(&values) {
                    match self
                        .with_retries("revoke", || self.try_revoke_one(value))
                        .await
                    {
                        Ok(Some(token_id)) => report.revoked.push(token_id),
                        Ok(None) => report.skipped += 1,
                        Err(error) => {
                            warn!(token = %mask_token(token), error = %error, "Failed to revoke access token");
                            report.failed.push(RevocationFailure {
                                token: mask_token(token),
                                error,
                            });
                        }
                    }
                }
                report
            }
        };

        info!(
            revoked = report.revoked.len(),
            skipped = report.skipped,
            failed = report.failed.len(),
            "Revoked access tokens"
        );
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn revoke_by_id(&self, token_id: &str, acting_user_id: &str) -> AuthResult<()> {
        let revoked = self
            .with_retries("revoke_by_id", || {
                self.try_revoke_by_id(token_id, acting_user_id)
            })
            .await?;
        if revoked {
            info!("Access token revoked");
        } else {
            debug!("Access token was not active, nothing to revoke");
        }
        Ok(())
    }

    #[instrument(
        skip(self, request),
        fields(old_id = %request.old_token_id, new_id = %request.new_record.token_id)
    )]
    async fn rotate(&self, request: RotateRequest) -> AuthResult<()> {
        let mut new_record = request.new_record.clone();
        if let Some(grant_type) = &request.grant_type {
            new_record.grant_type = grant_type.clone();
        }
        let prepared = self.prepare_active(&new_record, request.user_store_domain.as_deref())?;
        self.with_retries("rotate", || self.try_rotate(&request, &prepared))
            .await
    }

    #[instrument(skip(self))]
    async fn update_state(
        &self,
        token_id: &str,
        new_state: TokenState,
        grant_type: Option<&str>,
    ) -> AuthResult<()> {
        let changed = self
            .with_retries("update_state", || {
                self.try_update_state(token_id, new_state, grant_type)
            })
            .await?;
        if changed {
            debug!("Access token state updated");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_inactive(&self) -> AuthResult<u64> {
        let purged = query("DELETE FROM oauth_access_token WHERE token_state = 'INACTIVE'")
            .execute(&*self.pool)
            .await
            .map_err(StorageError::from)?
            .rows_affected();
        info!(purged, "Purged inactive access tokens");
        Ok(purged)
    }

    fn binding_index(&self) -> Option<&dyn BindingIndexStorage> {
        Some(self)
    }

    fn openid_views(&self) -> Option<&dyn OpenIdScopeViews> {
        Some(self)
    }

    fn consent(&self) -> Option<&dyn ConsentFlagStorage> {
        Some(self)
    }
}

#[async_trait]
impl BindingIndexStorage for PostgresTokenStore {
    #[instrument(skip(self))]
    async fn get_token_ids_by_session(&self, session_id: &str) -> AuthResult<BTreeSet<String>> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::from)?;
        Ok(SessionTokenIndex::new(&mut conn)
            .find_token_ids(session_id)
            .await?)
    }

    #[instrument(skip(self))]
    async fn store_session_mapping(
        &self,
        session_id: &str,
        token_id: &str,
        tenant_id: i32,
    ) -> AuthResult<()> {
        let stored = self
            .with_retries("store_session_mapping", || {
                self.try_store_session_mapping(session_id, token_id, tenant_id)
            })
            .await?;
        if !stored {
            debug!("Token is not active, session mapping ignored");
        }
        Ok(())
    }

    #[instrument(skip(self, user))]
    async fn get_by_binding_ref(
        &self,
        binding_ref: &str,
        user: Option<&AuthenticatedUser>,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let binding = normalize_binding(Some(binding_ref));
        let user_key = user.map(|u| self.settings.user_key(u, None));
        let sql = format!(
            r#"
            SELECT {TOKEN_COLUMNS}
            FROM oauth_access_token
            WHERE token_state = 'ACTIVE'
              AND token_binding_ref = $1
              AND (
                  $2::TEXT IS NULL
                  OR (authz_user_key = $2 AND user_domain = $3 AND tenant_id = $4)
              )
            {NEWEST_FIRST}
            "#
        );
        let rows = query(&sql)
            .bind(binding)
            .bind(user_key.as_ref().map(|k| k.username.as_str()))
            .bind(user_key.as_ref().map(|k| k.user_store_domain.as_str()))
            .bind(user_key.as_ref().map(|k| k.tenant_id))
            .fetch_all(&*self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(records_from_rows(&rows)?)
    }
}

#[async_trait]
impl OpenIdScopeViews for PostgresTokenStore {
    #[instrument(skip(self, user))]
    async fn get_openid_tokens_by_user(
        &self,
        user: &AuthenticatedUser,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let user_key = self.settings.user_key(user, None);
        Ok(self
            .fetch_active_where(
                "$1 = ANY(string_to_array(token_scope, ' ')) \
                 AND authz_user_key = $2 AND user_domain = $3 AND tenant_id = $4",
                &[
                    OPENID_SCOPE,
                    user_key.username.as_str(),
                    user_key.user_store_domain.as_str(),
                ],
                Some(user_key.tenant_id),
            )
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_openid_tokens_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        Ok(self
            .fetch_active_where(
                "$1 = ANY(string_to_array(token_scope, ' ')) AND consumer_key = $2",
                &[OPENID_SCOPE, consumer_key],
                None,
            )
            .await?)
    }
}

#[async_trait]
impl ConsentFlagStorage for PostgresTokenStore {
    #[instrument(skip(self))]
    async fn update_consent_flag(&self, token_id: &str, is_consented: bool) -> AuthResult<()> {
        let rows_affected =
            query("UPDATE oauth_access_token SET consented_token = $2 WHERE token_id = $1")
                .bind(token_id)
                .bind(is_consented)
                .execute(&*self.pool)
                .await
                .map_err(StorageError::from)?
                .rows_affected();
        if rows_affected == 0 {
            return Err(AuthError::token_not_found(token_id));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStoreDomainMigration for PostgresTokenStore {
    #[instrument(skip(self))]
    async fn update_user_store_domain(
        &self,
        tenant_id: i32,
        old_domain: &str,
        new_domain: &str,
    ) -> AuthResult<u64> {
        let old_domain = normalize_domain(old_domain);
        let new_domain = normalize_domain(new_domain);
        if old_domain == new_domain {
            return Ok(0);
        }

        let (relabelled, superseded) = self
            .with_retries("update_user_store_domain", || {
                self.try_rename_user_store(tenant_id, &old_domain, &new_domain)
            })
            .await?;

        info!(relabelled, superseded, "User store domain renamed");
        Ok(relabelled)
    }
}
