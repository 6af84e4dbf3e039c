use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use octoauth::AuthResult;
use octoauth::storage::{
    AccessTokenStorage, BindingIndexStorage, ConsentFlagStorage, OpenIdScopeViews, PreparedRecord,
    QueryOptions, RevocationMode, RevocationReport, RevokeOptions, RotateRequest, StoreSettings,
    UserStoreDomainMigration,
};
use octoauth::token::{TokenForm, normalize_binding, normalize_domain};
use octoauth::types::{AccessTokenRecord, AuthenticatedUser, TokenState};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::table::{KeyMatch, TokenTable};

/// In-memory access token store.
///
/// This storage implementation provides:
/// - The full access token contract, including every optional facet
/// - Atomic multi-row operations: one lock guards the table and all of its
///   indexes, and no critical section contains an await point
/// - Deterministic ordering of every listing
///
/// Cloning is cheap and clones share the same table.
#[derive(Debug, Clone)]
pub struct MemoryTokenStore {
    table: Arc<RwLock<TokenTable>>,
    settings: StoreSettings,
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

impl MemoryTokenStore {
    /// Creates an empty store with the given write-path policy.
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            table: Arc::new(RwLock::new(TokenTable::default())),
            settings,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Number of rows, whatever their state.
    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn prepare_active(
        &self,
        record: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<PreparedRecord> {
        let mut prepared = self.settings.prepare(record, user_store_domain)?;
        prepared.record.token_state = TokenState::Active;
        Ok(prepared)
    }
}

#[async_trait]
impl AccessTokenStorage for MemoryTokenStore {
    #[instrument(skip(self, record), fields(token_id = %record.token_id))]
    async fn insert(
        &self,
        record: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<()> {
        let prepared = self.settings.prepare(record, user_store_domain)?;
        let superseded = self.table.write().await.insert(prepared)?;
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
            .table
            .write()
            .await
            .insert_conditional(prepared, &existing.token_id)?;
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
        let mode = if options.binding_ref.is_some() {
            KeyMatch::Exact
        } else {
            KeyMatch::IgnoreBinding
        };
        Ok(self.table.read().await.find_by_key(&key, mode, options))
    }

    #[instrument(skip(self, user))]
    async fn get_all_for_client_user(
        &self,
        consumer_key: &str,
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        include_expired: bool,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let key = self
            .settings
            .query_key(consumer_key, user, user_store_domain, "", None);
        let options = QueryOptions::new().include_expired(include_expired);
        Ok(self
            .table
            .read()
            .await
            .find_by_key(&key, KeyMatch::ClientUser, &options))
    }

    #[instrument(skip(self))]
    async fn get_active_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .table
            .read()
            .await
            .active_by_consumer_key(consumer_key, now))
    }

    #[instrument(skip(self, user), fields(user = %user.qualified_name()))]
    async fn get_by_user(&self, user: &AuthenticatedUser) -> AuthResult<Vec<String>> {
        let user_key = self.settings.user_key(user, None);
        let records = self.table.read().await.active_by_user(&user_key);
        Ok(records
            .into_iter()
            .map(|r| r.access_token.stored().to_string())
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_by_tenant(&self, tenant_id: i32) -> AuthResult<Vec<AccessTokenRecord>> {
        Ok(self.table.read().await.active_by_tenant(tenant_id))
    }

    #[instrument(skip(self))]
    async fn get_by_user_store(
        &self,
        tenant_id: i32,
        user_store_domain: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let domain = normalize_domain(user_store_domain);
        Ok(self
            .table
            .read()
            .await
            .active_by_user_store(tenant_id, &domain))
    }

    #[instrument(skip(self))]
    async fn get_by_token_id(&self, token_id: &str) -> AuthResult<Option<AccessTokenRecord>> {
        Ok(self.table.read().await.get(token_id).cloned())
    }

    #[instrument(skip(self, access_token))]
    async fn get_token_id_by_access_token(
        &self,
        access_token: &str,
    ) -> AuthResult<Option<String>> {
        let stored = self.settings.lookup_value(access_token, TokenForm::Detect);
        Ok(self
            .table
            .read()
            .await
            .find_by_value(&stored)
            .map(|r| r.token_id.clone()))
    }

    #[instrument(skip(self, access_token))]
    async fn get_by_access_token(
        &self,
        access_token: &str,
        include_expired: bool,
    ) -> AuthResult<Option<AccessTokenRecord>> {
        let stored = self.settings.lookup_value(access_token, TokenForm::Detect);
        Ok(self
            .table
            .read()
            .await
            .find_by_value(&stored)
            .filter(|r| include_expired || r.token_state == TokenState::Active)
            .cloned())
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

        let mut report = RevocationReport::default();
        match self.settings.revocation_mode(options) {
            RevocationMode::Batch => {
                let mut table = self.table.write().await;
                for value in &values {
                    match table.revoke_value(value) {
                        Some(token_id) => report.revoked.push(token_id),
                        None => report.skipped += 1,
                    }
                }
            }
            RevocationMode::Individual => {
                for value in &values {
                    match self.table.write().await.revoke_value(value) {
                        Some(token_id) => report.revoked.push(token_id),
                        None => report.skipped += 1,
                    }
                }
            }
        }

        info!(
            revoked = report.revoked.len(),
            skipped = report.skipped,
            "Revoked access tokens"
        );
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn revoke_by_id(&self, token_id: &str, acting_user_id: &str) -> AuthResult<()> {
        let revoked = self
            .table
            .write()
            .await
            .revoke_by_id(token_id, acting_user_id)?;
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
        let mut new_record = request.new_record;
        if let Some(grant_type) = request.grant_type {
            new_record.grant_type = grant_type;
        }
        let prepared = self.prepare_active(&new_record, request.user_store_domain.as_deref())?;
        self.table.write().await.rotate(
            &request.old_token_id,
            request.old_token_state,
            &request.consumer_key,
            request.old_token_state_id,
            prepared,
        )
    }

    #[instrument(skip(self))]
    async fn update_state(
        &self,
        token_id: &str,
        new_state: TokenState,
        grant_type: Option<&str>,
    ) -> AuthResult<()> {
        let changed = self
            .table
            .write()
            .await
            .update_state(token_id, new_state, grant_type)?;
        if changed {
            debug!("Access token state updated");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_inactive(&self) -> AuthResult<u64> {
        let purged = self.table.write().await.purge_inactive();
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
impl BindingIndexStorage for MemoryTokenStore {
    #[instrument(skip(self))]
    async fn get_token_ids_by_session(&self, session_id: &str) -> AuthResult<BTreeSet<String>> {
        Ok(self.table.read().await.token_ids_by_session(session_id))
    }

    #[instrument(skip(self))]
    async fn store_session_mapping(
        &self,
        session_id: &str,
        token_id: &str,
        tenant_id: i32,
    ) -> AuthResult<()> {
        let stored = self
            .table
            .write()
            .await
            .store_session_mapping(session_id, token_id, tenant_id)?;
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
        Ok(self
            .table
            .read()
            .await
            .active_by_binding(&binding, user_key.as_ref()))
    }
}

#[async_trait]
impl OpenIdScopeViews for MemoryTokenStore {
    #[instrument(skip(self, user))]
    async fn get_openid_tokens_by_user(
        &self,
        user: &AuthenticatedUser,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        let user_key = self.settings.user_key(user, None);
        Ok(self.table.read().await.active_openid_by_user(&user_key))
    }

    #[instrument(skip(self))]
    async fn get_openid_tokens_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>> {
        Ok(self
            .table
            .read()
            .await
            .active_openid_by_consumer_key(consumer_key))
    }
}

#[async_trait]
impl ConsentFlagStorage for MemoryTokenStore {
    #[instrument(skip(self))]
    async fn update_consent_flag(&self, token_id: &str, is_consented: bool) -> AuthResult<()> {
        self.table
            .write()
            .await
            .update_consent(token_id, is_consented)
    }
}

#[async_trait]
impl UserStoreDomainMigration for MemoryTokenStore {
    #[instrument(skip(self))]
    async fn update_user_store_domain(
        &self,
        tenant_id: i32,
        old_domain: &str,
        new_domain: &str,
    ) -> AuthResult<u64> {
        let old_domain = normalize_domain(old_domain);
        let new_domain = normalize_domain(new_domain);

        let outcome = self.table.write().await.rename_user_store(
            tenant_id,
            &old_domain,
            &new_domain,
            |key| {
                let mut key = key.clone();
                key.user.user_store_domain = new_domain.clone();
                key
            },
        );

        info!(
            relabelled = outcome.relabelled,
            superseded = outcome.superseded,
            "User store domain renamed"
        );
        Ok(outcome.relabelled)
    }
}
