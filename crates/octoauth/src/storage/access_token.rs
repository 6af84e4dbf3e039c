//! Access token storage trait.
//!
//! This module defines the persistence contract consumed by the OAuth
//! runtime: insert, conditional replace, lookups, revocation, state updates
//! and rotation of access tokens.
//!
//! # Concurrency
//!
//! - Every implementation is `Send + Sync` and shared behind an `Arc`
//! - Transitions of a single `token_id` are linearizable
//! - [`AccessTokenStorage::insert_conditional`] and
//!   [`AccessTokenStorage::rotate`] are serializable with respect to
//!   [`AccessTokenStorage::get_latest`] for the same logical key
//! - A dropped future leaves either the full effect or none of it

use async_trait::async_trait;

use crate::AuthResult;
use crate::error::AuthError;
use crate::storage::binding::BindingIndexStorage;
use crate::storage::capability::{ConsentFlagStorage, OpenIdScopeViews, StorageCapabilities};
use crate::types::{AccessTokenRecord, AuthenticatedUser, TokenState};

// =============================================================================
// Options
// =============================================================================

/// Filters for the logical-key lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// `None` ignores the binding; `Some` requires equality, `"NONE"`
    /// included.
    pub binding_ref: Option<String>,

    /// `false` returns `ACTIVE` rows only, `true` also `EXPIRED` ones.
    pub include_expired: bool,

    /// Maximum number of rows; `None` is unbounded.
    pub limit: Option<usize>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn binding(mut self, binding_ref: impl Into<String>) -> Self {
        self.binding_ref = Some(binding_ref.into());
        self
    }

    #[must_use]
    pub fn include_expired(mut self, include_expired: bool) -> Self {
        self.include_expired = include_expired;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// States the options admit.
    #[must_use]
    pub fn admits(&self, state: TokenState) -> bool {
        match state {
            TokenState::Active => true,
            TokenState::Expired => self.include_expired,
            TokenState::Revoked | TokenState::Inactive => false,
        }
    }
}

/// How a list of tokens is revoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevocationMode {
    /// One transaction for all tokens; all succeed or none do.
    #[default]
    Batch,
    /// One transaction per token; partial success is reported.
    Individual,
}

/// Options for [`AccessTokenStorage::revoke`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevokeOptions {
    /// `None` uses the store's configured default.
    pub mode: Option<RevocationMode>,

    /// The caller passes values in stored form (e.g. read back from the
    /// store).
    pub is_hashed: bool,
}

impl RevokeOptions {
    #[must_use]
    pub fn batch() -> Self {
        Self {
            mode: Some(RevocationMode::Batch),
            is_hashed: false,
        }
    }

    #[must_use]
    pub fn individual() -> Self {
        Self {
            mode: Some(RevocationMode::Individual),
            is_hashed: false,
        }
    }

    #[must_use]
    pub fn hashed(mut self, is_hashed: bool) -> Self {
        self.is_hashed = is_hashed;
        self
    }
}

/// A token that could not be revoked in individual mode.
#[derive(Debug)]
pub struct RevocationFailure {
    /// Masked token value.
    pub token: String,
    pub error: AuthError,
}

/// Outcome of [`AccessTokenStorage::revoke`].
#[derive(Debug, Default)]
pub struct RevocationReport {
    /// `token_id`s moved to `REVOKED`.
    pub revoked: Vec<String>,

    /// Values that matched no `ACTIVE` row.
    pub skipped: usize,

    /// Per-token failures (individual mode only).
    pub failed: Vec<RevocationFailure>,
}

impl RevocationReport {
    /// `true` when no token failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Arguments of [`AccessTokenStorage::rotate`].
#[derive(Debug, Clone)]
pub struct RotateRequest {
    /// Row leaving `ACTIVE`.
    pub old_token_id: String,

    /// State the old row moves to.
    pub old_token_state: TokenState,

    /// Must match the old row's client.
    pub consumer_key: String,

    /// State id given to the old row; a fresh UUID when `None`.
    pub old_token_state_id: Option<String>,

    /// Row inserted as `ACTIVE`.
    pub new_record: AccessTokenRecord,

    pub user_store_domain: Option<String>,

    /// Overrides the grant type of the new row.
    pub grant_type: Option<String>,
}

impl RotateRequest {
    /// Expires `old_token_id` in favour of `new_record`.
    #[must_use]
    pub fn new(old_token_id: impl Into<String>, new_record: AccessTokenRecord) -> Self {
        Self {
            old_token_id: old_token_id.into(),
            old_token_state: TokenState::Expired,
            consumer_key: new_record.consumer_key.clone(),
            old_token_state_id: None,
            new_record,
            user_store_domain: None,
            grant_type: None,
        }
    }

    #[must_use]
    pub fn old_state(mut self, state: TokenState) -> Self {
        self.old_token_state = state;
        self
    }

    #[must_use]
    pub fn old_state_id(mut self, state_id: impl Into<String>) -> Self {
        self.old_token_state_id = Some(state_id.into());
        self
    }

    #[must_use]
    pub fn user_store_domain(mut self, domain: impl Into<String>) -> Self {
        self.user_store_domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn grant_type(mut self, grant_type: impl Into<String>) -> Self {
        self.grant_type = Some(grant_type.into());
        self
    }
}

// =============================================================================
// Trait
// =============================================================================

/// Storage trait for access tokens.
///
/// Token values passed in are plaintext unless stated otherwise; when
/// hashing is enabled the store digests them before any transaction opens
/// and only the digest is persisted.
///
/// Optional facets are discovered through [`binding_index`],
/// [`openid_views`] and [`consent`] rather than by calling a method that may
/// silently do nothing.
///
/// [`binding_index`]: AccessTokenStorage::binding_index
/// [`openid_views`]: AccessTokenStorage::openid_views
/// [`consent`]: AccessTokenStorage::consent
///
/// # Implementations
///
/// - `octoauth-memory` - in-process engine
/// - `octoauth-postgres` - PostgreSQL engine
#[async_trait]
pub trait AccessTokenStorage: Send + Sync {
    /// Stores a new token.
    ///
    /// Any `ACTIVE` row with the same logical key is moved to `EXPIRED` in
    /// the same transaction, and a binding other than `NONE` is registered
    /// in the binding index.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if the record is malformed
    /// - `DuplicateToken` if the `token_id` or token value is taken
    async fn insert(
        &self,
        record: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<()>;

    /// Replaces `existing` with `new_record` if `existing` is still the
    /// latest `ACTIVE` row for its logical key.
    ///
    /// Returns `false`, with no effect, when another writer got there first.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed records or storage failures, never for
    /// a lost race.
    async fn insert_conditional(
        &self,
        new_record: &AccessTokenRecord,
        existing: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<bool>;

    /// Most recently issued token for the logical key.
    ///
    /// Ties on `issued_time` are broken by `token_id`, both descending.
    async fn get_latest(
        &self,
        consumer_key: &str,
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        scope: &str,
        options: &QueryOptions,
    ) -> AuthResult<Option<AccessTokenRecord>> {
        let options = QueryOptions {
            limit: Some(1),
            ..options.clone()
        };
        let latest = self
            .get_latest_many(consumer_key, user, user_store_domain, scope, &options)
            .await?;
        Ok(latest.into_iter().next())
    }

    /// Same as [`AccessTokenStorage::get_latest`], up to `options.limit`
    /// rows newest first.
    async fn get_latest_many(
        &self,
        consumer_key: &str,
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        scope: &str,
        options: &QueryOptions,
    ) -> AuthResult<Vec<AccessTokenRecord>>;

    /// Every token of the user for one client, any scope or binding.
    async fn get_all_for_client_user(
        &self,
        consumer_key: &str,
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        include_expired: bool,
    ) -> AuthResult<Vec<AccessTokenRecord>>;

    /// `ACTIVE`, unexpired tokens of a client.
    async fn get_active_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>>;

    /// Stored token values of a client's `ACTIVE`, unexpired tokens.
    async fn get_active_access_tokens_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> AuthResult<Vec<String>> {
        let records = self.get_active_by_consumer_key(consumer_key).await?;
        Ok(records
            .into_iter()
            .map(|r| r.access_token.stored().to_string())
            .collect())
    }

    /// Stored token values of the user's `ACTIVE` tokens across clients.
    async fn get_by_user(&self, user: &AuthenticatedUser) -> AuthResult<Vec<String>>;

    /// `ACTIVE` tokens of a tenant.
    async fn get_by_tenant(&self, tenant_id: i32) -> AuthResult<Vec<AccessTokenRecord>>;

    /// `ACTIVE` tokens of one user store of a tenant.
    async fn get_by_user_store(
        &self,
        tenant_id: i32,
        user_store_domain: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>>;

    /// Any token by id, whatever its state.
    async fn get_by_token_id(&self, token_id: &str) -> AuthResult<Option<AccessTokenRecord>>;

    /// Stored token value by id.
    async fn get_access_token_by_token_id(&self, token_id: &str) -> AuthResult<Option<String>> {
        Ok(self
            .get_by_token_id(token_id)
            .await?
            .map(|r| r.access_token.stored().to_string()))
    }

    /// Resolves a token value, plaintext or digest, to its id.
    ///
    /// `INACTIVE` rows are not considered.
    async fn get_token_id_by_access_token(&self, access_token: &str)
    -> AuthResult<Option<String>>;

    /// Full record by token value, normalized like
    /// [`AccessTokenStorage::get_token_id_by_access_token`].
    ///
    /// Without `include_expired` only an `ACTIVE` row is returned; with it
    /// any row that is not `INACTIVE`.
    async fn get_by_access_token(
        &self,
        access_token: &str,
        include_expired: bool,
    ) -> AuthResult<Option<AccessTokenRecord>>;

    /// Moves every `ACTIVE` row holding one of `tokens` to `REVOKED`.
    ///
    /// # Errors
    ///
    /// In batch mode any failure aborts the whole batch. In individual mode
    /// failures are collected in the report instead.
    async fn revoke(
        &self,
        tokens: &[String],
        options: &RevokeOptions,
    ) -> AuthResult<RevocationReport>;

    /// Revokes one token, recording who did it.
    ///
    /// Revoking a token that is no longer `ACTIVE` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `TokenNotFound` for an unknown id.
    async fn revoke_by_id(&self, token_id: &str, acting_user_id: &str) -> AuthResult<()>;

    /// Moves the old row out of `ACTIVE` and inserts the new one atomically.
    ///
    /// # Errors
    ///
    /// - `TokenNotFound` if the old row does not exist
    /// - `InvalidRequest` if the consumer key does not match the old row
    /// - `InvalidStateTransition` if the old row cannot take the new state
    async fn rotate(&self, request: RotateRequest) -> AuthResult<()>;

    /// Writes a new lifecycle state, recording `grant_type` when given.
    ///
    /// Writing the current state again is a no-op.
    ///
    /// # Errors
    ///
    /// - `TokenNotFound` for an unknown id
    /// - `InvalidStateTransition` for an illegal transition
    async fn update_state(
        &self,
        token_id: &str,
        new_state: TokenState,
        grant_type: Option<&str>,
    ) -> AuthResult<()>;

    /// Deletes `INACTIVE` tombstones, returning how many went.
    async fn purge_inactive(&self) -> AuthResult<u64>;

    // -------------------------------------------------------------------------
    // Capabilities
    // -------------------------------------------------------------------------

    /// Session to token index, if maintained.
    fn binding_index(&self) -> Option<&dyn BindingIndexStorage> {
        None
    }

    /// OpenID-scope listings, if supported.
    fn openid_views(&self) -> Option<&dyn OpenIdScopeViews> {
        None
    }

    /// Consent flag updates, if supported.
    fn consent(&self) -> Option<&dyn ConsentFlagStorage> {
        None
    }

    /// Summary of the facets above.
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            binding_index: self.binding_index().is_some(),
            openid_scope_views: self.openid_views().is_some(),
            consent_flag: self.consent().is_some(),
        }
    }
}
