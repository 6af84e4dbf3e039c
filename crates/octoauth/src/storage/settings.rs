//! Write-path policy shared by the storage engines.
//!
//! Engines differ in how they persist rows but must agree on validation,
//! normalization, hashing and keying. [`StoreSettings`] does all of that
//! outside any lock or transaction.

use tracing::debug;
use uuid::Uuid;

use crate::AuthResult;
use crate::config::{AuthConfig, ConfigError};
use crate::error::AuthError;
use crate::storage::access_token::{RevocationMode, RevokeOptions};
use crate::token::{
    TokenForm, TokenHasher, TokenKey, UserKey, UsernamePolicy, effective_domain,
    normalize_binding,
};
use crate::types::{
    ACTIVE_STATE_ID, AccessTokenRecord, AuthenticatedUser, TokenState, truncate_to_millis,
};

/// A record ready to be persisted, with its logical key.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub record: AccessTokenRecord,
    pub key: TokenKey,
}

/// Hashing, username and revocation policy of a store.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    hasher: TokenHasher,
    usernames: UsernamePolicy,
    revocation_mode: RevocationMode,
}

impl StoreSettings {
    #[must_use]
    pub fn new(hasher: TokenHasher, usernames: UsernamePolicy) -> Self {
        Self {
            hasher,
            usernames,
            revocation_mode: RevocationMode::Batch,
        }
    }

    #[must_use]
    pub fn with_revocation_mode(mut self, mode: RevocationMode) -> Self {
        self.revocation_mode = mode;
        self
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unknown hash algorithm.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let token = &config.oauth.token;
        let mode = if token.revoke_individually {
            RevocationMode::Individual
        } else {
            RevocationMode::Batch
        };
        Ok(Self::new(
            TokenHasher::from_config(token)?,
            UsernamePolicy::from_config(&config.oauth.user),
        )
        .with_revocation_mode(mode))
    }

    #[must_use]
    pub fn hasher(&self) -> &TokenHasher {
        &self.hasher
    }

    #[must_use]
    pub fn usernames(&self) -> &UsernamePolicy {
        &self.usernames
    }

    /// The mode requested by the caller, else the configured default.
    #[must_use]
    pub fn revocation_mode(&self, options: &RevokeOptions) -> RevocationMode {
        options.mode.unwrap_or(self.revocation_mode)
    }

    /// Normalizes a caller-supplied token value to its stored form.
    #[must_use]
    pub fn lookup_value(&self, token: &str, form: TokenForm) -> String {
        self.hasher.normalize(token, form)
    }

    #[must_use]
    pub fn user_key(&self, user: &AuthenticatedUser, user_store_domain: Option<&str>) -> UserKey {
        UserKey::new(user, user_store_domain, &self.usernames)
    }

    /// Key built from query arguments.
    #[must_use]
    pub fn query_key(
        &self,
        consumer_key: &str,
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        scope: &str,
        binding_ref: Option<&str>,
    ) -> TokenKey {
        TokenKey::new(
            consumer_key,
            self.user_key(user, user_store_domain),
            scope,
            binding_ref,
        )
    }

    /// Key of a row that is already stored.
    #[must_use]
    pub fn record_key(&self, record: &AccessTokenRecord) -> TokenKey {
        TokenKey::for_record(record, None, &self.usernames)
    }

    /// Validates and normalizes a record for writing.
    ///
    /// The user-store domain is resolved and uppercased, the binding
    /// defaults to `NONE`, timestamps drop sub-millisecond precision, token
    /// values are hashed when hashing is enabled and the state id is made
    /// consistent with the state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the token id, consumer key, username or
    /// access token is blank.
    pub fn prepare(
        &self,
        record: &AccessTokenRecord,
        user_store_domain: Option<&str>,
    ) -> AuthResult<PreparedRecord> {
        if record.token_id.trim().is_empty() {
            return Err(AuthError::invalid_request("token_id is required"));
        }
        if record.consumer_key.trim().is_empty() {
            return Err(AuthError::invalid_request("consumer_key is required"));
        }
        if record.authenticated_user.username.trim().is_empty() {
            return Err(AuthError::invalid_request("authenticated user is required"));
        }
        if record.access_token.is_empty() {
            return Err(AuthError::invalid_request("access_token is required"));
        }

        let mut record = record.clone();
        record.authenticated_user.user_store_domain =
            effective_domain(&record.authenticated_user, user_store_domain);
        record.token_binding_reference = normalize_binding(Some(&record.token_binding_reference));
        record.issued_time = truncate_to_millis(record.issued_time);
        record.refresh_token_issued_time = record.refresh_token_issued_time.map(truncate_to_millis);
        record.access_token = self.hasher.protect(record.access_token);
        record.refresh_token = record.refresh_token.map(|rt| self.hasher.protect(rt));

        if record.token_state == TokenState::Active {
            record.token_state_id = ACTIVE_STATE_ID.to_string();
        } else if record.token_state_id.trim().is_empty()
            || record.token_state_id == ACTIVE_STATE_ID
        {
            record.token_state_id = Uuid::new_v4().to_string();
        }

        let key = self.record_key(&record);
        debug!(
            token_id = %record.token_id,
            consumer_key = %record.consumer_key,
            hashed = record.access_token.is_hashed(),
            "Prepared access token for persistence"
        );
        Ok(PreparedRecord { record, key })
    }
}
