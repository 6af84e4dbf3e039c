//! Optional storage facets.
//!
//! Not every engine maintains every view. Callers ask
//! [`AccessTokenStorage::capabilities`](crate::storage::AccessTokenStorage::capabilities)
//! or the matching accessor before relying on one.

use async_trait::async_trait;

use crate::AuthResult;
use crate::types::{AccessTokenRecord, AuthenticatedUser};

/// Facets an engine provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCapabilities {
    pub binding_index: bool,
    pub openid_scope_views: bool,
    pub consent_flag: bool,
}

impl StorageCapabilities {
    /// Every facet.
    #[must_use]
    pub fn all() -> Self {
        Self {
            binding_index: true,
            openid_scope_views: true,
            consent_flag: true,
        }
    }
}

/// Listings of tokens granted the `openid` scope.
#[async_trait]
pub trait OpenIdScopeViews: Send + Sync {
    /// `ACTIVE` tokens of the user carrying the `openid` scope.
    async fn get_openid_tokens_by_user(
        &self,
        user: &AuthenticatedUser,
    ) -> AuthResult<Vec<AccessTokenRecord>>;

    /// `ACTIVE` tokens of a client carrying the `openid` scope.
    async fn get_openid_tokens_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> AuthResult<Vec<AccessTokenRecord>>;
}

/// Consent flag updates.
#[async_trait]
pub trait ConsentFlagStorage: Send + Sync {
    /// Sets `is_consented_grant` and nothing else.
    ///
    /// # Errors
    ///
    /// Returns `TokenNotFound` for an unknown id.
    async fn update_consent_flag(&self, token_id: &str, is_consented: bool) -> AuthResult<()>;
}
