//! Authenticated user identity attached to a token.

use serde::{Deserialize, Serialize};

/// The user a token was issued to.
///
/// Identity is the triple (username, user-store domain, tenant id). The
/// federation flag marks users authenticated by an external identity
/// provider rather than a local user store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    /// Username as presented by the authenticator.
    pub username: String,

    /// User-store domain that authenticated the user.
    pub user_store_domain: String,

    /// Tenant the user belongs to.
    pub tenant_id: i32,

    /// Whether the user came from a federated identity provider.
    #[serde(default)]
    pub federated: bool,
}

impl AuthenticatedUser {
    /// Creates a local (non-federated) user.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        user_store_domain: impl Into<String>,
        tenant_id: i32,
    ) -> Self {
        Self {
            username: username.into(),
            user_store_domain: user_store_domain.into(),
            tenant_id,
            federated: false,
        }
    }

    /// Marks the user as federated.
    #[must_use]
    pub fn federated(mut self) -> Self {
        self.federated = true;
        self
    }

    /// `DOMAIN/username` form used in audit logs.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.user_store_domain, self.username)
    }
}
