//! Canonical lookup keys.
//!
//! Two tokens belong to the same logical key when they share consumer key,
//! normalized user, canonical scope, binding reference and tenant. At most
//! one `ACTIVE` row may exist per key.

use std::collections::{BTreeSet, HashMap};

use crate::config::UserConfig;
use crate::token::hash::HashAlgorithm;
use crate::types::{AccessTokenRecord, AuthenticatedUser};

/// Binding sentinel for unbound tokens.
pub const NO_BINDING: &str = "NONE";

/// Domain used when the user-store domain is blank.
pub const PRIMARY_DOMAIN: &str = "PRIMARY";

/// Scope granting OpenID Connect identity claims.
pub const OPENID_SCOPE: &str = "openid";

/// Sorts, deduplicates and joins scopes with a single space.
#[must_use]
pub fn canonical_scope<I, S>(scopes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = scopes
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    set.into_iter().collect::<Vec<_>>().join(" ")
}

/// Splits a space separated scope string into a set.
#[must_use]
pub fn parse_scope(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// SHA-256 hex digest of a canonical scope, used as the index column.
#[must_use]
pub fn scope_hash(canonical: &str) -> String {
    HashAlgorithm::Sha256.digest(canonical)
}

/// Uppercases the domain; blank becomes `PRIMARY`.
#[must_use]
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim();
    if domain.is_empty() {
        PRIMARY_DOMAIN.to_string()
    } else {
        domain.to_uppercase()
    }
}

/// Missing or blank binding becomes `NONE`.
#[must_use]
pub fn normalize_binding(binding: Option<&str>) -> String {
    match binding.map(str::trim) {
        Some(b) if !b.is_empty() => b.to_string(),
        _ => NO_BINDING.to_string(),
    }
}

/// Picks the explicit domain argument when present, else the user's own.
#[must_use]
pub fn effective_domain(user: &AuthenticatedUser, user_store_domain: Option<&str>) -> String {
    match user_store_domain.map(str::trim) {
        Some(d) if !d.is_empty() => normalize_domain(d),
        _ => normalize_domain(&user.user_store_domain),
    }
}

// =============================================================================
// Username Policy
// =============================================================================

/// Username case sensitivity, per tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernamePolicy {
    case_sensitive: bool,
    overrides: HashMap<i32, bool>,
}

impl Default for UsernamePolicy {
    fn default() -> Self {
        Self::new(true)
    }
}

impl UsernamePolicy {
    #[must_use]
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            overrides: HashMap::new(),
        }
    }

    /// Overrides the default for one tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: i32, case_sensitive: bool) -> Self {
        self.overrides.insert(tenant_id, case_sensitive);
        self
    }

    #[must_use]
    pub fn from_config(config: &UserConfig) -> Self {
        let mut policy = Self::new(config.case_sensitive_username);
        for tenant in &config.case_insensitive_tenants {
            policy.overrides.insert(*tenant, false);
        }
        for tenant in &config.case_sensitive_tenants {
            policy.overrides.insert(*tenant, true);
        }
        policy
    }

    #[must_use]
    pub fn is_case_sensitive(&self, tenant_id: i32) -> bool {
        self.overrides
            .get(&tenant_id)
            .copied()
            .unwrap_or(self.case_sensitive)
    }

    #[must_use]
    pub fn normalize(&self, username: &str, tenant_id: i32) -> String {
        if self.is_case_sensitive(tenant_id) {
            username.to_string()
        } else {
            username.to_lowercase()
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Normalized user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserKey {
    pub username: String,
    pub user_store_domain: String,
    pub tenant_id: i32,
}

impl UserKey {
    #[must_use]
    pub fn new(
        user: &AuthenticatedUser,
        user_store_domain: Option<&str>,
        policy: &UsernamePolicy,
    ) -> Self {
        Self {
            username: policy.normalize(&user.username, user.tenant_id),
            user_store_domain: effective_domain(user, user_store_domain),
            tenant_id: user.tenant_id,
        }
    }
}

/// Logical key of a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenKey {
    pub consumer_key: String,
    pub user: UserKey,
    /// Canonical scope string.
    pub scope: String,
    pub binding_ref: String,
}

impl TokenKey {
    /// Builds a key from query arguments. `scope` may be in any order.
    #[must_use]
    pub fn new(consumer_key: &str, user: UserKey, scope: &str, binding_ref: Option<&str>) -> Self {
        Self {
            consumer_key: consumer_key.to_string(),
            user,
            scope: canonical_scope(scope.split_whitespace()),
            binding_ref: normalize_binding(binding_ref),
        }
    }

    /// Key of a stored or to-be-stored record.
    #[must_use]
    pub fn for_record(
        record: &AccessTokenRecord,
        user_store_domain: Option<&str>,
        policy: &UsernamePolicy,
    ) -> Self {
        Self {
            consumer_key: record.consumer_key.clone(),
            user: UserKey::new(&record.authenticated_user, user_store_domain, policy),
            scope: record.scope_string(),
            binding_ref: normalize_binding(Some(&record.token_binding_reference)),
        }
    }

    /// Same key with the binding ignored, as used by legacy lookups.
    #[must_use]
    pub fn matches_ignoring_binding(&self, other: &TokenKey) -> bool {
        self.consumer_key == other.consumer_key
            && self.user == other.user
            && self.scope == other.scope
    }

    #[must_use]
    pub fn scope_hash(&self) -> String {
        scope_hash(&self.scope)
    }
}
