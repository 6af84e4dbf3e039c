//! Access token record model.
//!
//! An [`AccessTokenRecord`] is one row of the token store. Rows are never
//! updated in place except for their lifecycle state, the consent flag and
//! the user-store domain label. A token that leaves `ACTIVE` keeps its row
//! for audit and refresh resolution, distinguished by `token_state_id`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::token::hash::HashAlgorithm;
use crate::token::key::{NO_BINDING, canonical_scope};
use crate::types::user::AuthenticatedUser;

/// `token_state_id` carried by every `ACTIVE` row.
pub const ACTIVE_STATE_ID: &str = "NONE";

/// Default access token lifetime applied by [`AccessTokenRecord::new`].
pub const DEFAULT_VALIDITY_PERIOD_MS: i64 = 3_600_000;

// =============================================================================
// Token State
// =============================================================================

/// Lifecycle label of a stored token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Active,
    Expired,
    Revoked,
    Inactive,
}

impl TokenState {
    /// Database / wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
            Self::Inactive => "INACTIVE",
        }
    }

    /// Legal transitions: `ACTIVE -> {EXPIRED, REVOKED, INACTIVE}` and
    /// `EXPIRED -> INACTIVE`.
    #[must_use]
    pub fn can_transition_to(&self, next: TokenState) -> bool {
        matches!(
            (*self, next),
            (
                Self::Active,
                Self::Expired | Self::Revoked | Self::Inactive
            ) | (Self::Expired, Self::Inactive)
        )
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown token state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown token state: {0}")]
pub struct UnknownTokenState(pub String);

impl FromStr for TokenState {
    type Err = UnknownTokenState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            "REVOKED" => Ok(Self::Revoked),
            "INACTIVE" => Ok(Self::Inactive),
            _ => Err(UnknownTokenState(s.to_string())),
        }
    }
}

// =============================================================================
// Token Value
// =============================================================================

/// A credential as it is held at rest.
///
/// Callers build records with [`TokenValue::Plain`]; the store converts to
/// [`TokenValue::Hashed`] when hashing is enabled. A row never holds both.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "camelCase")]
pub enum TokenValue {
    Plain {
        value: String,
    },
    Hashed {
        digest: String,
        algorithm: HashAlgorithm,
    },
}

impl TokenValue {
    /// Wraps a plaintext credential.
    #[must_use]
    pub fn plain(value: impl Into<String>) -> Self {
        Self::Plain {
            value: value.into(),
        }
    }

    /// The string stored in the token column: plaintext or hex digest.
    #[must_use]
    pub fn stored(&self) -> &str {
        match self {
            Self::Plain { value } => value,
            Self::Hashed { digest, .. } => digest,
        }
    }

    #[must_use]
    pub fn is_hashed(&self) -> bool {
        matches!(self, Self::Hashed { .. })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stored().is_empty()
    }
}

// Plaintext credentials must never reach a log line through `{:?}`.
impl fmt::Debug for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { value } => f
                .debug_struct("Plain")
                .field("value", &crate::token::hash::mask_token(value))
                .finish(),
            Self::Hashed { digest, algorithm } => f
                .debug_struct("Hashed")
                .field("digest", digest)
                .field("algorithm", algorithm)
                .finish(),
        }
    }
}

// =============================================================================
// Access Token Record
// =============================================================================

/// A stored access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenRecord {
    /// Opaque stable identifier, primary key.
    pub token_id: String,

    /// The bearer credential.
    pub access_token: TokenValue,

    /// Companion refresh credential, if one was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<TokenValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_id: Option<String>,

    /// Registered OAuth client the token was issued to.
    pub consumer_key: String,

    pub authenticated_user: AuthenticatedUser,

    /// Granted scopes. The ordered set makes the canonical form a plain join.
    #[serde(default)]
    pub scopes: BTreeSet<String>,

    /// How the token was issued (`authorization_code`, `refresh_token`, ...).
    pub grant_type: String,

    pub token_state: TokenState,

    /// Discriminator for rows sharing a logical key in non-active states.
    pub token_state_id: String,

    #[serde(with = "time::serde::rfc3339")]
    pub issued_time: OffsetDateTime,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub refresh_token_issued_time: Option<OffsetDateTime>,

    /// Negative means the token never expires.
    pub validity_period_ms: i64,

    pub refresh_token_validity_period_ms: i64,

    /// Session, device or key binding. `"NONE"` when unbound.
    pub token_binding_reference: String,

    #[serde(default)]
    pub is_consented_grant: bool,

    /// Who revoked the token through an explicit revocation by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
}

impl AccessTokenRecord {
    /// Creates an `ACTIVE`, unbound record issued now with a fresh id.
    #[must_use]
    pub fn new(
        consumer_key: impl Into<String>,
        user: AuthenticatedUser,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            token_id: Uuid::new_v4().to_string(),
            access_token: TokenValue::plain(access_token),
            refresh_token: None,
            refresh_token_id: None,
            consumer_key: consumer_key.into(),
            authenticated_user: user,
            scopes: BTreeSet::new(),
            grant_type: String::new(),
            token_state: TokenState::Active,
            token_state_id: ACTIVE_STATE_ID.to_string(),
            issued_time: now_millis(),
            refresh_token_issued_time: None,
            validity_period_ms: DEFAULT_VALIDITY_PERIOD_MS,
            refresh_token_validity_period_ms: 0,
            token_binding_reference: NO_BINDING.to_string(),
            is_consented_grant: false,
            revoked_by: None,
        }
    }

    #[must_use]
    pub fn with_token_id(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = token_id.into();
        self
    }

    /// Sets the scopes from any iterator of scope strings.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the scopes from a space separated scope string.
    #[must_use]
    pub fn with_scope_string(mut self, scope: &str) -> Self {
        self.scopes = crate::token::key::parse_scope(scope);
        self
    }

    #[must_use]
    pub fn with_grant_type(mut self, grant_type: impl Into<String>) -> Self {
        self.grant_type = grant_type.into();
        self
    }

    #[must_use]
    pub fn with_binding(mut self, binding_ref: impl Into<String>) -> Self {
        self.token_binding_reference = binding_ref.into();
        self
    }

    #[must_use]
    pub fn with_validity_ms(mut self, validity_period_ms: i64) -> Self {
        self.validity_period_ms = validity_period_ms;
        self
    }

    #[must_use]
    pub fn issued_at(mut self, issued_time: OffsetDateTime) -> Self {
        self.issued_time = issued_time;
        self
    }

    /// Attaches a refresh token issued together with the access token.
    #[must_use]
    pub fn with_refresh_token(
        mut self,
        refresh_token: impl Into<String>,
        validity_period_ms: i64,
    ) -> Self {
        self.refresh_token = Some(TokenValue::plain(refresh_token));
        self.refresh_token_id = Some(Uuid::new_v4().to_string());
        self.refresh_token_issued_time = Some(self.issued_time);
        self.refresh_token_validity_period_ms = validity_period_ms;
        self
    }

    #[must_use]
    pub fn consented(mut self, is_consented_grant: bool) -> Self {
        self.is_consented_grant = is_consented_grant;
        self
    }

    /// Canonical scope string: sorted, deduplicated, single-space joined.
    #[must_use]
    pub fn scope_string(&self) -> String {
        canonical_scope(self.scopes.iter())
    }

    /// `None` when the token never expires: a negative validity period, or
    /// one reaching past the representable range (`i64::MAX` included).
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        if self.validity_period_ms < 0 {
            return None;
        }
        self.issued_time
            .checked_add(Duration::milliseconds(self.validity_period_ms))
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at().is_some_and(|exp| exp <= now)
    }

    /// `ACTIVE` and inside its validity window.
    #[must_use]
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.token_state == TokenState::Active && !self.is_expired_at(now)
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.token_binding_reference != NO_BINDING
    }

    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// Current UTC time truncated to milliseconds, the resolution the stores keep.
#[must_use]
pub fn now_millis() -> OffsetDateTime {
    truncate_to_millis(OffsetDateTime::now_utc())
}

/// Drops sub-millisecond precision.
#[must_use]
pub fn truncate_to_millis(t: OffsetDateTime) -> OffsetDateTime {
    t.replace_nanosecond(u32::from(t.millisecond()) * 1_000_000)
        .unwrap_or(t)
}

// =============================================================================
// Session Mapping
// =============================================================================

/// One edge of the many-to-many session/token relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenMapping {
    pub session_identifier: String,
    pub token_id: String,
    pub tenant_id: i32,
}
