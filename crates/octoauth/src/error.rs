//! Categorized error type shared by the token store and the DCR validator.
//!
//! Every failure that crosses a crate boundary is an [`AuthError`]: a
//! [`ErrorKind`] (client or server), a stable [`ErrorCode`], a human readable
//! message rendered from the code's template, and an optional wrapped cause.
//!
//! Driver-specific errors never appear in a public signature. Storage
//! backends box them into the `source` of a server error.

use std::error::Error as StdError;
use std::fmt;

/// Boxed error used as the optional cause of an [`AuthError`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Whether a failure is the caller's fault or ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request or reference to an absent entity. Not retryable
    /// without modifying the request.
    Client,
    /// Transient or internal failure. Callers may retry.
    Server,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Stable error identifiers.
///
/// Each code owns a message template with at most one `{}` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Token store, client side
    TokenNotFound,
    InvalidAccessToken,
    DuplicateToken,
    InvalidStateTransition,
    InvalidRequest,

    // Client registration, client side
    InvalidRedirectUri,
    InvalidBackchannelLogoutUri,
    InvalidApplicationName,
    ConflictExistingApplication,
    ApplicationNotFound,

    // Server side
    StorageFailure,
    SerializationConflict,
    FailedToRegisterApplication,
    Internal,
}

impl ErrorCode {
    /// Stable identifier, suitable for logs and API payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::InvalidAccessToken => "INVALID_ACCESS_TOKEN",
            Self::DuplicateToken => "DUPLICATE_TOKEN",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidRedirectUri => "BAD_REQUEST_INVALID_REDIRECT_URI",
            Self::InvalidBackchannelLogoutUri => "BAD_REQUEST_INVALID_BACKCHANNEL_LOGOUT_URI",
            Self::InvalidApplicationName => "BAD_REQUEST_INVALID_SP_NAME",
            Self::ConflictExistingApplication => "CONFLICT_EXISTING_APPLICATION",
            Self::ApplicationNotFound => "NOT_FOUND_APPLICATION_WITH_ID",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::SerializationConflict => "SERIALIZATION_CONFLICT",
            Self::FailedToRegisterApplication => "FAILED_TO_REGISTER_SP",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Message template. `{}` is replaced by the substitution data.
    #[must_use]
    pub fn template(&self) -> &'static str {
        match self {
            Self::TokenNotFound => "Access token not found: {}",
            Self::InvalidAccessToken => "Invalid access token: {}",
            Self::DuplicateToken => "Access token already exists: {}",
            Self::InvalidStateTransition => "Illegal token state transition: {}",
            Self::InvalidRequest => "Invalid token request: {}",
            Self::InvalidRedirectUri => "Invalid redirect URI: {}",
            Self::InvalidBackchannelLogoutUri => "Invalid back-channel logout URI: {}",
            Self::InvalidApplicationName => "Client name is not adhering to the regex: {}",
            Self::ConflictExistingApplication => {
                "Application with the name {} already exists in the system"
            }
            Self::ApplicationNotFound => "Application not available for given client key: {}",
            Self::StorageFailure => "Token storage operation failed: {}",
            Self::SerializationConflict => "Concurrent update conflict: {}",
            Self::FailedToRegisterApplication => "Error occurred while registering application: {}",
            Self::Internal => "Internal error: {}",
        }
    }

    /// The category this code is normally raised with.
    #[must_use]
    pub fn default_kind(&self) -> ErrorKind {
        match self {
            Self::StorageFailure
            | Self::SerializationConflict
            | Self::FailedToRegisterApplication
            | Self::Internal => ErrorKind::Server,
            _ => ErrorKind::Client,
        }
    }

    /// Renders the template.
    ///
    /// Blank data drops the substitution slot together with the separator
    /// that introduces it, so `"Invalid redirect URI: {}"` becomes
    /// `"Invalid redirect URI"`.
    #[must_use]
    pub fn render(&self, data: Option<&str>) -> String {
        let template = self.template();
        match data.map(str::trim).filter(|d| !d.is_empty()) {
            Some(data) => template.replacen("{}", data, 1),
            None => template
                .replacen(": {}", "", 1)
                .replacen(" {} ", " ", 1)
                .replacen("{}", "", 1),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error value surfaced to upstream layers.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AuthError {
    kind: ErrorKind,
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl AuthError {
    /// Creates an error of an explicit kind.
    #[must_use]
    pub fn new(kind: ErrorKind, code: ErrorCode, data: Option<&str>) -> Self {
        Self {
            kind,
            code,
            message: code.render(data),
            source: None,
        }
    }

    /// Creates a client error.
    #[must_use]
    pub fn client(code: ErrorCode, data: Option<&str>) -> Self {
        Self::new(ErrorKind::Client, code, data)
    }

    /// Creates a server error.
    #[must_use]
    pub fn server(code: ErrorCode, data: Option<&str>) -> Self {
        Self::new(ErrorKind::Server, code, data)
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attaches an optional cause.
    #[must_use]
    pub fn with_optional_source(mut self, source: Option<BoxError>) -> Self {
        self.source = source;
        self
    }

    // -------------------------------------------------------------------------
    // Shorthands used by storage backends
    // -------------------------------------------------------------------------

    /// Unknown `token_id` or token value.
    #[must_use]
    pub fn token_not_found(what: &str) -> Self {
        Self::client(ErrorCode::TokenNotFound, Some(what))
    }

    /// Record or argument failed validation.
    #[must_use]
    pub fn invalid_request(message: impl AsRef<str>) -> Self {
        Self::client(ErrorCode::InvalidRequest, Some(message.as_ref()))
    }

    /// Uniqueness of `token_id` or token value would be violated.
    #[must_use]
    pub fn duplicate_token(what: &str) -> Self {
        Self::client(ErrorCode::DuplicateToken, Some(what))
    }

    /// Requested lifecycle transition is not allowed.
    #[must_use]
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::client(
            ErrorCode::InvalidStateTransition,
            Some(&format!("{from} -> {to}")),
        )
    }

    /// Backing store failure, wrapping the driver error.
    #[must_use]
    pub fn storage(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::server(ErrorCode::StorageFailure, Some(&source.to_string())).with_source(source)
    }

    /// Concurrent writers collided and retries were exhausted.
    #[must_use]
    pub fn serialization_conflict(message: impl AsRef<str>) -> Self {
        Self::server(ErrorCode::SerializationConflict, Some(message.as_ref()))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.kind == ErrorKind::Client
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.kind == ErrorKind::Server
    }

    /// Server errors may be retried unchanged; client errors may not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_server_error()
    }

    /// Returns `true` for an unknown token id or value.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::TokenNotFound
    }

    /// Returns the OAuth 2.0 / RFC 7591 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self.code {
            ErrorCode::TokenNotFound | ErrorCode::InvalidAccessToken => "invalid_token",
            ErrorCode::InvalidStateTransition => "invalid_grant",
            ErrorCode::DuplicateToken | ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidRedirectUri => "invalid_redirect_uri",
            ErrorCode::InvalidBackchannelLogoutUri
            | ErrorCode::InvalidApplicationName
            | ErrorCode::ConflictExistingApplication => "invalid_client_metadata",
            ErrorCode::ApplicationNotFound => "invalid_client",
            ErrorCode::StorageFailure
            | ErrorCode::SerializationConflict
            | ErrorCode::FailedToRegisterApplication
            | ErrorCode::Internal => "server_error",
        }
    }
}
