//! # octoauth
//!
//! OAuth 2.0 access token persistence for the OctoAuth identity platform.
//!
//! This crate provides:
//! - The access token storage contract and its invariants
//! - Canonical keying of tokens by client, user, scope, binding and tenant
//! - At-rest hashing and log masking of token values
//! - Dynamic Client Registration input validation
//! - A categorized error type shared by all of the above
//!
//! ## Overview
//!
//! The store is a passive backing service: the OAuth runtime issues tokens
//! and hands them to an [`AccessTokenStorage`] implementation for
//! persistence, lookup, rotation and revocation. Storage engines live in
//! separate crates (`octoauth-memory`, `octoauth-postgres`).
//!
//! ## Modules
//!
//! - [`config`] - Token persistence and client registration configuration
//! - [`dcr`] - Client registration input validation
//! - [`error`] - Categorized error type
//! - [`storage`] - Storage traits and the shared write-path policy
//! - [`token`] - Keying, hashing and masking
//! - [`types`] - Token record model

pub mod config;
pub mod dcr;
pub mod error;
pub mod storage;
pub mod token;
pub mod types;

pub use config::{AuthConfig, ConfigError};
pub use dcr::DcrValidator;
pub use error::{AuthError, BoxError, ErrorCode, ErrorKind};
pub use storage::{
    AccessTokenStorage, BindingIndexStorage, ConsentFlagStorage, OpenIdScopeViews, QueryOptions,
    RevocationMode, RevocationReport, RevokeOptions, RotateRequest, StorageCapabilities,
    StoreSettings, UserStoreDomainMigration,
};
pub use token::{HashAlgorithm, TokenForm, TokenHasher, TokenKey, UsernamePolicy, mask_token};
pub use types::{
    AccessTokenRecord, AuthenticatedUser, SessionTokenMapping, TokenState, TokenValue,
};

/// Type alias for token store results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octoauth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::config::{AuthConfig, ConfigError};
    pub use crate::dcr::DcrValidator;
    pub use crate::error::{AuthError, ErrorCode, ErrorKind};
    pub use crate::storage::{
        AccessTokenStorage, BindingIndexStorage, ConsentFlagStorage, OpenIdScopeViews,
        QueryOptions, RevocationMode, RevocationReport, RevokeOptions, RotateRequest,
        StorageCapabilities, StoreSettings, UserStoreDomainMigration,
    };
    pub use crate::token::{HashAlgorithm, TokenHasher, UsernamePolicy};
    pub use crate::types::{AccessTokenRecord, AuthenticatedUser, TokenState, TokenValue};
}
