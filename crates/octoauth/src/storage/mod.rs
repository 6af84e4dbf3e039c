//! Storage traits for access tokens.
//!
//! This module defines the persistence contract for:
//!
//! - Access tokens and their lifecycle
//! - The session to token binding index
//! - User-store domain renames
//! - Optional facets (OpenID-scope views, consent flag)
//!
//! # Implementations
//!
//! Storage implementations are provided in separate crates:
//!
//! - `octoauth-memory` - in-process storage engine
//! - `octoauth-postgres` - PostgreSQL storage engine

pub mod access_token;
pub mod binding;
pub mod capability;
pub mod migration;
pub mod settings;

pub use access_token::{
    AccessTokenStorage, QueryOptions, RevocationFailure, RevocationMode, RevocationReport,
    RevokeOptions, RotateRequest,
};
pub use binding::BindingIndexStorage;
pub use capability::{ConsentFlagStorage, OpenIdScopeViews, StorageCapabilities};
pub use migration::UserStoreDomainMigration;
pub use settings::{PreparedRecord, StoreSettings};
