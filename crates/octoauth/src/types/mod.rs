//! Value objects shared by the storage contract and its backends.
//!
//! ## Domain Types
//!
//! - [`AccessTokenRecord`] - One stored access token row
//! - [`TokenState`] - Lifecycle label of a row
//! - [`TokenValue`] - Plaintext or hashed credential
//! - [`AuthenticatedUser`] - Username, user-store domain and tenant
//! - [`SessionTokenMapping`] - Session to token edge

pub mod access_token;
pub mod user;

pub use access_token::{
    ACTIVE_STATE_ID, AccessTokenRecord, DEFAULT_VALIDITY_PERIOD_MS, SessionTokenMapping,
    TokenState, TokenValue, UnknownTokenState, now_millis, truncate_to_millis,
};
pub use user::AuthenticatedUser;
