//! Session binding index.
//!
//! A secondary index from a session (or other binding reference) to the
//! tokens issued under it, used by session-bound logout. The index never
//! resolves to a token that has left `ACTIVE`.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::AuthResult;
use crate::types::{AccessTokenRecord, AuthenticatedUser};

/// Storage trait for the session to token index.
#[async_trait]
pub trait BindingIndexStorage: Send + Sync {
    /// Ids of the `ACTIVE` tokens mapped to a session.
    ///
    /// An unknown session yields an empty set.
    async fn get_token_ids_by_session(&self, session_id: &str) -> AuthResult<BTreeSet<String>>;

    /// Maps a token to a session. Storing the same mapping twice is a no-op,
    /// as is mapping a token that is no longer `ACTIVE`.
    ///
    /// # Errors
    ///
    /// Returns `TokenNotFound` if the token does not exist.
    async fn store_session_mapping(
        &self,
        session_id: &str,
        token_id: &str,
        tenant_id: i32,
    ) -> AuthResult<()>;

    /// `ACTIVE` tokens carrying a binding reference, optionally restricted
    /// to one user.
    async fn get_by_binding_ref(
        &self,
        binding_ref: &str,
        user: Option<&AuthenticatedUser>,
    ) -> AuthResult<Vec<AccessTokenRecord>>;
}
