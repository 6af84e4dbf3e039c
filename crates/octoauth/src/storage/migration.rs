//! User-store domain rename.

use async_trait::async_trait;

use crate::AuthResult;

/// Relabels tokens when a tenant renames a user-store domain.
#[async_trait]
pub trait UserStoreDomainMigration: Send + Sync {
    /// Moves every row of `tenant_id` from `old_domain` to `new_domain` in
    /// one atomic step, returning the number of rows relabelled.
    ///
    /// Domains are compared after normalization. If a row would collide with
    /// an `ACTIVE` token already filed under `new_domain`, the existing
    /// token wins and the old-domain row is expired.
    ///
    /// A concurrent reader observes either the old labels or the new ones,
    /// never a mix.
    async fn update_user_store_domain(
        &self,
        tenant_id: i32,
        old_domain: &str,
        new_domain: &str,
    ) -> AuthResult<u64>;
}
