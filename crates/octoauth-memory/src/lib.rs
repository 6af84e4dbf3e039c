//! In-memory access token store for OctoAuth.
//!
//! This crate provides an in-process implementation of the storage traits
//! from `octoauth`: the access token contract, the session binding index,
//! user-store domain renames and every optional facet.
//!
//! # Example
//!
//! ```ignore
//! use octoauth::prelude::*;
//! use octoauth_memory::MemoryTokenStore;
//!
//! let store = MemoryTokenStore::default();
//! let user = AuthenticatedUser::new("alice", "PRIMARY", -1234);
//! let record = AccessTokenRecord::new("client-1", user.clone(), "opaque-token")
//!     .with_scope_string("openid email");
//! store.insert(&record, None).await?;
//!
//! let latest = store
//!     .get_latest("client-1", &user, None, "email openid", &QueryOptions::new())
//!     .await?;
//! ```

pub mod factory;
pub mod storage;
mod table;

pub use factory::create_token_store;
pub use storage::MemoryTokenStore;
