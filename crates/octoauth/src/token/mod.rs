//! Token identity keying, hashing and masking.
//!
//! This module provides:
//!
//! - Canonical logical keys (consumer key, user, scope, binding, tenant)
//! - Scope, domain, binding and username normalization
//! - At-rest hashing of token values and log masking

pub mod hash;
pub mod key;

pub use hash::{HashAlgorithm, TokenForm, TokenHasher, mask_token};
pub use key::{
    NO_BINDING, OPENID_SCOPE, PRIMARY_DOMAIN, TokenKey, UserKey, UsernamePolicy, canonical_scope,
    effective_domain, normalize_binding, normalize_domain, parse_scope, scope_hash,
};
