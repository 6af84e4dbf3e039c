//! One-way hashing and masking of token values.
//!
//! When hashing is enabled the store never keeps a plaintext bearer token:
//! the value is digested before it reaches a transaction and lookups are
//! done by digest. The policy is a process-wide value chosen at
//! initialization ([`TokenHasher`]) and owned by each store.
//!
//! Hashing is CPU bound and pure; callers run it before opening any
//! transaction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::config::{ConfigError, TokenPersistenceConfig};
use crate::types::TokenValue;

/// Digest algorithm for at-rest token hashing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of a lowercase hex digest produced by this algorithm.
    #[must_use]
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    /// Lowercase hex digest of `input`.
    #[must_use]
    pub fn digest(&self, input: &str) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
            Self::Sha384 => hex::encode(Sha384::digest(input.as_bytes())),
            Self::Sha512 => hex::encode(Sha512::digest(input.as_bytes())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(ConfigError::InvalidValue(format!(
                "Unsupported token hash algorithm: '{}'. Must be sha256, sha384 or sha512",
                other
            ))),
        }
    }
}

/// How a caller-supplied token string should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenForm {
    /// Plaintext; hashed when hashing is enabled.
    Plain,
    /// Already in stored form (e.g. read back from the store).
    Hashed,
    /// Pass through if it looks like a digest of the configured algorithm,
    /// otherwise hash.
    Detect,
}

impl TokenForm {
    /// Maps the `is_hashed` flag of the revoke API.
    #[must_use]
    pub fn from_is_hashed(is_hashed: bool) -> Self {
        if is_hashed { Self::Hashed } else { Self::Plain }
    }
}

/// At-rest hashing policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenHasher {
    enabled: bool,
    algorithm: HashAlgorithm,
}

impl TokenHasher {
    /// Tokens are stored in plaintext.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            algorithm: HashAlgorithm::Sha256,
        }
    }

    /// Tokens are stored as digests of `algorithm`.
    #[must_use]
    pub const fn enabled(algorithm: HashAlgorithm) -> Self {
        Self {
            enabled: true,
            algorithm,
        }
    }

    /// Builds the policy from `oauth.token`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unknown algorithm name.
    pub fn from_config(config: &TokenPersistenceConfig) -> Result<Self, ConfigError> {
        let algorithm: HashAlgorithm = config.hash_algorithm.parse()?;
        Ok(if config.hashing_enabled {
            Self::enabled(algorithm)
        } else {
            Self {
                enabled: false,
                algorithm,
            }
        })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Digest of a plaintext value, regardless of whether hashing is enabled.
    #[must_use]
    pub fn hash(&self, plain: &str) -> String {
        self.algorithm.digest(plain)
    }

    /// Converts a value to its at-rest form.
    #[must_use]
    pub fn protect(&self, value: TokenValue) -> TokenValue {
        match value {
            TokenValue::Plain { value } if self.enabled => TokenValue::Hashed {
                digest: self.hash(&value),
                algorithm: self.algorithm,
            },
            other => other,
        }
    }

    /// Recognizes a digest of the configured algorithm by length and alphabet.
    #[must_use]
    pub fn looks_hashed(&self, candidate: &str) -> bool {
        candidate.len() == self.algorithm.hex_len()
            && candidate
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Normalizes caller input to the string held in the token column.
    #[must_use]
    pub fn normalize(&self, input: &str, form: TokenForm) -> String {
        if !self.enabled {
            return input.to_string();
        }
        match form {
            TokenForm::Hashed => input.to_string(),
            TokenForm::Plain => self.hash(input),
            TokenForm::Detect if self.looks_hashed(input) => input.to_string(),
            TokenForm::Detect => self.hash(input),
        }
    }
}

/// Log-safe rendering of a token value.
///
/// Keeps the first four characters of values long enough to stay
/// unguessable; shorter values are fully masked.
#[must_use]
pub fn mask_token(token: &str) -> String {
    const VISIBLE: usize = 4;
    if token.chars().count() <= 2 * VISIBLE {
        return "****".to_string();
    }
    let prefix: String = token.chars().take(VISIBLE).collect();
    format!("{prefix}****")
}
