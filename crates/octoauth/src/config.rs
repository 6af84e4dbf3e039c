//! Token persistence and client registration configuration.
//!
//! Configuration is read from TOML. Every section has defaults, so an empty
//! document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dcr::DEFAULT_APP_NAME_REGEX;

/// Root configuration.
///
/// # Example (TOML)
///
/// ```toml
/// [service_providers]
/// sp_name_regex = "^[a-zA-Z0-9._-]*$"
///
/// [oauth.dcrm]
/// application_role_permission_required_to_view = "true"
///
/// [oauth.token]
/// hashing_enabled = true
/// hash_algorithm = "sha256"
///
/// [storage]
/// backend = "postgres"
/// url = "postgres://localhost/octoauth"
/// acquire_timeout = "5s"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Service provider (application) registration settings.
    pub service_providers: ServiceProvidersConfig,

    /// OAuth settings.
    pub oauth: OAuthConfig,

    /// Token store backend.
    pub storage: StorageConfig,
}

/// `service_providers` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceProvidersConfig {
    /// Regex application names must fully match.
    /// Blank or absent falls back to the platform default.
    pub sp_name_regex: Option<String>,
}

impl ServiceProvidersConfig {
    /// The configured regex, or the default one.
    #[must_use]
    pub fn name_regex(&self) -> &str {
        match self.sp_name_regex.as_deref().map(str::trim) {
            Some(regex) if !regex.is_empty() => regex,
            _ => DEFAULT_APP_NAME_REGEX,
        }
    }
}

/// `oauth` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Dynamic client registration management.
    pub dcrm: DcrmConfig,

    /// Token persistence.
    pub token: TokenPersistenceConfig,

    /// Username handling.
    pub user: UserConfig,
}

/// `oauth.dcrm` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DcrmConfig {
    /// Kept as a string: absent and empty both mean `true`.
    pub application_role_permission_required_to_view: Option<String>,
}

/// `oauth.token` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenPersistenceConfig {
    /// Store digests instead of plaintext tokens.
    pub hashing_enabled: bool,

    /// Digest algorithm: sha256, sha384 or sha512.
    pub hash_algorithm: String,

    /// Default revocation mode when the caller does not pick one.
    /// `false` revokes in one batch transaction.
    pub revoke_individually: bool,
}

impl Default for TokenPersistenceConfig {
    fn default() -> Self {
        Self {
            hashing_enabled: false,
            hash_algorithm: "sha256".to_string(),
            revoke_individually: false,
        }
    }
}

/// `oauth.user` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UserConfig {
    /// Default username case sensitivity.
    pub case_sensitive_username: bool,

    /// Tenants whose usernames compare case-insensitively.
    pub case_insensitive_tenants: Vec<i32>,

    /// Tenants whose usernames compare case-sensitively.
    pub case_sensitive_tenants: Vec<i32>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            case_sensitive_username: true,
            case_insensitive_tenants: Vec::new(),
            case_sensitive_tenants: Vec::new(),
        }
    }
}

/// Token store backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

/// `storage` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Connection URL, required for `postgres`.
    pub url: Option<String>,

    /// Connection pool size.
    pub max_connections: u32,

    /// How long an operation waits for a pooled connection.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Retries of a write that lost a uniqueness race.
    pub conflict_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            conflict_retries: 3,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The document is not valid TOML for this schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Failed to read configuration file: {0}")]
    Io(String),
}

impl AuthConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and any error from
    /// [`AuthConfig::validate`].
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`AuthConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&document)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - The application name regex does not compile
    /// - The hash algorithm is unknown
    /// - The pool size is zero
    /// - The postgres URL does not parse or has another scheme
    ///
    /// Returns `ConfigError::Missing` if the postgres backend has no URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let regex = self.service_providers.name_regex();
        if let Err(e) = regex::Regex::new(regex) {
            return Err(ConfigError::InvalidValue(format!(
                "service_providers.sp_name_regex '{}' does not compile: {}",
                regex, e
            )));
        }

        self.oauth
            .token
            .hash_algorithm
            .parse::<crate::token::HashAlgorithm>()?;

        if self.storage.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "storage.max_connections must be > 0".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Postgres {
            let url = self
                .storage
                .url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .ok_or_else(|| ConfigError::Missing("storage.url".to_string()))?;
            let parsed = url::Url::parse(url).map_err(|e| {
                ConfigError::InvalidValue(format!("storage.url is not a valid URL: {e}"))
            })?;
            if !matches!(parsed.scheme(), "postgres" | "postgresql") {
                return Err(ConfigError::InvalidValue(format!(
                    "storage.url scheme '{}' is not postgres",
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = AuthConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.oauth.token.hashing_enabled);
        assert!(config.oauth.user.case_sensitive_username);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.service_providers.name_regex(), DEFAULT_APP_NAME_REGEX);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = AuthConfig::from_toml_str("").unwrap();
        assert_eq!(config.storage.acquire_timeout, Duration::from_secs(5));
        assert!(config.oauth.dcrm.application_role_permission_required_to_view.is_none());
    }

    #[test]
    fn test_full_document() {
        let config = AuthConfig::from_toml_str(
            r#"
[service_providers]
sp_name_regex = "^[a-z]+$"

[oauth.dcrm]
application_role_permission_required_to_view = "false"

[oauth.token]
hashing_enabled = true
hash_algorithm = "sha512"
revoke_individually = true

[oauth.user]
case_sensitive_username = true
case_insensitive_tenants = [7, 8]

[storage]
backend = "postgres"
url = "postgres://localhost/octoauth"
max_connections = 4
acquire_timeout = "250ms"
"#,
        )
        .unwrap();

        assert_eq!(config.service_providers.name_regex(), "^[a-z]+$");
        assert_eq!(
            config
                .oauth
                .dcrm
                .application_role_permission_required_to_view
                .as_deref(),
            Some("false")
        );
        assert!(config.oauth.token.hashing_enabled);
        assert!(config.oauth.token.revoke_individually);
        assert_eq!(config.oauth.user.case_insensitive_tenants, vec![7, 8]);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.storage.max_connections, 4);
        assert_eq!(config.storage.acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_blank_regex_falls_back_to_default() {
        let config = AuthConfig::from_toml_str(
            r#"
[service_providers]
sp_name_regex = "  "
"#,
        )
        .unwrap();
        assert_eq!(config.service_providers.name_regex(), DEFAULT_APP_NAME_REGEX);
    }

    #[test]
    fn test_invalid_regex_fails_validation() {
        let mut config = AuthConfig::default();
        config.service_providers.sp_name_regex = Some("([a-z".to_string());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
        assert!(err.to_string().contains("sp_name_regex"));
    }

    #[test]
    fn test_invalid_algorithm_fails_validation() {
        let mut config = AuthConfig::default();
        config.oauth.token.hash_algorithm = "md5".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidValue(_)
        ));
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut config = AuthConfig::default();
        config.storage.backend = StorageBackend::Postgres;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        config.storage.url = Some("postgres://localhost/db".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_postgres_url_must_be_postgres() {
        let mut config = AuthConfig::default();
        config.storage.backend = StorageBackend::Postgres;

        config.storage.url = Some("not a url".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.storage.url = Some("mysql://localhost/db".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.storage.url = Some("postgresql://user:pw@localhost:5432/db".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_pool_fails_validation() {
        let mut config = AuthConfig::default();
        config.storage.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let err = AuthConfig::from_toml_str("[oauth.token\nhashing_enabled = true").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("octoauth.toml");
        std::fs::write(&path, "[oauth.token]\nhashing_enabled = true\n").unwrap();

        let config = AuthConfig::from_file(&path).unwrap();
        assert!(config.oauth.token.hashing_enabled);

        let missing = AuthConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue("test error".to_string());
        assert_eq!(err.to_string(), "Invalid configuration value: test error");

        let err = ConfigError::Missing("storage.url".to_string());
        assert_eq!(
            err.to_string(),
            "Missing required configuration: storage.url"
        );
    }
}
