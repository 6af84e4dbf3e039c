use std::sync::Arc;

use octoauth::config::{AuthConfig, ConfigError, StorageBackend};
use octoauth::storage::StoreSettings;
use tracing::info;

use crate::MemoryTokenStore;

/// Create a store from configuration.
///
/// Only the `memory` backend is served by this crate; PostgreSQL lives in
/// `octoauth-postgres`.
///
/// # Errors
///
/// Returns a `ConfigError` if the configuration is invalid or names
/// another backend.
pub fn create_token_store(config: &AuthConfig) -> Result<Arc<MemoryTokenStore>, ConfigError> {
    config.validate()?;
    match config.storage.backend {
        StorageBackend::Memory => {
            let settings = StoreSettings::from_config(config)?;
            info!(
                hashing = settings.hasher().is_enabled(),
                algorithm = %settings.hasher().algorithm(),
                "Created in-memory token store"
            );
            Ok(Arc::new(MemoryTokenStore::new(settings)))
        }
        StorageBackend::Postgres => Err(ConfigError::InvalidValue(
            "storage.backend 'postgres' is served by octoauth-postgres".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octoauth::storage::AccessTokenStorage;
    use octoauth::types::{AccessTokenRecord, AuthenticatedUser};

    #[tokio::test]
    async fn test_create_from_config() {
        let config = AuthConfig::from_toml_str(
            r#"
[oauth.token]
hashing_enabled = true
"#,
        )
        .unwrap();
        let store = create_token_store(&config).unwrap();
        assert!(store.settings().hasher().is_enabled());

        let record = AccessTokenRecord::new("C", AuthenticatedUser::new("a", "PRIMARY", 1), "v");
        store.insert(&record, None).await.unwrap();
        let stored = store.get_by_token_id(&record.token_id).await.unwrap().unwrap();
        assert!(stored.access_token.is_hashed());
    }

    #[test]
    fn test_rejects_postgres_backend() {
        let mut config = AuthConfig::default();
        config.storage.backend = StorageBackend::Postgres;
        config.storage.url = Some("postgres://localhost/db".to_string());
        assert!(matches!(
            create_token_store(&config),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
