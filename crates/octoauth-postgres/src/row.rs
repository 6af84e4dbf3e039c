//! Mapping between `oauth_access_token` rows and token records.

use octoauth::token::{HashAlgorithm, parse_scope};
use octoauth::types::{AccessTokenRecord, AuthenticatedUser, TokenState, TokenValue};
use sqlx_core::row::Row;
use sqlx_postgres::PgRow;
use time::OffsetDateTime;

use crate::{StorageError, StorageResult};

/// Columns read back into an [`AccessTokenRecord`].
pub(crate) const TOKEN_COLUMNS: &str = "token_id, access_token, access_token_hash, \
    hash_algorithm, refresh_token, refresh_token_hash, refresh_token_id, consumer_key, \
    authz_user, user_domain, tenant_id, federated, token_scope, grant_type, token_state, \
    token_state_id, time_created, refresh_token_time_created, validity_period, \
    refresh_token_validity_period, token_binding_ref, consented_token, revoked_by";

/// The value a token is looked up by, whichever column holds it.
pub(crate) const STORED_VALUE: &str = "COALESCE(access_token_hash, access_token)";

/// Newest first, ties broken by id in byte order.
pub(crate) const NEWEST_FIRST: &str = r#"ORDER BY time_created DESC, token_id COLLATE "C" DESC"#;

/// Splits a value into its (plaintext, digest) column pair.
pub(crate) fn split_value(value: &TokenValue) -> (Option<&str>, Option<&str>) {
    match value {
        TokenValue::Plain { value } => (Some(value.as_str()), None),
        TokenValue::Hashed { digest, .. } => (None, Some(digest.as_str())),
    }
}

/// Algorithm recorded for a row; the refresh token shares the access token's.
pub(crate) fn algorithm_of(record: &AccessTokenRecord) -> Option<&'static str> {
    match &record.access_token {
        TokenValue::Hashed { algorithm, .. } => Some(algorithm.as_str()),
        TokenValue::Plain { .. } => None,
    }
}

fn join_value(
    column: &str,
    plain: Option<String>,
    digest: Option<String>,
    algorithm: Option<HashAlgorithm>,
) -> StorageResult<Option<TokenValue>> {
    match (plain, digest) {
        (None, None) => Ok(None),
        (Some(value), None) => Ok(Some(TokenValue::Plain { value })),
        (None, Some(digest)) => {
            let algorithm = algorithm.ok_or_else(|| {
                StorageError::invalid_row(format!("{column} is hashed without an algorithm"))
            })?;
            Ok(Some(TokenValue::Hashed { digest, algorithm }))
        }
        (Some(_), Some(_)) => Err(StorageError::invalid_row(format!(
            "{column} holds both a plaintext and a hashed value"
        ))),
    }
}

/// Decodes one row selected with [`TOKEN_COLUMNS`].
pub(crate) fn record_from_row(row: &PgRow) -> StorageResult<AccessTokenRecord> {
    let token_id: String = row.try_get("token_id")?;

    let algorithm = row
        .try_get::<Option<String>, _>("hash_algorithm")?
        .map(|name| name.parse::<HashAlgorithm>())
        .transpose()
        .map_err(|e| StorageError::invalid_row(e.to_string()))?;

    let access_token = join_value(
        "access_token",
        row.try_get("access_token")?,
        row.try_get("access_token_hash")?,
        algorithm,
    )?
    .ok_or_else(|| StorageError::invalid_row(format!("token {token_id} has no value")))?;
    let refresh_token = join_value(
        "refresh_token",
        row.try_get("refresh_token")?,
        row.try_get("refresh_token_hash")?,
        algorithm,
    )?;

    let state: String = row.try_get("token_state")?;
    let token_state = state
        .parse::<TokenState>()
        .map_err(|e| StorageError::invalid_row(e.to_string()))?;

    let scope: String = row.try_get("token_scope")?;
    let authenticated_user = AuthenticatedUser {
        username: row.try_get("authz_user")?,
        user_store_domain: row.try_get("user_domain")?,
        tenant_id: row.try_get("tenant_id")?,
        federated: row.try_get("federated")?,
    };

    Ok(AccessTokenRecord {
        token_id,
        access_token,
        refresh_token,
        refresh_token_id: row.try_get("refresh_token_id")?,
        consumer_key: row.try_get("consumer_key")?,
        authenticated_user,
        scopes: parse_scope(&scope),
        grant_type: row.try_get("grant_type")?,
        token_state,
        token_state_id: row.try_get("token_state_id")?,
        issued_time: row.try_get::<OffsetDateTime, _>("time_created")?,
        refresh_token_issued_time: row.try_get("refresh_token_time_created")?,
        validity_period_ms: row.try_get("validity_period")?,
        refresh_token_validity_period_ms: row.try_get("refresh_token_validity_period")?,
        token_binding_reference: row.try_get("token_binding_ref")?,
        is_consented_grant: row.try_get("consented_token")?,
        revoked_by: row.try_get("revoked_by")?,
    })
}

/// Decodes every row, failing on the first bad one.
pub(crate) fn records_from_rows(rows: &[PgRow]) -> StorageResult<Vec<AccessTokenRecord>> {
    rows.iter().map(record_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_value() {
        assert_eq!(split_value(&TokenValue::plain("abc")), (Some("abc"), None));
        let hashed = TokenValue::Hashed {
            digest: "d1".to_string(),
            algorithm: HashAlgorithm::Sha256,
        };
        assert_eq!(split_value(&hashed), (None, Some("d1")));
    }

    #[test]
    fn test_ties_break_in_byte_order() {
        assert!(NEWEST_FIRST.ends_with(r#"token_id COLLATE "C" DESC"#));
    }

    #[test]
    fn test_join_value() {
        assert_eq!(join_value("t", None, None, None).unwrap(), None);
        assert_eq!(
            join_value("t", Some("abc".to_string()), None, None).unwrap(),
            Some(TokenValue::plain("abc"))
        );
        assert_eq!(
            join_value("t", None, Some("d1".to_string()), Some(HashAlgorithm::Sha512)).unwrap(),
            Some(TokenValue::Hashed {
                digest: "d1".to_string(),
                algorithm: HashAlgorithm::Sha512,
            })
        );
        assert!(join_value("t", None, Some("d1".to_string()), None).is_err());
        assert!(join_value("t", Some("a".to_string()), Some("d".to_string()), None).is_err());
    }
}
