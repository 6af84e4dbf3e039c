use std::collections::BTreeSet;

use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::PgConnection;
use tracing::{debug, instrument};

use crate::StorageResult;

/// Session to token index over `oauth_token_session_mapping`.
///
/// Operates on a borrowed connection so that mapping changes commit or roll
/// back together with the token rows they follow.
pub struct SessionTokenIndex<'a> {
    conn: &'a mut PgConnection,
}

impl<'a> SessionTokenIndex<'a> {
    pub fn new(conn: &'a mut PgConnection) -> Self {
        Self { conn }
    }

    /// Ids of the `ACTIVE` tokens mapped to a session.
    #[instrument(skip(self))]
    pub async fn find_token_ids(&mut self, session_id: &str) -> StorageResult<BTreeSet<String>> {
        let ids = query_scalar::<_, String>(
            r#"
            SELECT m.token_id
            FROM oauth_token_session_mapping m
            JOIN oauth_access_token t ON t.token_id = m.token_id
            WHERE m.session_id = $1 AND t.token_state = 'ACTIVE'
            "#,
        )
        .bind(session_id)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(ids.into_iter().collect())
    }

    /// Maps a token to a session. An existing mapping is left as is.
    #[instrument(skip(self))]
    pub async fn insert(
        &mut self,
        session_id: &str,
        token_id: &str,
        tenant_id: i32,
    ) -> StorageResult<()> {
        let rows_affected = query(
            r#"
            INSERT INTO oauth_token_session_mapping (session_id, token_id, tenant_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(token_id)
        .bind(tenant_id)
        .execute(&mut *self.conn)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            debug!("Inserted session token mapping");
        }

        Ok(())
    }

    /// Drops every mapping of the given tokens.
    /// Called whenever a token leaves `ACTIVE`.
    #[instrument(skip(self, token_ids), fields(count = token_ids.len()))]
    pub async fn delete_for_tokens(&mut self, token_ids: &[String]) -> StorageResult<u64> {
        if token_ids.is_empty() {
            return Ok(0);
        }

        let rows_affected = query(
            r#"
            DELETE FROM oauth_token_session_mapping
            WHERE token_id = ANY($1)
            "#,
        )
        .bind(token_ids)
        .execute(&mut *self.conn)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            debug!(count = rows_affected, "Deleted session token mappings");
        }

        Ok(rows_affected)
    }
}
