//! Token table and its secondary indexes.
//!
//! The table is a plain synchronous data structure. The store wraps it in a
//! single lock, so every method here runs to completion inside one critical
//! section and multi-row changes are atomic. Methods that can fail check
//! everything before mutating anything.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use octoauth::AuthResult;
use octoauth::error::AuthError;
use octoauth::storage::{PreparedRecord, QueryOptions};
use octoauth::token::{OPENID_SCOPE, TokenKey, UserKey, mask_token};
use octoauth::types::{ACTIVE_STATE_ID, AccessTokenRecord, TokenState};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredRow {
    record: AccessTokenRecord,
    key: TokenKey,
}

/// Selects rows by logical key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeyMatch {
    /// Consumer key, user, scope and binding.
    Exact,
    /// Consumer key, user and scope.
    IgnoreBinding,
    /// Consumer key and user.
    ClientUser,
}

impl KeyMatch {
    fn matches(self, query: &TokenKey, row: &TokenKey) -> bool {
        match self {
            Self::Exact => query == row,
            Self::IgnoreBinding => query.matches_ignoring_binding(row),
            Self::ClientUser => query.consumer_key == row.consumer_key && query.user == row.user,
        }
    }
}

/// Outcome of a user-store rename.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RenameOutcome {
    pub relabelled: u64,
    pub superseded: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    rows: HashMap<String, StoredRow>,
    /// Stored token value to id, for rows that are not `INACTIVE`.
    by_value: HashMap<String, String>,
    /// Logical key to the id of its `ACTIVE` row.
    active: HashMap<TokenKey, String>,
    /// Session to token ids with their tenant.
    sessions: HashMap<String, BTreeMap<String, i32>>,
    /// Token id to the sessions it is mapped to.
    token_sessions: HashMap<String, BTreeSet<String>>,
}

fn newest_first(records: &mut [AccessTokenRecord]) {
    records.sort_by(|a, b| {
        b.issued_time
            .cmp(&a.issued_time)
            .then_with(|| b.token_id.cmp(&a.token_id))
    });
}

impl TokenTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, token_id: &str) -> Option<&AccessTokenRecord> {
        self.rows.get(token_id).map(|row| &row.record)
    }

    fn state_of(&self, token_id: &str) -> Option<TokenState> {
        self.rows.get(token_id).map(|row| row.record.token_state)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Rejects a row that would break id or value uniqueness.
    fn check_unique(&self, record: &AccessTokenRecord) -> AuthResult<()> {
        if self.rows.contains_key(&record.token_id) {
            return Err(AuthError::duplicate_token(&record.token_id));
        }
        if record.token_state != TokenState::Inactive
            && self.by_value.contains_key(record.access_token.stored())
        {
            return Err(AuthError::duplicate_token(&mask_token(
                record.access_token.stored(),
            )));
        }
        Ok(())
    }

    /// Inserts a row, expiring the `ACTIVE` row it supersedes.
    pub fn insert(&mut self, prepared: PreparedRecord) -> AuthResult<Option<String>> {
        self.check_unique(&prepared.record)?;
        Ok(self.insert_unchecked(prepared))
    }

    fn insert_unchecked(&mut self, prepared: PreparedRecord) -> Option<String> {
        let PreparedRecord { record, key } = prepared;
        let token_id = record.token_id.clone();
        let active = record.token_state == TokenState::Active;

        let superseded = if active {
            self.active.get(&key).cloned()
        } else {
            None
        };
        if let Some(previous) = &superseded {
            self.transition(previous, TokenState::Expired, None);
        }

        if record.token_state != TokenState::Inactive {
            self.by_value
                .insert(record.access_token.stored().to_string(), token_id.clone());
        }
        if active {
            self.active.insert(key.clone(), token_id.clone());
            if record.is_bound() {
                self.map_session(
                    &record.token_binding_reference,
                    &token_id,
                    record.authenticated_user.tenant_id,
                );
            }
        }
        self.rows.insert(token_id, StoredRow { record, key });
        superseded
    }

    /// Replaces `existing_id` with `prepared` if it is still the `ACTIVE`
    /// row of its key.
    pub fn insert_conditional(
        &mut self,
        mut prepared: PreparedRecord,
        existing_id: &str,
    ) -> AuthResult<bool> {
        let Some(existing) = self.rows.get(existing_id) else {
            return Ok(false);
        };
        if self.active.get(&existing.key).map(String::as_str) != Some(existing_id) {
            return Ok(false);
        }

        prepared.record.token_state = TokenState::Active;
        prepared.record.token_state_id = ACTIVE_STATE_ID.to_string();
        self.check_unique(&prepared.record)?;

        self.transition(existing_id, TokenState::Expired, None);
        self.insert_unchecked(prepared);
        Ok(true)
    }

    /// Moves the old row to `old_state` and inserts the new one.
    pub fn rotate(
        &mut self,
        old_token_id: &str,
        old_state: TokenState,
        consumer_key: &str,
        old_state_id: Option<String>,
        mut prepared: PreparedRecord,
    ) -> AuthResult<()> {
        let old = self
            .rows
            .get(old_token_id)
            .ok_or_else(|| AuthError::token_not_found(old_token_id))?;
        if old.record.consumer_key != consumer_key {
            return Err(AuthError::invalid_request(format!(
                "token {} was not issued to {}",
                old_token_id, consumer_key
            )));
        }
        let current = old.record.token_state;
        if old_state == TokenState::Active
            || (current != old_state && !current.can_transition_to(old_state))
        {
            return Err(AuthError::invalid_transition(current, old_state));
        }

        prepared.record.token_state = TokenState::Active;
        prepared.record.token_state_id = ACTIVE_STATE_ID.to_string();
        self.check_unique(&prepared.record)?;

        if current != old_state {
            self.transition(old_token_id, old_state, old_state_id);
        }
        self.insert_unchecked(prepared);
        Ok(())
    }

    /// Writes a state without checking legality.
    ///
    /// Leaving `ACTIVE` drops the key and session entries; entering
    /// `INACTIVE` releases the token value.
    fn transition(&mut self, token_id: &str, next: TokenState, state_id: Option<String>) {
        let Some(row) = self.rows.get_mut(token_id) else {
            return;
        };
        let previous = row.record.token_state;
        row.record.token_state = next;
        if next == TokenState::Active {
            row.record.token_state_id = ACTIVE_STATE_ID.to_string();
        } else if previous == TokenState::Active || state_id.is_some() {
            row.record.token_state_id = state_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        }

        if previous == TokenState::Active
            && next != TokenState::Active
            && self.active.get(&row.key).map(String::as_str) == Some(token_id)
        {
            self.active.remove(&row.key);
        }
        if next == TokenState::Inactive {
            let value = row.record.access_token.stored();
            if self.by_value.get(value).map(String::as_str) == Some(token_id) {
                self.by_value.remove(value);
            }
        }

        if next != TokenState::Active {
            self.unmap_sessions(token_id);
        }
    }

    /// Applies a checked state change.
    pub fn update_state(
        &mut self,
        token_id: &str,
        next: TokenState,
        grant_type: Option<&str>,
    ) -> AuthResult<bool> {
        let current = self
            .state_of(token_id)
            .ok_or_else(|| AuthError::token_not_found(token_id))?;
        if current == next {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            return Err(AuthError::invalid_transition(current, next));
        }
        self.transition(token_id, next, None);
        if let (Some(grant_type), Some(row)) = (grant_type, self.rows.get_mut(token_id)) {
            row.record.grant_type = grant_type.to_string();
        }
        Ok(true)
    }

    /// Revokes the `ACTIVE` row holding a stored value.
    pub fn revoke_value(&mut self, stored: &str) -> Option<String> {
        let token_id = self.by_value.get(stored)?.clone();
        if self.state_of(&token_id) != Some(TokenState::Active) {
            return None;
        }
        self.transition(&token_id, TokenState::Revoked, None);
        Some(token_id)
    }

    pub fn revoke_by_id(&mut self, token_id: &str, acting_user_id: &str) -> AuthResult<bool> {
        let current = self
            .state_of(token_id)
            .ok_or_else(|| AuthError::token_not_found(token_id))?;
        if current != TokenState::Active {
            return Ok(false);
        }
        self.transition(token_id, TokenState::Revoked, None);
        if let Some(row) = self.rows.get_mut(token_id) {
            row.record.revoked_by = Some(acting_user_id.to_string());
        }
        Ok(true)
    }

    pub fn update_consent(&mut self, token_id: &str, is_consented: bool) -> AuthResult<()> {
        let row = self
            .rows
            .get_mut(token_id)
            .ok_or_else(|| AuthError::token_not_found(token_id))?;
        row.record.is_consented_grant = is_consented;
        Ok(())
    }

    pub fn purge_inactive(&mut self) -> u64 {
        let before = self.rows.len();
        self.rows
            .retain(|_, row| row.record.token_state != TokenState::Inactive);
        (before - self.rows.len()) as u64
    }

    /// Relabels one tenant's rows from `old_domain` to `new_domain`.
    ///
    /// Both domains must already be normalized. An `ACTIVE` row whose new
    /// key is taken by another `ACTIVE` row is expired instead of
    /// displacing it.
    pub fn rename_user_store(
        &mut self,
        tenant_id: i32,
        old_domain: &str,
        new_domain: &str,
        relabel: impl Fn(&TokenKey) -> TokenKey,
    ) -> RenameOutcome {
        let mut outcome = RenameOutcome::default();
        if old_domain == new_domain {
            return outcome;
        }

        let ids: Vec<String> = self
            .rows
            .iter()
            .filter(|(_, row)| {
                row.key.user.tenant_id == tenant_id && row.key.user.user_store_domain == old_domain
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let Some(row) = self.rows.get(&id) else {
                continue;
            };
            let new_key = relabel(&row.key);
            let is_active = row.record.token_state == TokenState::Active;

            if is_active && self.active.contains_key(&new_key) {
                self.transition(&id, TokenState::Expired, None);
                outcome.superseded += 1;
            }

            let Some(row) = self.rows.get_mut(&id) else {
                continue;
            };
            let old_key = std::mem::replace(&mut row.key, new_key.clone());
            row.record.authenticated_user.user_store_domain = new_domain.to_string();
            if row.record.token_state == TokenState::Active {
                self.active.remove(&old_key);
                self.active.insert(new_key, id.clone());
            }
            outcome.relabelled += 1;
        }
        outcome
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn collect<F>(&self, filter: F) -> Vec<AccessTokenRecord>
    where
        F: Fn(&StoredRow) -> bool,
    {
        let mut records: Vec<_> = self
            .rows
            .values()
            .filter(|row| filter(row))
            .map(|row| row.record.clone())
            .collect();
        newest_first(&mut records);
        records
    }

    pub fn find_by_key(
        &self,
        query: &TokenKey,
        mode: KeyMatch,
        options: &QueryOptions,
    ) -> Vec<AccessTokenRecord> {
        let mut records =
            self.collect(|row| mode.matches(query, &row.key) && options.admits(row.record.token_state));
        if let Some(limit) = options.limit {
            records.truncate(limit);
        }
        records
    }

    pub fn active_by_consumer_key(
        &self,
        consumer_key: &str,
        now: OffsetDateTime,
    ) -> Vec<AccessTokenRecord> {
        self.collect(|row| row.record.consumer_key == consumer_key && row.record.is_active_at(now))
    }

    pub fn active_by_user(&self, user: &UserKey) -> Vec<AccessTokenRecord> {
        self.collect(|row| {
            row.record.token_state == TokenState::Active && &row.key.user == user
        })
    }

    pub fn active_by_tenant(&self, tenant_id: i32) -> Vec<AccessTokenRecord> {
        self.collect(|row| {
            row.record.token_state == TokenState::Active && row.key.user.tenant_id == tenant_id
        })
    }

    pub fn active_by_user_store(&self, tenant_id: i32, domain: &str) -> Vec<AccessTokenRecord> {
        self.collect(|row| {
            row.record.token_state == TokenState::Active
                && row.key.user.tenant_id == tenant_id
                && row.key.user.user_store_domain == domain
        })
    }

    pub fn active_by_binding(
        &self,
        binding_ref: &str,
        user: Option<&UserKey>,
    ) -> Vec<AccessTokenRecord> {
        self.collect(|row| {
            row.record.token_state == TokenState::Active
                && row.key.binding_ref == binding_ref
                && user.is_none_or(|u| &row.key.user == u)
        })
    }

    pub fn active_openid_by_user(&self, user: &UserKey) -> Vec<AccessTokenRecord> {
        self.collect(|row| {
            row.record.token_state == TokenState::Active
                && &row.key.user == user
                && row.record.has_scope(OPENID_SCOPE)
        })
    }

    pub fn active_openid_by_consumer_key(&self, consumer_key: &str) -> Vec<AccessTokenRecord> {
        self.collect(|row| {
            row.record.token_state == TokenState::Active
                && row.record.consumer_key == consumer_key
                && row.record.has_scope(OPENID_SCOPE)
        })
    }

    /// Row holding a stored value, unless it is `INACTIVE`.
    pub fn find_by_value(&self, stored: &str) -> Option<&AccessTokenRecord> {
        let token_id = self.by_value.get(stored)?;
        self.get(token_id)
            .filter(|record| record.token_state != TokenState::Inactive)
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    fn map_session(&mut self, session_id: &str, token_id: &str, tenant_id: i32) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(token_id.to_string(), tenant_id);
        self.token_sessions
            .entry(token_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    fn unmap_sessions(&mut self, token_id: &str) {
        let Some(sessions) = self.token_sessions.remove(token_id) else {
            return;
        };
        for session_id in sessions {
            if let Some(tokens) = self.sessions.get_mut(&session_id) {
                tokens.remove(token_id);
                if tokens.is_empty() {
                    self.sessions.remove(&session_id);
                }
            }
        }
    }

    /// Maps a token to a session; a no-op unless the token is `ACTIVE`.
    pub fn store_session_mapping(
        &mut self,
        session_id: &str,
        token_id: &str,
        tenant_id: i32,
    ) -> AuthResult<bool> {
        let state = self
            .state_of(token_id)
            .ok_or_else(|| AuthError::token_not_found(token_id))?;
        if state != TokenState::Active {
            return Ok(false);
        }
        self.map_session(session_id, token_id, tenant_id);
        Ok(true)
    }

    pub fn token_ids_by_session(&self, session_id: &str) -> BTreeSet<String> {
        self.sessions
            .get(session_id)
            .map(|tokens| {
                tokens
                    .keys()
                    .filter(|id| self.state_of(id) == Some(TokenState::Active))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every session entry points at an `ACTIVE` row.
    #[cfg(test)]
    pub fn sessions_are_coherent(&self) -> bool {
        self.sessions.values().flat_map(BTreeMap::keys).all(|id| {
            self.state_of(id) == Some(TokenState::Active)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octoauth::storage::StoreSettings;
    use octoauth::types::AuthenticatedUser;

    fn settings() -> StoreSettings {
        StoreSettings::default()
    }

    fn alice() -> AuthenticatedUser {
        AuthenticatedUser::new("alice", "PRIMARY", 1)
    }

    fn prepared(id: &str, value: &str) -> PreparedRecord {
        let record = AccessTokenRecord::new("C", alice(), value)
            .with_token_id(id)
            .with_scopes(["openid"]);
        settings().prepare(&record, None).unwrap()
    }

    #[test]
    fn test_insert_supersedes_active_row() {
        let mut table = TokenTable::default();
        assert_eq!(table.insert(prepared("t1", "v1")).unwrap(), None);
        assert_eq!(
            table.insert(prepared("t2", "v2")).unwrap(),
            Some("t1".to_string())
        );

        let t1 = table.get("t1").unwrap();
        assert_eq!(t1.token_state, TokenState::Expired);
        assert_ne!(t1.token_state_id, ACTIVE_STATE_ID);
        assert_eq!(table.get("t2").unwrap().token_state, TokenState::Active);
    }

    #[test]
    fn test_insert_rejects_duplicates_without_effect() {
        let mut table = TokenTable::default();
        table.insert(prepared("t1", "v1")).unwrap();

        let err = table.insert(prepared("t1", "other")).unwrap_err();
        assert!(err.is_client_error());
        let err = table.insert(prepared("t2", "v1")).unwrap_err();
        assert!(err.is_client_error());

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("t1").unwrap().token_state, TokenState::Active);
    }

    #[test]
    fn test_inactive_value_can_be_reused() {
        let mut table = TokenTable::default();
        table.insert(prepared("t1", "v1")).unwrap();
        table.update_state("t1", TokenState::Inactive, None).unwrap();
        assert!(table.find_by_value("v1").is_none());
        table.insert(prepared("t2", "v1")).unwrap();
        assert_eq!(table.find_by_value("v1").unwrap().token_id, "t2");
    }

    #[test]
    fn test_conditional_insert_requires_current_active() {
        let mut table = TokenTable::default();
        table.insert(prepared("t1", "v1")).unwrap();

        assert!(table.insert_conditional(prepared("t2", "v2"), "t1").unwrap());
        assert!(!table.insert_conditional(prepared("t3", "v3"), "t1").unwrap());
        assert!(!table.insert_conditional(prepared("t4", "v4"), "missing").unwrap());
        assert!(table.get("t3").is_none());
        assert_eq!(table.get("t1").unwrap().token_state, TokenState::Expired);
    }

    #[test]
    fn test_update_state_rules() {
        let mut table = TokenTable::default();
        table.insert(prepared("t1", "v1")).unwrap();

        assert!(!table.update_state("t1", TokenState::Active, None).unwrap());
        assert!(
            table
                .update_state("t1", TokenState::Expired, Some("refresh_token"))
                .unwrap()
        );
        assert_eq!(table.get("t1").unwrap().grant_type, "refresh_token");

        let err = table
            .update_state("t1", TokenState::Revoked, None)
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(table.update_state("t1", TokenState::Inactive, None).unwrap());
        assert!(table.update_state("nope", TokenState::Expired, None).is_err());
    }

    #[test]
    fn test_session_index_follows_state() {
        let mut table = TokenTable::default();
        let record = AccessTokenRecord::new("C", alice(), "v1")
            .with_token_id("t1")
            .with_binding("sess-1");
        table.insert(settings().prepare(&record, None).unwrap()).unwrap();
        table.store_session_mapping("sess-2", "t1", 1).unwrap();

        assert!(table.token_ids_by_session("sess-1").contains("t1"));
        assert!(table.token_ids_by_session("sess-2").contains("t1"));
        assert!(table.sessions_are_coherent());

        table.revoke_by_id("t1", "admin").unwrap();
        assert!(table.token_ids_by_session("sess-1").is_empty());
        assert!(table.token_ids_by_session("sess-2").is_empty());
        assert!(table.sessions_are_coherent());

        assert!(!table.store_session_mapping("sess-3", "t1", 1).unwrap());
        assert!(table.store_session_mapping("sess-3", "missing", 1).is_err());
    }

    #[test]
    fn test_ordering_ties_break_on_token_id() {
        let mut table = TokenTable::default();
        let issued = octoauth::types::now_millis();
        for (id, value, state) in [
            ("a", "va", TokenState::Expired),
            ("b", "vb", TokenState::Expired),
        ] {
            let mut record = AccessTokenRecord::new("C", alice(), value)
                .with_token_id(id)
                .issued_at(issued);
            record.token_state = state;
            table.insert(settings().prepare(&record, None).unwrap()).unwrap();
        }

        let key = settings().query_key("C", &alice(), None, "", None);
        let options = QueryOptions::new().include_expired(true);
        let ids: Vec<_> = table
            .find_by_key(&key, KeyMatch::IgnoreBinding, &options)
            .into_iter()
            .map(|r| r.token_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_purge_inactive() {
        let mut table = TokenTable::default();
        table.insert(prepared("t1", "v1")).unwrap();
        table.insert(prepared("t2", "v2")).unwrap();
        table.update_state("t1", TokenState::Inactive, None).unwrap();

        assert_eq!(table.purge_inactive(), 1);
        assert!(table.get("t1").is_none());
        assert_eq!(table.len(), 1);
    }
}
