//! End-to-end token store scenarios against the in-memory engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use octoauth::prelude::*;
use octoauth_memory::MemoryTokenStore;
use tokio_test::assert_ok;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("octoauth_memory=debug")
        .try_init();
}

fn alice() -> AuthenticatedUser {
    AuthenticatedUser::new("alice", "PRIMARY", -1234)
}

fn token(id: &str, value: &str) -> AccessTokenRecord {
    AccessTokenRecord::new("C", alice(), value)
        .with_token_id(id)
        .with_scope_string("openid email")
        .with_grant_type("authorization_code")
}

async fn active_count(store: &MemoryTokenStore) -> usize {
    store
        .get_latest_many("C", &alice(), None, "openid email", &QueryOptions::new())
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_happy_insert_and_read() {
    init_tracing();
    let store = MemoryTokenStore::default();
    let t1 = token("T1", "token-one").with_binding("NONE");
    assert_ok!(store.insert(&t1, None).await);

    let options = QueryOptions::new().binding("NONE");
    let latest = store
        .get_latest("C", &alice(), Some("PRIMARY"), "openid email", &options)
        .await
        .unwrap()
        .expect("T1 is the latest token");
    assert_eq!(latest, t1);
}

#[tokio::test]
async fn test_refresh_rotation() {
    init_tracing();
    let store = MemoryTokenStore::default();
    let t1 = token("T1", "token-one");
    let t2 = token("T2", "token-two").with_grant_type("refresh_token");
    store.insert(&t1, None).await.unwrap();

    let replaced = store.insert_conditional(&t2, &t1, None).await.unwrap();
    assert!(replaced);

    let latest = store
        .get_latest("C", &alice(), None, "openid email", &QueryOptions::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.token_id, "T2");

    let old = store.get_by_token_id("T1").await.unwrap().unwrap();
    assert_eq!(old.token_state, TokenState::Expired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_refresh_race() {
    init_tracing();
    let store = Arc::new(MemoryTokenStore::default());
    let t1 = token("T1", "token-one");
    store.insert(&t1, None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..2 {
        let store = Arc::clone(&store);
        let existing = t1.clone();
        handles.push(tokio::spawn(async move {
            let new = token(&format!("T2-{i}"), &format!("token-two-{i}"));
            store.insert_conditional(&new, &existing, None).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);
    assert_eq!(active_count(&store).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_refreshes_keep_one_active() {
    let store = Arc::new(MemoryTokenStore::default());
    let t1 = token("T1", "token-one");
    store.insert(&t1, None).await.unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            let existing = t1.clone();
            tokio::spawn(async move {
                let new = token(&format!("R{i}"), &format!("refresh-{i}"));
                store.insert_conditional(&new, &existing, None).await
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(active_count(&store).await, 1);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_revoke_individually_with_unknown_token() {
    init_tracing();
    let store = MemoryTokenStore::default();
    store.insert(&token("T1", "good"), None).await.unwrap();

    let report = store
        .revoke(
            &["good".to_string(), "unknown".to_string()],
            &RevokeOptions::individual(),
        )
        .await
        .unwrap();

    assert_eq!(report.revoked, vec!["T1"]);
    assert_eq!(report.skipped, 1);
    assert!(report.is_complete());

    let t1 = store.get_by_token_id("T1").await.unwrap().unwrap();
    assert_eq!(t1.token_state, TokenState::Revoked);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_binding_lookup_and_removal() {
    init_tracing();
    let store = MemoryTokenStore::default();
    let index = store.binding_index().expect("binding index is maintained");

    store
        .insert(&token("T3", "token-three").with_binding("sess-42"), None)
        .await
        .unwrap();
    let ids = index.get_token_ids_by_session("sess-42").await.unwrap();
    assert!(ids.contains("T3"));

    store.revoke_by_id("T3", "admin").await.unwrap();
    let ids = index.get_token_ids_by_session("sess-42").await.unwrap();
    assert!(!ids.contains("T3"));
    assert!(
        index
            .get_token_ids_by_session("unknown-session")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_domain_rename_is_atomic_for_readers() {
    init_tracing();
    let store = Arc::new(MemoryTokenStore::default());
    for i in 0..3 {
        let user = AuthenticatedUser::new(format!("user-{i}"), "OLD", 7);
        let record = AccessTokenRecord::new("C", user, format!("value-{i}"))
            .with_token_id(format!("R{i}"));
        store.insert(&record, None).await.unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut snapshots = 0;
            loop {
                let finished = done.load(Ordering::SeqCst);
                let rows = store.get_by_tenant(7).await.unwrap();
                let domains: HashSet<_> = rows
                    .iter()
                    .map(|r| r.authenticated_user.user_store_domain.clone())
                    .collect();
                assert_eq!(rows.len(), 3);
                assert_eq!(domains.len(), 1, "mixed domains: {domains:?}");
                snapshots += 1;
                if finished {
                    return snapshots;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let renamed = store.update_user_store_domain(7, "OLD", "NEW").await.unwrap();
    done.store(true, Ordering::SeqCst);
    assert!(reader.await.unwrap() >= 1);
    assert_eq!(renamed, 3);

    let rows = store.get_by_tenant(7).await.unwrap();
    assert!(
        rows.iter()
            .all(|r| r.authenticated_user.user_store_domain == "NEW")
    );
    assert!(store.get_by_user_store(7, "OLD").await.unwrap().is_empty());
    assert_eq!(store.get_by_user_store(7, "new").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_rename_is_scoped_to_tenant() {
    let store = MemoryTokenStore::default();
    let tenant_7 = AuthenticatedUser::new("alice", "OLD", 7);
    let tenant_8 = AuthenticatedUser::new("alice", "OLD", 8);
    store
        .insert(&AccessTokenRecord::new("C", tenant_7, "a").with_token_id("A"), None)
        .await
        .unwrap();
    store
        .insert(&AccessTokenRecord::new("C", tenant_8, "b").with_token_id("B"), None)
        .await
        .unwrap();

    assert_eq!(store.update_user_store_domain(7, "old", "new").await.unwrap(), 1);
    let other = store.get_by_token_id("B").await.unwrap().unwrap();
    assert_eq!(other.authenticated_user.user_store_domain, "OLD");
}

#[tokio::test]
async fn test_revoking_twice_is_a_noop() {
    let store = MemoryTokenStore::default();
    store.insert(&token("T1", "v1"), None).await.unwrap();

    assert_ok!(store.revoke_by_id("T1", "admin").await);
    assert_ok!(store.revoke_by_id("T1", "admin").await);

    let report = store
        .revoke(&["v1".to_string()], &RevokeOptions::batch())
        .await
        .unwrap();
    assert!(report.revoked.is_empty());
}

#[tokio::test]
async fn test_case_insensitive_tenant_usernames() {
    let settings = StoreSettings::new(
        TokenHasher::disabled(),
        UsernamePolicy::new(true).with_tenant(-1234, false),
    );
    let store = MemoryTokenStore::new(settings);
    store.insert(&token("T1", "v1"), None).await.unwrap();

    let shouting = AuthenticatedUser::new("ALICE", "primary", -1234);
    let latest = store
        .get_latest("C", &shouting, None, "email openid", &QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(latest.map(|r| r.token_id), Some("T1".to_string()));
}

#[test]
fn test_store_is_usable_from_blocking_code() {
    let store = MemoryTokenStore::default();
    tokio_test::block_on(async {
        store.insert(&token("T1", "v1"), None).await.unwrap();
        let id = store.get_token_id_by_access_token("v1").await.unwrap();
        assert_eq!(id.as_deref(), Some("T1"));
    });
}
