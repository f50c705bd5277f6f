//! Redis-backed store contract tests
//!
//! These need a live redis and are ignored by default. Run with:
//! ```sh
//! REDIS_URL=redis://127.0.0.1:6379 \
//!   cargo test --test redis_store_contention -- --ignored --nocapture
//! ```
//!
//! Every test namespaces its keys with a fresh prefix so parallel runs
//! cannot collide.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use turnsync::config::Config;
use turnsync::error::SyncError;
use turnsync::model::{SessionStatus, SyncMode, SyncSession, TimeoutAction};
use turnsync::store::{RedisSessionStore, SessionStore};

async fn test_store() -> Arc<RedisSessionStore> {
    let mut config = Config::default();
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.redis_url = url;
    }
    config.key_prefix = format!("test_{}:", &Uuid::new_v4().to_string()[..8]);
    Arc::new(
        RedisSessionStore::connect(Arc::new(config))
            .await
            .expect("redis reachable"),
    )
}

fn sample(id: Uuid) -> SyncSession {
    SyncSession {
        session_id: id,
        sync_mode: SyncMode::PerParticipant,
        status: SessionStatus::Pending,
        version: 1,
        participants: vec![],
        groups: None,
        active_participant_id: None,
        active_group_id: None,
        total_time_ms: 600_000,
        time_per_cycle_ms: None,
        increment_ms: None,
        max_time_ms: None,
        time_used_ms: 0,
        cycle_started_at: None,
        session_started_at: None,
        session_completed_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        timeout_action: TimeoutAction::default(),
        outcome: None,
        last_auto_action: None,
    }
}

#[tokio::test]
#[ignore]
async fn concurrent_updates_have_exactly_one_winner_per_version() {
    let store = test_store().await;
    let id = Uuid::new_v4();
    let created = store.create(&sample(id)).await.expect("create");
    assert_eq!(created.version, 1);

    // Four writers race on the same observed version
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let observed = created.clone();
        tasks.push(tokio::spawn(async move {
            store.update(id, &observed, Some(1)).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(stored) => {
                assert_eq!(stored.version, 2);
                winners += 1;
            }
            Err(SyncError::Conflict { expected, actual }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners, 1, "exactly one writer may claim version 2");
    assert_eq!(conflicts, 3);

    let current = store.get(id).await.expect("get").expect("present");
    assert_eq!(current.version, 2);

    store.delete(id).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn stale_expected_version_conflicts() {
    let store = test_store().await;
    let id = Uuid::new_v4();
    let v1 = store.create(&sample(id)).await.expect("create");
    store.update(id, &v1, Some(1)).await.expect("first writer");

    let err = store.update(id, &v1, Some(1)).await.expect_err("stale");
    match err {
        SyncError::Conflict { expected, actual } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    store.delete(id).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn create_refuses_duplicates_atomically() {
    let store = test_store().await;
    let id = Uuid::new_v4();
    store.create(&sample(id)).await.expect("create");
    let err = store.create(&sample(id)).await.expect_err("duplicate");
    assert!(matches!(err, SyncError::SessionExists(_)));

    store.delete(id).await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn update_of_absent_session_is_not_found() {
    let store = test_store().await;
    let id = Uuid::new_v4();
    let err = store
        .update(id, &sample(id), Some(1))
        .await
        .expect_err("absent");
    assert!(matches!(err, SyncError::SessionNotFound(_)));
}
