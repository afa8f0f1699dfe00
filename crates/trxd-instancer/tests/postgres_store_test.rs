// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests.
//!
//! Require `TEST_DATABASE_URL`; skipped otherwise.

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::PgPool;
use trxd_instancer::persistence::{
    ConfigStore, InstanceStore, PgConfigStore, PgInstanceStore, StoreError,
};
use trxd_instancer::{Executor, InstanceKey, InstanceState};

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a database pool with the schema applied
async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    // Parallel tests race on CREATE IF NOT EXISTS; the loser sees the winner's tables.
    let _ = sqlx::raw_sql(include_str!("../migrations/schema.sql"))
        .execute(&pool)
        .await;
    Some(pool)
}

/// Remove rows left by a previous run
async fn cleanup(pool: &PgPool, challenge_id: i32) {
    sqlx::query("DELETE FROM instances WHERE challenge_id = $1")
        .bind(challenge_id)
        .execute(pool)
        .await
        .ok();
}

fn later(minutes: i64) -> DateTime<Utc> {
    Utc::now() + Duration::minutes(minutes)
}

#[tokio::test]
async fn test_insert_and_attach() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to connect");
    let store = PgInstanceStore::new(pool.clone());
    let key = InstanceKey::new(1, 910_001);
    cleanup(&pool, key.challenge_id).await;

    let expires_at = later(30);
    store
        .insert_pending(key, expires_at, "abc.web.ctf.example", None)
        .await
        .unwrap();

    let pending = store.get(key).await.unwrap().unwrap();
    assert!(pending.is_pending());
    assert_eq!(pending.host, "abc.web.ctf.example");
    assert_eq!(pending.port, None);
    assert_eq!(pending.expires_at.timestamp(), expires_at.timestamp());

    let executor = Executor::Container("f00d".to_string());
    store.attach_executor(key, &executor).await.unwrap();
    let running = store.get(key).await.unwrap().unwrap();
    assert_eq!(running.state, InstanceState::Running(executor));

    store.delete(key).await.unwrap();
    assert!(store.get(key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_insert_rejected() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to connect");
    let store = PgInstanceStore::new(pool.clone());
    let key = InstanceKey::new(7, 910_002);
    cleanup(&pool, key.challenge_id).await;

    store
        .insert_pending(key, later(30), "pwn.ctf.example", Some(31337))
        .await
        .unwrap();
    let err = store
        .insert_pending(key, later(60), "pwn.ctf.example", Some(31337))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists));

    let row = store.get(key).await.unwrap().unwrap();
    assert_eq!(row.port, Some(31337));

    cleanup(&pool, key.challenge_id).await;
}

#[tokio::test]
async fn test_concurrent_inserts_single_winner() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to connect");
    let key = InstanceKey::new(7, 910_003);
    cleanup(&pool, key.challenge_id).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = PgInstanceStore::new(pool.clone());
        handles.push(tokio::spawn(async move {
            store
                .insert_pending(key, later(30), "pwn.ctf.example", Some(31337))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => winners += 1,
            Err(StoreError::AlreadyExists) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);

    cleanup(&pool, key.challenge_id).await;
}

#[tokio::test]
async fn test_update_and_delete_absent_are_noops() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to connect");
    let store = PgInstanceStore::new(pool.clone());
    let key = InstanceKey::new(3, 910_004);
    cleanup(&pool, key.challenge_id).await;

    store.update_expiry(key, later(10)).await.unwrap();
    store.delete(key).await.unwrap();
    assert!(store.get(key).await.unwrap().is_none());

    store
        .insert_pending(key, later(10), "x.ctf.example", None)
        .await
        .unwrap();
    let renewed = later(90);
    store.update_expiry(key, renewed).await.unwrap();
    let row = store.get(key).await.unwrap().unwrap();
    assert_eq!(row.expires_at.timestamp(), renewed.timestamp());

    cleanup(&pool, key.challenge_id).await;
}

#[tokio::test]
async fn test_next_to_expire_orders_by_expiry() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to connect");
    let store = PgInstanceStore::new(pool.clone());
    let challenge_id = 910_005;
    cleanup(&pool, challenge_id).await;

    // Far in the past so they sort ahead of rows from other tests.
    let base = Utc.with_ymd_and_hms(1971, 1, 1, 0, 0, 0).unwrap();
    let late = InstanceKey::new(2, challenge_id);
    let early = InstanceKey::new(1, challenge_id);
    store
        .insert_pending(late, base + Duration::seconds(50), "b", None)
        .await
        .unwrap();
    store
        .insert_pending(early, base + Duration::seconds(5), "a", None)
        .await
        .unwrap();

    let next = store.next_to_expire().await.unwrap().unwrap();
    assert_eq!(next.key, early);
    assert!(next.is_expired(Utc::now()));

    store.delete(early).await.unwrap();
    let next = store.next_to_expire().await.unwrap().unwrap();
    assert_eq!(next.key, late);

    cleanup(&pool, challenge_id).await;
}

#[tokio::test]
async fn test_config_upsert() {
    skip_if_no_db!();
    let pool = get_test_pool().await.expect("Failed to connect");
    let configs = PgConfigStore::new(pool);
    let key = "test-instancer-upsert";

    configs.set_config(key, "1").await.unwrap();
    assert_eq!(configs.get_config(key).await.unwrap().as_deref(), Some("1"));

    configs.set_config(key, "2").await.unwrap();
    assert_eq!(configs.get_config(key).await.unwrap().as_deref(), Some("2"));

    assert!(
        configs
            .get_config("test-instancer-missing")
            .await
            .unwrap()
            .is_none()
    );
}
