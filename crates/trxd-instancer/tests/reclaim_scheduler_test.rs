// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reclaim scheduler tests on paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::task::JoinHandle;
use trxd_instancer::clock::TokioClock;
use trxd_instancer::config::ConfigError;
use trxd_instancer::persistence::{MemoryConfigStore, MemoryStore};
use trxd_instancer::reclaim_scheduler::ReclaimScheduler;
use trxd_instancer::runner::{MockCall, MockRunner};
use trxd_instancer::{
    ChallengeEndpoint, CreatedInstance, DeploymentConfig, Error, InstanceKey, Instancer, Settings,
};

struct Harness {
    store: Arc<MemoryStore>,
    configs: Arc<MemoryConfigStore>,
    runner: Arc<MockRunner>,
    instancer: Arc<Instancer>,
}

impl Harness {
    fn new(runner: MockRunner, configs: MemoryConfigStore) -> Self {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(runner);
        let anchor = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let instancer = Instancer::new(
            store.clone(),
            runner.clone(),
            runner.clone(),
            runner.clone(),
            Settings::default(),
        )
        .with_clock(Arc::new(TokioClock::starting_at(anchor)));

        Self {
            store,
            configs: Arc::new(configs),
            runner,
            instancer: Arc::new(instancer),
        }
    }

    fn scheduler(&self) -> ReclaimScheduler {
        ReclaimScheduler::new(
            self.store.clone(),
            self.configs.clone(),
            self.instancer.clone(),
        )
    }

    fn spawn(&self) -> (Arc<tokio::sync::Notify>, JoinHandle<Result<(), ConfigError>>) {
        let scheduler = self.scheduler();
        let shutdown = scheduler.shutdown_handle();
        (shutdown, tokio::spawn(scheduler.run()))
    }

    async fn create(&self, team_id: i32, lifetime_seconds: i64) -> Result<CreatedInstance, Error> {
        let config = DeploymentConfig {
            lifetime_seconds: Some(lifetime_seconds),
            ..DeploymentConfig::container("ghcr.io/ctf/web:latest")
        };
        self.instancer
            .create_instance(
                InstanceKey::new(team_id, 3),
                &ChallengeEndpoint::new("web.ctf.example", None),
                Some(8080),
                &config,
            )
            .await
    }
}

fn default_harness() -> Harness {
    Harness::new(MockRunner::new(), MemoryConfigStore::new())
}

#[tokio::test(start_paused = true)]
async fn test_reclaims_each_instance_at_its_expiry() {
    let h = default_harness();
    h.create(1, 5).await.unwrap();
    h.create(2, 50).await.unwrap();
    let (shutdown, handle) = h.spawn();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.store.len().await, 1, "first instance reclaimed at T+5");
    assert!(
        h.instancer
            .get_instance(InstanceKey::new(2, 3))
            .await
            .unwrap()
            .is_some()
    );

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(h.store.is_empty().await, "second instance reclaimed at T+50");
    assert!(h.runner.containers().await.is_empty());
    assert!(h.runner.networks().await.is_empty());

    shutdown.notify_one();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_short_lifetime_picked_up_while_idle() {
    let h = default_harness();
    let (shutdown, handle) = h.spawn();

    // Scheduler is now sleeping the 300s idle interval.
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.create(7, 60).await.unwrap();

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(h.store.len().await, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.store.is_empty().await);

    shutdown.notify_one();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renewal_postpones_reclaim() {
    let h = default_harness();
    h.create(7, 10).await.unwrap();
    let (shutdown, handle) = h.spawn();

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.instancer
        .renew_instance(InstanceKey::new(7, 3), Some(100))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(h.store.len().await, 1);

    tokio::time::sleep(Duration::from_secs(51)).await;
    assert!(h.store.is_empty().await);

    shutdown.notify_one();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pending_row_reclaimed_without_engine_calls() {
    let h = Harness::new(MockRunner::failing(), MemoryConfigStore::new());
    h.create(7, 10).await.unwrap_err();
    let launch_calls = h.runner.calls().await.len();
    assert_eq!(h.store.len().await, 1);

    let (shutdown, handle) = h.spawn();
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert!(h.store.is_empty().await);
    let calls = h.runner.calls().await;
    assert_eq!(calls.len(), launch_calls);
    assert!(!calls.iter().any(|c| matches!(
        c,
        MockCall::RemoveContainer(_) | MockCall::RemoveNetwork(_)
    )));

    shutdown.notify_one();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cycle_sleeps_interval_when_idle() {
    let h = Harness::new(
        MockRunner::new(),
        MemoryConfigStore::with_values([("reclaim-instance-interval", "30")]),
    );
    let mut scheduler = h.scheduler();
    assert_eq!(scheduler.interval(), Duration::from_secs(300));

    assert_eq!(scheduler.cycle().await, Duration::from_secs(30));
    assert_eq!(scheduler.interval(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_cycle_sleeps_until_next_expiry() {
    let h = default_harness();
    h.create(1, 40).await.unwrap();
    h.create(2, 25).await.unwrap();

    let mut scheduler = h.scheduler();
    assert_eq!(scheduler.cycle().await, Duration::from_secs(25));
    assert_eq!(h.store.len().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_falls_back_to_interval_on_store_outage() {
    let h = default_harness();
    h.create(1, 5).await.unwrap();
    let mut scheduler = h.scheduler();
    scheduler.load_interval().await.unwrap();

    h.store.set_unavailable(true);
    h.configs.set_unavailable(true);
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(scheduler.cycle().await, Duration::from_secs(300));

    h.store.set_unavailable(false);
    assert_eq!(scheduler.cycle().await, Duration::ZERO);
    assert!(h.store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_keeps_row_when_teardown_fails() {
    let h = default_harness();
    h.create(1, 5).await.unwrap();
    let mut scheduler = h.scheduler();

    h.runner.set_fail_teardown(true);
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(scheduler.cycle().await, Duration::from_secs(300));
    assert_eq!(h.store.len().await, 1);

    h.runner.set_fail_teardown(false);
    assert_eq!(scheduler.cycle().await, Duration::ZERO);
    assert!(h.store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_idle_interval_read_failure_keeps_previous_value() {
    let h = Harness::new(
        MockRunner::new(),
        MemoryConfigStore::with_values([("reclaim-instance-interval", "45")]),
    );
    let mut scheduler = h.scheduler();
    scheduler.load_interval().await.unwrap();

    h.configs.set_unavailable(true);
    assert_eq!(scheduler.cycle().await, Duration::from_secs(45));
}

#[tokio::test]
async fn test_unreadable_interval_is_fatal() {
    for raw in ["soon", "0", "-5"] {
        let h = Harness::new(
            MockRunner::new(),
            MemoryConfigStore::with_values([("reclaim-instance-interval", raw)]),
        );
        let err = h.scheduler().run().await.unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "reclaim-instance-interval"),
            "unexpected error for {raw}: {err}"
        );
    }

    let configs = MemoryConfigStore::new();
    configs.set_unavailable(true);
    let h = Harness::new(MockRunner::new(), configs);
    assert!(matches!(
        h.scheduler().run().await,
        Err(ConfigError::Store(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_loop() {
    let h = default_harness();
    let (shutdown, handle) = h.spawn();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!handle.is_finished());

    shutdown.notify_one();
    handle.await.unwrap().unwrap();
}
