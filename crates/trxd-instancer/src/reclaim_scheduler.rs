// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reclaim scheduler for expired instances.
//!
//! A single background task that sleeps until the soonest instance expiry,
//! deletes it, and repeats. Each cycle:
//! - no instances: sleep the configured interval
//! - soonest not yet expired: sleep exactly until it expires
//! - soonest expired: delete it and re-check immediately
//! - query or delete failure: log and sleep the configured interval
//!
//! The orchestrator's expiry signal cuts a sleep short so a new instance with
//! a short lifetime is picked up without waiting out the interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ConfigError;
use crate::instancer::Instancer;
use crate::persistence::{ConfigStore, InstanceStore};
use crate::settings::{self, DEFAULT_RECLAIM_INTERVAL_SECS};

/// Reclaim scheduler that runs as a background task.
pub struct ReclaimScheduler {
    store: Arc<dyn InstanceStore>,
    configs: Arc<dyn ConfigStore>,
    instancer: Arc<Instancer>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    expiry_changed: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl ReclaimScheduler {
    /// Create a scheduler. The clock and expiry signal are taken from `instancer`.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        configs: Arc<dyn ConfigStore>,
        instancer: Arc<Instancer>,
    ) -> Self {
        Self {
            store,
            configs,
            clock: instancer.clock(),
            expiry_changed: instancer.expiry_changed(),
            instancer,
            interval: Duration::from_secs(DEFAULT_RECLAIM_INTERVAL_SECS),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Interval used when nothing is due or a cycle fails.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Read the configured interval. Failure is fatal to the scheduler.
    pub async fn load_interval(&mut self) -> Result<Duration, ConfigError> {
        self.interval = settings::reclaim_interval(self.configs.as_ref()).await?;
        Ok(self.interval)
    }

    /// Run the reclaim loop until shutdown.
    ///
    /// Returns an error only if the interval cannot be read at startup.
    pub async fn run(mut self) -> Result<(), ConfigError> {
        self.load_interval().await?;

        info!(
            interval_secs = self.interval.as_secs(),
            "Reclaim scheduler started"
        );

        let mut next = self.cycle().await;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Reclaim scheduler shutting down");
                    break;
                }
                _ = self.expiry_changed.notified() => {
                    debug!("Instance expiry changed, rescheduling");
                    next = self.cycle().await;
                }
                _ = tokio::time::sleep(next) => {
                    next = self.cycle().await;
                }
            }
        }

        Ok(())
    }

    /// Run one cycle. Returns how long to sleep before the next.
    pub async fn cycle(&mut self) -> Duration {
        let next = match self.store.next_to_expire().await {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "Failed to query next expiring instance");
                return self.interval;
            }
        };

        let Some(instance) = next else {
            self.refresh_interval().await;
            debug!(
                sleep_secs = self.interval.as_secs(),
                "No instances, sleeping"
            );
            return self.interval;
        };

        let now = self.clock.now();
        if !instance.is_expired(now) {
            let remaining = (instance.expires_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(
                team_id = instance.key.team_id,
                challenge_id = instance.key.challenge_id,
                sleep_ms = remaining.as_millis() as u64,
                "Sleeping until next expiry"
            );
            return remaining;
        }

        info!(
            team_id = instance.key.team_id,
            challenge_id = instance.key.challenge_id,
            expired_at = %instance.expires_at,
            pending = instance.is_pending(),
            "Reclaiming expired instance"
        );

        match self.instancer.delete_instance(instance.key).await {
            Ok(()) => Duration::ZERO,
            Err(e) => {
                error!(
                    team_id = instance.key.team_id,
                    challenge_id = instance.key.challenge_id,
                    error = %e,
                    "Failed to reclaim instance"
                );
                self.interval
            }
        }
    }

    /// Pick up interval changes while idle; keep the last value on failure.
    async fn refresh_interval(&mut self) {
        match settings::reclaim_interval(self.configs.as_ref()).await {
            Ok(interval) => {
                if interval != self.interval {
                    info!(
                        interval_secs = interval.as_secs(),
                        "Reclaim interval changed"
                    );
                }
                self.interval = interval;
            }
            Err(e) => warn!(error = %e, "Failed to refresh reclaim interval"),
        }
    }
}
