// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for trxd-instancer.
//!
//! [`InstancerRuntime`] wires the stores and engine backends into an
//! [`Instancer`] and runs the reclaim scheduler alongside it, so the HTTP
//! layer only has to hold on to the runtime.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trxd_instancer::persistence::{PgConfigStore, PgInstanceStore};
//! use trxd_instancer::runner::{ComposeRunner, DockerRunner};
//! use trxd_instancer::runtime::InstancerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let docker = Arc::new(DockerRunner::connect(Some("trxd-nginx-1".into())).await?);
//!
//!     let runtime = InstancerRuntime::builder()
//!         .store(Arc::new(PgInstanceStore::new(pool.clone())))
//!         .config_store(Arc::new(PgConfigStore::new(pool)))
//!         .containers(docker.clone())
//!         .networks(docker)
//!         .stacks(Arc::new(ComposeRunner::new("docker", ".data")))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // runtime.instancer().create_instance(...)
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::Clock;
use crate::exposure::HostnamePolicy;
use crate::instancer::Instancer;
use crate::persistence::{ConfigStore, InstanceStore};
use crate::reclaim_scheduler::ReclaimScheduler;
use crate::runner::{ContainerBackend, NetworkBackend, StackBackend};
use crate::settings::Settings;

/// Builder for creating an [`InstancerRuntime`].
#[derive(Default)]
pub struct InstancerRuntimeBuilder {
    store: Option<Arc<dyn InstanceStore>>,
    configs: Option<Arc<dyn ConfigStore>>,
    containers: Option<Arc<dyn ContainerBackend>>,
    stacks: Option<Arc<dyn StackBackend>>,
    networks: Option<Arc<dyn NetworkBackend>>,
    settings: Option<Settings>,
    hostname_policy: Option<Arc<dyn HostnamePolicy>>,
    clock: Option<Arc<dyn Clock>>,
}

impl InstancerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instance store (required).
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the key/value settings store (required).
    pub fn config_store(mut self, configs: Arc<dyn ConfigStore>) -> Self {
        self.configs = Some(configs);
        self
    }

    /// Set the single-container backend (required).
    pub fn containers(mut self, backend: Arc<dyn ContainerBackend>) -> Self {
        self.containers = Some(backend);
        self
    }

    /// Set the compose backend (required).
    pub fn stacks(mut self, backend: Arc<dyn StackBackend>) -> Self {
        self.stacks = Some(backend);
        self
    }

    /// Set the network backend (required).
    pub fn networks(mut self, backend: Arc<dyn NetworkBackend>) -> Self {
        self.networks = Some(backend);
        self
    }

    /// Use one runner for containers, stacks and networks.
    pub fn runner<R>(self, runner: Arc<R>) -> Self
    where
        R: ContainerBackend + StackBackend + NetworkBackend + 'static,
    {
        self.containers(runner.clone())
            .stacks(runner.clone())
            .networks(runner)
    }

    /// Use fixed settings instead of reading the settings store at start.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Replace the hostname policy for isolated instances.
    ///
    /// Default: hashed subdomains of `hash-len` characters
    pub fn hostname_policy(mut self, policy: Arc<dyn HostnamePolicy>) -> Self {
        self.hostname_policy = Some(policy);
        self
    }

    /// Replace the clock.
    ///
    /// Default: system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<InstancerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let configs = self
            .configs
            .ok_or_else(|| anyhow::anyhow!("config_store is required"))?;
        let containers = self
            .containers
            .ok_or_else(|| anyhow::anyhow!("containers backend is required"))?;
        let stacks = self
            .stacks
            .ok_or_else(|| anyhow::anyhow!("stacks backend is required"))?;
        let networks = self
            .networks
            .ok_or_else(|| anyhow::anyhow!("networks backend is required"))?;

        Ok(InstancerRuntimeConfig {
            store,
            configs,
            containers,
            stacks,
            networks,
            settings: self.settings,
            hostname_policy: self.hostname_policy,
            clock: self.clock,
        })
    }
}

/// Configuration for an [`InstancerRuntime`].
pub struct InstancerRuntimeConfig {
    store: Arc<dyn InstanceStore>,
    configs: Arc<dyn ConfigStore>,
    containers: Arc<dyn ContainerBackend>,
    stacks: Arc<dyn StackBackend>,
    networks: Arc<dyn NetworkBackend>,
    settings: Option<Settings>,
    hostname_policy: Option<Arc<dyn HostnamePolicy>>,
    clock: Option<Arc<dyn Clock>>,
}

impl InstancerRuntimeConfig {
    /// Load settings, then spawn the reclaim scheduler.
    ///
    /// Fails if the settings (including the reclaim interval) cannot be read.
    pub async fn start(self) -> Result<InstancerRuntime> {
        let settings = match self.settings {
            Some(settings) => settings,
            None => Settings::load(self.configs.as_ref()).await?,
        };

        let mut instancer = Instancer::new(
            self.store.clone(),
            self.containers,
            self.stacks,
            self.networks,
            settings,
        );
        if let Some(policy) = self.hostname_policy {
            instancer = instancer.with_hostname_policy(policy);
        }
        if let Some(clock) = self.clock {
            instancer = instancer.with_clock(clock);
        }
        let instancer = Arc::new(instancer);

        let mut scheduler = ReclaimScheduler::new(self.store, self.configs, instancer.clone());
        let interval = scheduler.load_interval().await?;
        let reclaim_shutdown = scheduler.shutdown_handle();

        let reclaim_handle = tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!(error = %e, "Reclaim scheduler stopped");
            }
        });

        info!(
            reclaim_interval_secs = interval.as_secs(),
            "InstancerRuntime started"
        );

        Ok(InstancerRuntime {
            instancer,
            reclaim_handle,
            reclaim_shutdown,
        })
    }
}

/// A running instancer with its reclaim scheduler.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct InstancerRuntime {
    instancer: Arc<Instancer>,
    reclaim_handle: JoinHandle<()>,
    reclaim_shutdown: Arc<Notify>,
}

impl InstancerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> InstancerRuntimeBuilder {
        InstancerRuntimeBuilder::new()
    }

    /// The shared orchestrator.
    pub fn instancer(&self) -> &Arc<Instancer> {
        &self.instancer
    }

    /// Check if the reclaim scheduler is still running.
    pub fn is_running(&self) -> bool {
        !self.reclaim_handle.is_finished()
    }

    /// Stop the reclaim scheduler and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        info!("InstancerRuntime shutting down...");

        self.reclaim_shutdown.notify_one();

        if let Err(e) = self.reclaim_handle.await {
            error!("Reclaim scheduler task panicked: {}", e);
            return Err(anyhow::anyhow!("reclaim scheduler task panicked: {}", e));
        }

        info!("InstancerRuntime shutdown complete");
        Ok(())
    }
}
