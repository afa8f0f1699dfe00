// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance orchestrator.
//!
//! Ties persistence, network allocation and the executor backends together.
//!
//! Create: validate, check for a live row, insert a pending row (the primary
//! key decides races), resolve exposure, allocate the network, launch, then
//! record the executor. A failed launch returns the error and leaves the
//! pending row in place; the reclaim scheduler deletes it once it expires,
//! freeing the slot without any engine teardown.
//!
//! Delete: tear down the executor of a running row, remove its network, then
//! delete the row. A failed teardown keeps the row so the next delete (user
//! or scheduler) retries it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::exposure::{Exposure, HashedSubdomain, HostnamePolicy, resolve_exposure};
use crate::instance::{
    ChallengeEndpoint, CreatedInstance, DeployType, DeploymentConfig, Executor, Instance,
    InstanceKey, InstanceState,
};
use crate::persistence::{InstanceStore, StoreError};
use crate::runner::{
    ContainerBackend, ContainerSpec, NetworkBackend, PortMapping, ResourceLimits, StackBackend,
    StackSpec,
};
use crate::settings::Settings;

/// Service port the proxy routes to when the challenge declares none.
pub const DEFAULT_ROUTED_PORT: u16 = 1337;

/// Challenge instance lifecycle manager.
pub struct Instancer {
    store: Arc<dyn InstanceStore>,
    containers: Arc<dyn ContainerBackend>,
    stacks: Arc<dyn StackBackend>,
    networks: Arc<dyn NetworkBackend>,
    settings: Settings,
    hostnames: Arc<dyn HostnamePolicy>,
    clock: Arc<dyn Clock>,
    expiry_changed: Arc<Notify>,
}

/// Launch inputs after validation and default substitution.
struct LaunchPlan<'a> {
    key: InstanceKey,
    config: &'a DeploymentConfig,
    exposure: Exposure,
    internal_port: Option<u16>,
    limits: ResourceLimits,
}

impl Instancer {
    /// Create an orchestrator using hashed subdomains and the system clock.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        containers: Arc<dyn ContainerBackend>,
        stacks: Arc<dyn StackBackend>,
        networks: Arc<dyn NetworkBackend>,
        settings: Settings,
    ) -> Self {
        let hostnames = Arc::new(HashedSubdomain::new(settings.hash_len));
        Self {
            store,
            containers,
            stacks,
            networks,
            settings,
            hostnames,
            clock: Arc::new(SystemClock),
            expiry_changed: Arc::new(Notify::new()),
        }
    }

    /// Replace the hostname policy for isolated instances.
    pub fn with_hostname_policy(mut self, policy: Arc<dyn HostnamePolicy>) -> Self {
        self.hostnames = policy;
        self
    }

    /// Replace the clock used for expiry arithmetic.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Active settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Clock used for expiry arithmetic.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Signalled whenever a row is inserted or its expiry moves.
    pub fn expiry_changed(&self) -> Arc<Notify> {
        self.expiry_changed.clone()
    }

    /// Create and launch an instance.
    ///
    /// `endpoint` is the challenge's static host/port; `internal_port` is the
    /// port the service listens on, required for fixed-port containers.
    pub async fn create_instance(
        &self,
        key: InstanceKey,
        endpoint: &ChallengeEndpoint,
        internal_port: Option<u16>,
        config: &DeploymentConfig,
    ) -> Result<CreatedInstance> {
        info!(
            team_id = key.team_id,
            challenge_id = key.challenge_id,
            deploy_type = ?config.deploy_type,
            "Creating instance"
        );

        let exposure = resolve_exposure(key, config.hash_domain, endpoint, self.hostnames.as_ref());
        let plan = self.plan(key, config, exposure, internal_port)?;
        let lifetime = self.lifetime(config.lifetime_seconds)?;

        if self.store.get(key).await?.is_some() {
            info!(
                team_id = key.team_id,
                challenge_id = key.challenge_id,
                "Instance already active"
            );
            return Err(Error::AlreadyActive(key));
        }

        let expires_at = self.expiry(lifetime)?;
        let host = plan.exposure.host().to_string();
        let port = plan.exposure.port();

        match self.store.insert_pending(key, expires_at, &host, port).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => {
                info!(
                    team_id = key.team_id,
                    challenge_id = key.challenge_id,
                    "Lost instance creation race"
                );
                return Err(Error::Race(key));
            }
            Err(e) => return Err(e.into()),
        }
        self.expiry_changed.notify_one();

        let executor = match self.launch(&plan).await {
            Ok(executor) => executor,
            Err(e) => {
                error!(
                    team_id = key.team_id,
                    challenge_id = key.challenge_id,
                    expires_at = %expires_at,
                    error = %e,
                    "Instance launch failed, pending row left for reclamation"
                );
                return Err(e);
            }
        };

        if let Err(e) = self.store.attach_executor(key, &executor).await {
            error!(
                team_id = key.team_id,
                challenge_id = key.challenge_id,
                executor_id = %executor.id(),
                error = %e,
                "Failed to record executor, tearing it down"
            );
            // A pending row is reclaimed without engine calls, so nothing may stay running.
            if let Err(teardown_err) = self.teardown(key, &executor, port.is_none()).await {
                warn!(
                    team_id = key.team_id,
                    challenge_id = key.challenge_id,
                    executor_id = %executor.id(),
                    error = %teardown_err,
                    "Failed to tear down unrecorded executor"
                );
            }
            return Err(e.into());
        }

        info!(
            team_id = key.team_id,
            challenge_id = key.challenge_id,
            executor_kind = executor.kind(),
            executor_id = %executor.id(),
            host = %host,
            port = ?port,
            "Instance running"
        );

        Ok(CreatedInstance {
            host,
            port,
            expires_at,
        })
    }

    /// Tear down and forget an instance. Absent pairs are a no-op.
    pub async fn delete_instance(&self, key: InstanceKey) -> Result<()> {
        let Some(instance) = self.store.get(key).await? else {
            debug!(
                team_id = key.team_id,
                challenge_id = key.challenge_id,
                "No instance to delete"
            );
            return Ok(());
        };

        info!(
            team_id = key.team_id,
            challenge_id = key.challenge_id,
            pending = instance.is_pending(),
            "Deleting instance"
        );

        match &instance.state {
            InstanceState::Pending => {}
            // Isolated instances carry no port.
            InstanceState::Running(executor) => {
                self.teardown(key, executor, instance.port.is_none()).await?
            }
        }

        self.store.delete(key).await?;
        Ok(())
    }

    /// Set a new expiry. Absent pairs are a no-op.
    pub async fn update_instance(&self, key: InstanceKey, expires_at: DateTime<Utc>) -> Result<()> {
        self.store.update_expiry(key, expires_at).await?;
        self.expiry_changed.notify_one();
        Ok(())
    }

    /// Push the expiry to now + `lifetime_seconds` (or the default lifetime).
    /// Returns the new expiry. Absent pairs are a no-op.
    pub async fn renew_instance(
        &self,
        key: InstanceKey,
        lifetime_seconds: Option<i64>,
    ) -> Result<DateTime<Utc>> {
        let expires_at = self.expiry(self.lifetime(lifetime_seconds)?)?;
        self.update_instance(key, expires_at).await?;

        debug!(
            team_id = key.team_id,
            challenge_id = key.challenge_id,
            expires_at = %expires_at,
            "Instance renewed"
        );
        Ok(expires_at)
    }

    /// Look up an instance.
    pub async fn get_instance(&self, key: InstanceKey) -> Result<Option<Instance>> {
        Ok(self.store.get(key).await?)
    }

    fn expiry(&self, lifetime: chrono::Duration) -> Result<DateTime<Utc>> {
        self.clock.now().checked_add_signed(lifetime).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "lifetime out of range: {}s",
                lifetime.num_seconds()
            ))
        })
    }

    fn lifetime(&self, lifetime_seconds: Option<i64>) -> Result<chrono::Duration> {
        let secs = lifetime_seconds.unwrap_or(self.settings.instance_lifetime_secs);
        if secs <= 0 {
            return Err(Error::InvalidConfig(format!(
                "lifetime must be positive, got {secs}s"
            )));
        }
        chrono::Duration::try_seconds(secs)
            .ok_or_else(|| Error::InvalidConfig(format!("lifetime out of range: {secs}s")))
    }

    /// Reject unusable configurations before anything is touched.
    fn plan<'a>(
        &self,
        key: InstanceKey,
        config: &'a DeploymentConfig,
        exposure: Exposure,
        internal_port: Option<u16>,
    ) -> Result<LaunchPlan<'a>> {
        match config.deploy_type {
            DeployType::Normal => {
                return Err(Error::InvalidConfig(
                    "challenge is not instanced".to_string(),
                ));
            }
            DeployType::Container => {
                if config.image.as_deref().is_none_or(|i| i.trim().is_empty()) {
                    return Err(Error::InvalidConfig("missing image".to_string()));
                }
                if !exposure.is_isolated() && internal_port.is_none() {
                    return Err(Error::InvalidConfig("missing internal port".to_string()));
                }
            }
            DeployType::Compose => {
                if config.compose.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(Error::InvalidConfig(
                        "missing compose definition".to_string(),
                    ));
                }
            }
        }

        let limits = ResourceLimits {
            memory_mb: config.max_memory_mb.unwrap_or(self.settings.max_memory_mb),
            cpu_cores: config.max_cpu_cores.unwrap_or(self.settings.max_cpu_cores),
        };
        if limits.memory_mb == 0 {
            return Err(Error::InvalidConfig("memory cap must be positive".to_string()));
        }
        if !(limits.cpu_cores.is_finite() && limits.cpu_cores > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "cpu cap must be positive, got {}",
                limits.cpu_cores
            )));
        }

        Ok(LaunchPlan {
            key,
            config,
            exposure,
            internal_port,
            limits,
        })
    }

    async fn launch(&self, plan: &LaunchPlan<'_>) -> Result<Executor> {
        if let Some(network) = plan.exposure.network() {
            self.networks.ensure_network(network).await?;
        }

        let executor = match plan.config.deploy_type {
            DeployType::Container => {
                let spec = container_spec(plan)?;
                Executor::Container(self.containers.create_container(&spec).await?)
            }
            DeployType::Compose => {
                let spec = stack_spec(plan)?;
                Executor::Stack(self.stacks.up(&spec).await?)
            }
            DeployType::Normal => {
                return Err(Error::InvalidConfig(
                    "challenge is not instanced".to_string(),
                ));
            }
        };

        Ok(executor)
    }

    async fn teardown(&self, key: InstanceKey, executor: &Executor, isolated: bool) -> Result<()> {
        match executor {
            Executor::Container(id) => self.containers.remove_container(id).await?,
            Executor::Stack(project) => self.stacks.down(project).await?,
        }

        if isolated {
            self.networks.remove_network(&key.network_name()).await?;
        }

        info!(
            team_id = key.team_id,
            challenge_id = key.challenge_id,
            executor_kind = executor.kind(),
            executor_id = %executor.id(),
            "Instance torn down"
        );
        Ok(())
    }
}

/// Environment every workload receives, on top of the challenge's own.
fn instance_env(plan: &LaunchPlan<'_>) -> BTreeMap<String, String> {
    let mut env = plan.config.env.clone();
    env.insert(
        "INSTANCE_HOST".to_string(),
        plan.exposure.host().to_string(),
    );
    if let Some(port) = plan.exposure.port() {
        env.insert("INSTANCE_PORT".to_string(), port.to_string());
    }
    env
}

fn container_name(plan: &LaunchPlan<'_>) -> String {
    plan.key
        .container_name(plan.exposure.host(), plan.exposure.is_isolated())
}

fn container_spec(plan: &LaunchPlan<'_>) -> Result<ContainerSpec> {
    let image = plan
        .config
        .image
        .clone()
        .ok_or_else(|| Error::InvalidConfig("missing image".to_string()))?;
    let name = container_name(plan);

    let (hostname, domainname, port) = match &plan.exposure {
        Exposure::FixedPort { host, port } => {
            let internal = plan
                .internal_port
                .ok_or_else(|| Error::InvalidConfig("missing internal port".to_string()))?;
            (
                port.to_string(),
                host.clone(),
                Some(PortMapping {
                    internal,
                    external: *port,
                }),
            )
        }
        Exposure::Isolated { host, .. } => {
            let (label, domain) = host.split_once('.').unwrap_or((host.as_str(), ""));
            (label.to_string(), domain.to_string(), None)
        }
    };

    let labels = if plan.exposure.is_isolated() {
        routing_labels(&name, plan.exposure.host(), plan.internal_port)
    } else {
        HashMap::new()
    };

    Ok(ContainerSpec {
        name,
        image,
        hostname,
        domainname,
        env: instance_env(plan)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect(),
        labels,
        network: plan.exposure.network().map(str::to_string),
        port,
        limits: plan.limits,
    })
}

fn stack_spec(plan: &LaunchPlan<'_>) -> Result<StackSpec> {
    let definition = plan
        .config
        .compose
        .clone()
        .ok_or_else(|| Error::InvalidConfig("missing compose definition".to_string()))?;

    let mut env = instance_env(plan);
    env.insert("MAX_MEMORY".to_string(), plan.limits.memory_mb.to_string());
    env.insert("MAX_CPUS".to_string(), plan.limits.cpu_cores.to_string());
    env.insert("CONTAINER_NAME".to_string(), container_name(plan));

    Ok(StackSpec {
        project: plan.key.stack_project(),
        definition,
        env,
        network: plan.exposure.network().map(str::to_string),
    })
}

/// Reverse-proxy routing labels for an isolated container.
pub fn routing_labels(
    router: &str,
    host: &str,
    internal_port: Option<u16>,
) -> HashMap<String, String> {
    let port = internal_port.unwrap_or(DEFAULT_ROUTED_PORT);
    HashMap::from([
        ("traefik.enable".to_string(), "true".to_string()),
        (
            format!("traefik.http.routers.{router}.rule"),
            format!("Host(`{host}`)"),
        ),
        (
            format!("traefik.http.services.{router}.loadbalancer.server.port"),
            port.to_string(),
        ),
        (
            format!("traefik.http.routers.{router}.entrypoints"),
            "web".to_string(),
        ),
        (
            format!("traefik.http.routers.{router}.priority"),
            "10".to_string(),
        ),
    ])
}
