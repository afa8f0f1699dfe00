// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! Defines the abstract interface to the container engine: single containers,
//! compose stacks, and per-instance networks.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Docker engine API call failed.
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// `docker compose` exited unsuccessfully.
    #[error("Compose {action} failed for {project} (exit {status:?}): {stderr}")]
    Compose {
        /// Compose subcommand (`up`, `down`).
        action: &'static str,
        /// Project name.
        project: String,
        /// Exit code, if the process was not killed by a signal.
        status: Option<i32>,
        /// Standard error output.
        stderr: String,
    },

    /// A container with this name exists but could not be located.
    #[error("Container name in use but not found: {0}")]
    NameConflict(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Fixed host port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Port the service listens on inside the container.
    pub internal: u16,
    /// Port published on the host.
    pub external: u16,
}

/// Resource caps applied to a workload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// Memory cap in megabytes.
    pub memory_mb: u32,
    /// CPU cap in (fractional) cores.
    pub cpu_cores: f64,
}

impl ResourceLimits {
    /// Memory in bytes.
    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_mb) * 1024 * 1024
    }

    /// CPU in engine nano-CPUs.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1e9) as i64
    }
}

/// Fully resolved single-container deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Deterministic container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Container hostname.
    pub hostname: String,
    /// Container domain name.
    pub domainname: String,
    /// Environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Container labels (proxy routing).
    pub labels: HashMap<String, String>,
    /// Isolated network to join.
    pub network: Option<String>,
    /// Published port, fixed-port mode only.
    pub port: Option<PortMapping>,
    /// Memory and CPU caps.
    pub limits: ResourceLimits,
}

/// Fully resolved compose deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSpec {
    /// Compose project name.
    pub project: String,
    /// Compose file contents.
    pub definition: String,
    /// Variables available to interpolation.
    pub env: BTreeMap<String, String>,
    /// External network used as the project's default network.
    pub network: Option<String>,
}

/// Single-container executor.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Get the backend type name.
    fn runner_type(&self) -> &'static str;

    /// Create (or adopt on a name conflict) and start a container.
    /// Returns the engine's container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Force-remove a container. An already removed container is success.
    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// Compose stack executor.
#[async_trait]
pub trait StackBackend: Send + Sync {
    /// Get the backend type name.
    fn runner_type(&self) -> &'static str;

    /// Bring the project up. Returns the project name.
    async fn up(&self, spec: &StackSpec) -> Result<String>;

    /// Tear the project down. An unknown project is success.
    async fn down(&self, project: &str) -> Result<()>;
}

/// Per-instance network allocation.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Create the network if missing and attach the reverse proxy to it.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Detach the proxy and delete the network. A missing network is success.
    async fn remove_network(&self, name: &str) -> Result<()>;
}
