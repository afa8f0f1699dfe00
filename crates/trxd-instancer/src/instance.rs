// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance model and deterministic resource naming.
//!
//! An instance is one team's copy of one challenge. It is either pending
//! (row inserted, nothing launched yet) or running on a container or stack.
//! Every engine-side name is derived from the (team, challenge) pair so a
//! restarted process can find resources it created earlier.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Owning team.
    pub team_id: i32,
    /// Instanced challenge.
    pub challenge_id: i32,
}

impl InstanceKey {
    /// Build a key from team and challenge identifiers.
    pub fn new(team_id: i32, challenge_id: i32) -> Self {
        Self {
            team_id,
            challenge_id,
        }
    }

    /// Name of the isolated network for this pair.
    pub fn network_name(&self) -> String {
        format!("net_{}_{}", self.challenge_id, self.team_id)
    }

    /// Compose project name for this pair.
    pub fn stack_project(&self) -> String {
        format!("chall_{}_{}", self.challenge_id, self.team_id)
    }

    /// Container name for this pair.
    ///
    /// Hashed hosts name the container after the first host label, which is
    /// also what the proxy routes on. Fixed-port instances use the pair.
    pub fn container_name(&self, host: &str, hashed: bool) -> String {
        match host.split('.').next() {
            Some(label) if hashed && !label.is_empty() => format!("chall_{label}"),
            _ => format!("chall_{}_{}", self.challenge_id, self.team_id),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "team {} / challenge {}", self.team_id, self.challenge_id)
    }
}

/// Engine resource backing a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Executor {
    /// A single container, by engine id.
    Container(String),
    /// A compose stack, by project name.
    Stack(String),
}

impl Executor {
    /// Value stored in the `executor_kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Executor::Container(_) => "container",
            Executor::Stack(_) => "stack",
        }
    }

    /// Container id or project name.
    pub fn id(&self) -> &str {
        match self {
            Executor::Container(id) | Executor::Stack(id) => id,
        }
    }

    /// Rebuild from the persisted `(executor_kind, executor_id)` pair.
    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "container" => Some(Executor::Container(id)),
            "stack" => Some(Executor::Stack(id)),
            _ => None,
        }
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Row exists, nothing launched.
    Pending,
    /// Backing resource started.
    Running(Executor),
}

/// A tracked instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// (team, challenge) pair.
    pub key: InstanceKey,
    /// Reclamation deadline.
    pub expires_at: DateTime<Utc>,
    /// Host handed to the team.
    pub host: String,
    /// External port, fixed-port mode only.
    pub port: Option<u16>,
    /// Pending or running.
    pub state: InstanceState,
}

impl Instance {
    /// True if no resource has been launched yet.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, InstanceState::Pending)
    }

    /// Backing resource, if running.
    pub fn executor(&self) -> Option<&Executor> {
        match &self.state {
            InstanceState::Pending => None,
            InstanceState::Running(executor) => Some(executor),
        }
    }

    /// True once `expires_at` is not in the future.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds until expiry, clamped at zero.
    pub fn timeout_secs(&self, now: DateTime<Utc>) -> i64 {
        timeout_secs(self.expires_at, now)
    }
}

pub(crate) fn timeout_secs(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_seconds().max(0)
}

/// How a challenge is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployType {
    /// Static challenge, never instanced.
    Normal,
    /// One container from `image`.
    Container,
    /// A compose project from `compose`.
    Compose,
}

/// Per-challenge deployment parameters. Read-only to the instancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Backend selector.
    pub deploy_type: DeployType,
    /// Image for `Container` deployments.
    #[serde(default)]
    pub image: Option<String>,
    /// Compose definition for `Compose` deployments.
    #[serde(default)]
    pub compose: Option<String>,
    /// Isolated-network exposure with a generated hostname.
    #[serde(default = "default_hash_domain")]
    pub hash_domain: bool,
    /// Instance lifetime; the `instance-lifetime` setting when absent.
    #[serde(default)]
    pub lifetime_seconds: Option<i64>,
    /// Extra environment passed to the workload.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Memory cap; the `instance-max-memory` setting when absent.
    #[serde(default)]
    pub max_memory_mb: Option<u32>,
    /// CPU cap; the `instance-max-cpu` setting when absent.
    #[serde(default)]
    pub max_cpu_cores: Option<f64>,
}

fn default_hash_domain() -> bool {
    true
}

impl DeploymentConfig {
    /// Single-container deployment of `image` with default settings.
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Self::empty(DeployType::Container)
        }
    }

    /// Compose deployment of `definition` with default settings.
    pub fn compose(definition: impl Into<String>) -> Self {
        Self {
            compose: Some(definition.into()),
            ..Self::empty(DeployType::Compose)
        }
    }

    fn empty(deploy_type: DeployType) -> Self {
        Self {
            deploy_type,
            image: None,
            compose: None,
            hash_domain: true,
            lifetime_seconds: None,
            env: BTreeMap::new(),
            max_memory_mb: None,
            max_cpu_cores: None,
        }
    }

    /// Replace `env` with the JSON object form stored alongside challenges.
    /// An empty string clears it.
    pub fn with_env_json(mut self, raw: &str) -> Result<Self, serde_json::Error> {
        self.env = parse_env_json(raw)?;
        Ok(self)
    }
}

/// Parse a `{"KEY": "value"}` environment object. Empty input is no variables.
pub fn parse_env_json(raw: &str) -> Result<BTreeMap<String, String>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw)
}

/// The challenge's statically declared address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChallengeEndpoint {
    /// Base host, e.g. `pwn.ctf.example`.
    pub host: String,
    /// Pre-assigned public port, if any.
    pub port: Option<u16>,
}

impl ChallengeEndpoint {
    /// Endpoint with a host and optional fixed port.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// What `create_instance` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    /// Reachable host.
    pub host: String,
    /// External port, fixed-port mode only.
    pub port: Option<u16>,
    /// Reclamation deadline.
    pub expires_at: DateTime<Utc>,
}

impl CreatedInstance {
    /// Whole seconds until expiry, clamped at zero.
    pub fn timeout_secs(&self, now: DateTime<Utc>) -> i64 {
        timeout_secs(self.expires_at, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_names_are_deterministic() {
        let key = InstanceKey::new(7, 3);
        assert_eq!(key.network_name(), "net_3_7");
        assert_eq!(key.stack_project(), "chall_3_7");
        assert_eq!(key.container_name("pwn.ctf.example", false), "chall_3_7");
        assert_eq!(
            key.container_name("a1b2c3d4e5f6.pwn.ctf.example", true),
            "chall_a1b2c3d4e5f6"
        );
        assert_eq!(key.container_name("", true), "chall_3_7");
    }

    #[test]
    fn test_executor_parts() {
        let exec = Executor::Container("f".repeat(64));
        assert_eq!(exec.kind(), "container");
        assert_eq!(
            Executor::from_parts("container", exec.id().to_string()),
            Some(exec)
        );

        let stack = Executor::Stack("chall_3_7".into());
        assert_eq!(stack.kind(), "stack");
        assert_eq!(stack.id(), "chall_3_7");
        assert_eq!(Executor::from_parts("vm", "x".into()), None);
    }

    #[test]
    fn test_timeout_clamps_at_zero() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let instance = Instance {
            key: InstanceKey::new(1, 1),
            expires_at: now + chrono::Duration::seconds(90),
            host: "h".into(),
            port: None,
            state: InstanceState::Pending,
        };
        assert_eq!(instance.timeout_secs(now), 90);
        assert!(!instance.is_expired(now));

        let later = now + chrono::Duration::seconds(120);
        assert_eq!(instance.timeout_secs(later), 0);
        assert!(instance.is_expired(later));
        assert!(instance.is_pending());
        assert!(instance.executor().is_none());
    }

    #[test]
    fn test_env_json() {
        let config = DeploymentConfig::container("nginx:alpine")
            .with_env_json(r#"{"FLAG": "trx{x}", "MODE": "ctf"}"#)
            .unwrap();
        assert_eq!(config.env.get("FLAG").map(String::as_str), Some("trx{x}"));
        assert_eq!(config.env.len(), 2);

        assert!(parse_env_json("").unwrap().is_empty());
        assert!(parse_env_json("[1, 2]").is_err());
    }

    #[test]
    fn test_deployment_config_deserialize_defaults() {
        let config: DeploymentConfig =
            serde_json::from_str(r#"{"deploy_type": "compose", "compose": "services: {}"}"#)
                .unwrap();
        assert_eq!(config.deploy_type, DeployType::Compose);
        assert!(config.hash_domain);
        assert!(config.env.is_empty());
        assert_eq!(config.lifetime_seconds, None);
    }
}
