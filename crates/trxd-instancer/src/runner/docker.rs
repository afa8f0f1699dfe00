// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runner for single-container instances.
//!
//! Talks to the engine through bollard. Container creation is effectively
//! idempotent: when the deterministic name is already taken, the existing
//! container is adopted and joined to the target network.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::ConnectNetworkOptions;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::traits::*;

/// Docker engine runner.
///
/// Implements [`ContainerBackend`] here and [`NetworkBackend`] in
/// `runner::network`.
#[derive(Clone)]
pub struct DockerRunner {
    pub(super) client: Docker,
    /// Reverse proxy joined to every isolated network.
    pub(super) proxy_container: Option<String>,
}

impl DockerRunner {
    /// Connect using the environment's defaults (`DOCKER_HOST` or the local
    /// socket) and verify the engine answers.
    pub async fn connect(proxy_container: Option<String>) -> Result<Self> {
        let client = Docker::connect_with_defaults()?;
        client.ping().await?;
        Ok(Self::with_client(client, proxy_container))
    }

    /// Wrap an existing client.
    pub fn with_client(client: Docker, proxy_container: Option<String>) -> Self {
        Self {
            client,
            proxy_container,
        }
    }

    /// Id of the container named exactly `name`, stopped ones included.
    pub(super) async fn find_container(&self, name: &str) -> Result<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let wanted = format!("/{name}");
        let id = self
            .client
            .list_containers(Some(options))
            .await?
            .into_iter()
            .find(|c| {
                c.names
                    .as_ref()
                    .is_some_and(|names| names.iter().any(|n| *n == wanted || n == name))
            })
            .and_then(|c| c.id);

        Ok(id)
    }

    /// Attach `container` to `network`. Already attached is success.
    pub(super) async fn join_network(&self, network: &str, container: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: Default::default(),
        };

        match self.client.connect_network(network, options).await {
            Ok(()) => Ok(()),
            Err(e) if already_joined(&e) => {
                debug!(network, container, "Container already attached to network");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Build the engine descriptor for a container spec.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();

    if let Some(port) = spec.port {
        let container_port = format!("{}/tcp", port.internal);
        exposed_ports.insert(container_port.clone(), HashMap::new());
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.external.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            ..Default::default()
        }),
        memory: Some(spec.limits.memory_bytes()),
        nano_cpus: Some(spec.limits.nano_cpus()),
        network_mode: spec.network.clone(),
        ..Default::default()
    };

    Config {
        hostname: Some(spec.hostname.clone()),
        domainname: Some(spec.domainname.clone()),
        env: Some(spec.env.clone()),
        image: Some(spec.image.clone()),
        labels: if spec.labels.is_empty() {
            None
        } else {
            Some(spec.labels.clone())
        },
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Engine error status code, if the daemon answered.
pub(super) fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

/// True if the daemon's error message contains `needle`.
pub(super) fn message_contains(err: &bollard::errors::Error, needle: &str) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            message.contains(needle)
        }
        _ => false,
    }
}

/// Create failed because the name is taken; the existing container is adopted.
pub(super) fn adopt_on_create(err: &bollard::errors::Error) -> bool {
    status_code(err) == Some(409) || message_contains(err, "is already in use")
}

/// Connect failed only because the container is already on the network.
pub(super) fn already_joined(err: &bollard::errors::Error) -> bool {
    message_contains(err, "already exists in network")
}

/// Remove failed only because the container is already gone.
pub(super) fn already_removed(err: &bollard::errors::Error) -> bool {
    status_code(err) == Some(404) || message_contains(err, "No such container")
}

#[async_trait]
impl ContainerBackend for DockerRunner {
    fn runner_type(&self) -> &'static str {
        "docker"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!(container = %spec.name, image = %spec.image, "Creating container");

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let id = match self
            .client
            .create_container(Some(options), container_config(spec))
            .await
        {
            Ok(created) => created.id,
            Err(e) if adopt_on_create(&e) => {
                warn!(container = %spec.name, "Container name in use, adopting existing container");

                let id = self
                    .find_container(&spec.name)
                    .await?
                    .ok_or_else(|| RunnerError::NameConflict(spec.name.clone()))?;

                if let Some(network) = &spec.network {
                    self.join_network(network, &id).await?;
                }
                id
            }
            Err(e) => return Err(e.into()),
        };

        self.client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await?;

        info!(container = %spec.name, container_id = %id, "Container started");
        Ok(id)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        info!(container_id = %id, "Removing container");

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if already_removed(&e) => {
                debug!(container_id = %id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "chall_3_7".to_string(),
            image: "ghcr.io/ctf/pwn:latest".to_string(),
            hostname: "31337".to_string(),
            domainname: "pwn.ctf.example".to_string(),
            env: vec!["INSTANCE_HOST=pwn.ctf.example".to_string()],
            labels: HashMap::new(),
            network: None,
            port: Some(PortMapping {
                internal: 1337,
                external: 31337,
            }),
            limits: ResourceLimits {
                memory_mb: 256,
                cpu_cores: 0.5,
            },
        }
    }

    #[test]
    fn test_fixed_port_config() {
        let config = container_config(&spec());
        let host = config.host_config.unwrap();

        assert_eq!(config.image.as_deref(), Some("ghcr.io/ctf/pwn:latest"));
        assert!(config.exposed_ports.unwrap().contains_key("1337/tcp"));
        let bindings = host.port_bindings.unwrap();
        let binding = &bindings["1337/tcp"].as_ref().unwrap()[0];
        assert_eq!(binding.host_port.as_deref(), Some("31337"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::ALWAYS)
        );
        assert_eq!(host.network_mode, None);
        assert!(config.labels.is_none());
    }

    #[test]
    fn test_isolated_config() {
        let mut spec = spec();
        spec.port = None;
        spec.network = Some("net_3_7".to_string());
        spec.labels
            .insert("traefik.enable".to_string(), "true".to_string());

        let config = container_config(&spec);
        assert!(config.exposed_ports.is_none());
        assert_eq!(
            config.labels.unwrap().get("traefik.enable").map(String::as_str),
            Some("true")
        );
        let host = config.host_config.unwrap();
        assert!(host.port_bindings.is_none());
        assert_eq!(host.network_mode.as_deref(), Some("net_3_7"));
    }

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_error_classification() {
        let conflict = server_error(409, "Conflict. The container name \"/chall_3_7\" is already in use");
        assert_eq!(status_code(&conflict), Some(409));
        assert!(message_contains(&conflict, "is already in use"));
        assert!(!message_contains(&conflict, "No such container"));
    }

    #[test]
    fn test_create_conflict_adopts() {
        let cases = [
            (server_error(409, "Conflict"), true),
            (server_error(500, "name \"/chall_ab\" is already in use"), true),
            (server_error(500, "image not found"), false),
            (server_error(404, "No such image: web"), false),
        ];
        for (err, expected) in cases {
            assert_eq!(adopt_on_create(&err), expected, "{err}");
        }
    }

    #[test]
    fn test_join_tolerates_existing_endpoint() {
        let cases = [
            (
                server_error(403, "endpoint with name chall_ab already exists in network net_3_7"),
                true,
            ),
            (server_error(404, "network net_3_7 not found"), false),
            (server_error(500, "is not connected"), false),
        ];
        for (err, expected) in cases {
            assert_eq!(already_joined(&err), expected, "{err}");
        }
    }

    #[test]
    fn test_remove_tolerates_missing_container() {
        let cases = [
            (server_error(404, "page not found"), true),
            (server_error(500, "No such container: f00d"), true),
            (server_error(409, "removal of container f00d is already in progress"), false),
            (server_error(500, "driver failed"), false),
        ];
        for (err, expected) in cases {
            assert_eq!(already_removed(&err), expected, "{err}");
        }
    }
}
