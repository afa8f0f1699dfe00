// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance isolated networks.
//!
//! Networks are internal (no outbound route) and looked up by name, so a
//! network left over from an earlier attempt is reused. The reverse proxy
//! container joins each network on creation and leaves it on removal.

use async_trait::async_trait;
use bollard::network::{CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::docker::{DockerRunner, message_contains, status_code};
use super::traits::*;

impl DockerRunner {
    /// True if a network named exactly `name` exists.
    async fn network_exists(&self, name: &str) -> Result<bool> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let networks = self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;

        Ok(networks
            .iter()
            .any(|n| n.name.as_deref() == Some(name)))
    }

    /// Id of the reverse proxy container, if configured and present.
    async fn proxy_id(&self) -> Result<Option<String>> {
        match &self.proxy_container {
            Some(name) => self.find_container(name).await,
            None => Ok(None),
        }
    }
}

/// Detach failed only because the proxy is not on the network.
fn tolerated_disconnect(err: &bollard::errors::Error) -> bool {
    message_contains(err, "is not connected") || message_contains(err, "not found")
}

/// Remove failed only because the network is already gone.
fn network_gone(err: &bollard::errors::Error) -> bool {
    status_code(err) == Some(404)
}

#[async_trait]
impl NetworkBackend for DockerRunner {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        if self.network_exists(name).await? {
            debug!(network = %name, "Reusing existing network");
        } else {
            info!(network = %name, "Creating network");
            let options = CreateNetworkOptions {
                name: name.to_string(),
                internal: true,
                ..Default::default()
            };
            self.client.create_network(options).await?;
        }

        let Some(proxy) = &self.proxy_container else {
            return Ok(());
        };

        let proxy_id = self.proxy_id().await?.ok_or_else(|| {
            RunnerError::Other(format!("proxy container {proxy} not found"))
        })?;

        self.join_network(name, &proxy_id).await?;
        debug!(network = %name, proxy = %proxy, "Proxy attached to network");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        if !self.network_exists(name).await? {
            debug!(network = %name, "Network already removed");
            return Ok(());
        }

        match self.proxy_id().await? {
            Some(proxy_id) => {
                let options = DisconnectNetworkOptions {
                    container: proxy_id,
                    force: true,
                };
                match self.client.disconnect_network(name, options).await {
                    Ok(()) => {}
                    Err(e) if tolerated_disconnect(&e) => {
                        debug!(network = %name, "Proxy was not attached to network");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                if let Some(proxy) = &self.proxy_container {
                    warn!(network = %name, proxy = %proxy, "Proxy container not found, skipping detach");
                }
            }
        }

        info!(network = %name, "Removing network");
        match self.client.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(e) if network_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
