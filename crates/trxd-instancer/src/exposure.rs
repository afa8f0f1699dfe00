// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exposure policy: how a team reaches its instance.
//!
//! - Fixed-port: `hash_domain` is off and the challenge declares a port. The
//!   instance reuses the challenge's host and port; routing is pre-provisioned.
//! - Isolated: otherwise. The instance gets a private network and a per-team
//!   hostname under the challenge host; the reverse proxy routes to it.

use sha2::{Digest, Sha256};

use crate::instance::{ChallengeEndpoint, InstanceKey};
use crate::settings::DEFAULT_HASH_LEN;

/// Produces the per-team hostname for isolated instances.
pub trait HostnamePolicy: Send + Sync {
    /// Hostname for `key` under the challenge's `base_host`.
    fn hostname(&self, key: InstanceKey, base_host: &str) -> String;
}

/// `<hex(sha256(challenge:team))[..len]>.<base_host>`.
///
/// The label differs per team and the suffix is the challenge host, so the
/// challenge part of the name stays constant.
#[derive(Debug, Clone)]
pub struct HashedSubdomain {
    hash_len: usize,
}

impl HashedSubdomain {
    /// Label of `hash_len` hex characters, clamped to 1..=64.
    pub fn new(hash_len: usize) -> Self {
        Self {
            hash_len: hash_len.clamp(1, 64),
        }
    }

    /// The subdomain label alone.
    pub fn label(&self, key: InstanceKey) -> String {
        let digest = Sha256::digest(format!("{}:{}", key.challenge_id, key.team_id).as_bytes());
        let mut label = hex::encode(digest);
        label.truncate(self.hash_len);
        label
    }
}

impl Default for HashedSubdomain {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_LEN)
    }
}

impl HostnamePolicy for HashedSubdomain {
    fn hostname(&self, key: InstanceKey, base_host: &str) -> String {
        let label = self.label(key);
        if base_host.is_empty() {
            label
        } else {
            format!("{label}.{base_host}")
        }
    }
}

/// Resolved exposure for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exposure {
    /// Challenge host and pre-assigned port; no network.
    FixedPort {
        /// Challenge host.
        host: String,
        /// Public port.
        port: u16,
    },
    /// Generated host on a private network.
    Isolated {
        /// Per-team hostname.
        host: String,
        /// Network name.
        network: String,
    },
}

impl Exposure {
    /// Host handed to the team.
    pub fn host(&self) -> &str {
        match self {
            Exposure::FixedPort { host, .. } | Exposure::Isolated { host, .. } => host,
        }
    }

    /// Public port, fixed-port mode only.
    pub fn port(&self) -> Option<u16> {
        match self {
            Exposure::FixedPort { port, .. } => Some(*port),
            Exposure::Isolated { .. } => None,
        }
    }

    /// Network to allocate, isolated mode only.
    pub fn network(&self) -> Option<&str> {
        match self {
            Exposure::FixedPort { .. } => None,
            Exposure::Isolated { network, .. } => Some(network),
        }
    }

    /// True for isolated (proxy-routed) instances.
    pub fn is_isolated(&self) -> bool {
        matches!(self, Exposure::Isolated { .. })
    }
}

/// Pick the exposure for `key`. Pure; allocates nothing.
pub fn resolve_exposure(
    key: InstanceKey,
    hash_domain: bool,
    endpoint: &ChallengeEndpoint,
    policy: &dyn HostnamePolicy,
) -> Exposure {
    match endpoint.port {
        Some(port) if !hash_domain => Exposure::FixedPort {
            host: endpoint.host.clone(),
            port,
        },
        _ => Exposure::Isolated {
            host: policy.hostname(key, &endpoint.host),
            network: key.network_name(),
        },
    }
}
