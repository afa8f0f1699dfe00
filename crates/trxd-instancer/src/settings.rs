// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime settings read from the key/value configuration store.
//!
//! Absent keys fall back to the `DEFAULT_*` constants. A key that is present
//! but does not parse is a [`ConfigError::InvalidValue`].

use std::str::FromStr;
use std::time::Duration;

use crate::config::ConfigError;
use crate::persistence::ConfigStore;

/// Seconds between reclaim checks when nothing is due.
pub const RECLAIM_INTERVAL_KEY: &str = "reclaim-instance-interval";
/// Default instance lifetime in seconds.
pub const INSTANCE_LIFETIME_KEY: &str = "instance-lifetime";
/// Default memory cap in megabytes.
pub const MAX_MEMORY_KEY: &str = "instance-max-memory";
/// Default CPU cap in cores.
pub const MAX_CPU_KEY: &str = "instance-max-cpu";
/// Hex characters of the hashed subdomain label.
pub const HASH_LEN_KEY: &str = "hash-len";
/// Compose project of the platform itself, used to find the proxy container.
pub const PROJECT_NAME_KEY: &str = "project-name";

/// Default reclaim interval (5 minutes).
pub const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 300;
/// Default instance lifetime (30 minutes).
pub const DEFAULT_INSTANCE_LIFETIME_SECS: i64 = 1800;
/// Default memory cap.
pub const DEFAULT_MAX_MEMORY_MB: u32 = 512;
/// Default CPU cap.
pub const DEFAULT_MAX_CPU_CORES: f64 = 1.0;
/// Default hashed label length.
pub const DEFAULT_HASH_LEN: usize = 12;
/// Default platform project name.
pub const DEFAULT_PROJECT_NAME: &str = "trxd";

/// Instancer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Reclaim scheduler idle interval.
    pub reclaim_interval: Duration,
    /// Lifetime used when a challenge sets none.
    pub instance_lifetime_secs: i64,
    /// Memory cap used when a challenge sets none.
    pub max_memory_mb: u32,
    /// CPU cap used when a challenge sets none.
    pub max_cpu_cores: f64,
    /// Hashed subdomain label length.
    pub hash_len: usize,
    /// Platform compose project name.
    pub project_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reclaim_interval: Duration::from_secs(DEFAULT_RECLAIM_INTERVAL_SECS),
            instance_lifetime_secs: DEFAULT_INSTANCE_LIFETIME_SECS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_cpu_cores: DEFAULT_MAX_CPU_CORES,
            hash_len: DEFAULT_HASH_LEN,
            project_name: DEFAULT_PROJECT_NAME.to_string(),
        }
    }
}

impl Settings {
    /// Load every setting.
    pub async fn load(store: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let reclaim_interval = reclaim_interval(store).await?;

        let instance_lifetime_secs: i64 =
            read(store, INSTANCE_LIFETIME_KEY, DEFAULT_INSTANCE_LIFETIME_SECS).await?;
        if instance_lifetime_secs <= 0 {
            return Err(invalid(INSTANCE_LIFETIME_KEY, instance_lifetime_secs));
        }

        let max_memory_mb: u32 = read(store, MAX_MEMORY_KEY, DEFAULT_MAX_MEMORY_MB).await?;
        if max_memory_mb == 0 {
            return Err(invalid(MAX_MEMORY_KEY, max_memory_mb));
        }

        let max_cpu_cores: f64 = read(store, MAX_CPU_KEY, DEFAULT_MAX_CPU_CORES).await?;
        if !(max_cpu_cores.is_finite() && max_cpu_cores > 0.0) {
            return Err(invalid(MAX_CPU_KEY, max_cpu_cores));
        }

        let hash_len: usize = read(store, HASH_LEN_KEY, DEFAULT_HASH_LEN).await?;
        if !(1..=64).contains(&hash_len) {
            return Err(invalid(HASH_LEN_KEY, hash_len));
        }

        let project_name: String =
            read(store, PROJECT_NAME_KEY, DEFAULT_PROJECT_NAME.to_string()).await?;

        Ok(Self {
            reclaim_interval,
            instance_lifetime_secs,
            max_memory_mb,
            max_cpu_cores,
            hash_len,
            project_name,
        })
    }

    /// Name of the reverse-proxy container joined to isolated networks.
    pub fn proxy_container(&self) -> String {
        format!("{}-nginx-1", self.project_name)
    }
}

/// Read only the reclaim interval.
pub async fn reclaim_interval(store: &dyn ConfigStore) -> Result<Duration, ConfigError> {
    let secs: u64 = read(store, RECLAIM_INTERVAL_KEY, DEFAULT_RECLAIM_INTERVAL_SECS).await?;
    if secs == 0 {
        return Err(invalid(RECLAIM_INTERVAL_KEY, secs));
    }
    Ok(Duration::from_secs(secs))
}

async fn read<T: FromStr>(store: &dyn ConfigStore, key: &str, default: T) -> Result<T, ConfigError> {
    match store.get_config(key).await? {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
