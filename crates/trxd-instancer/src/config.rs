// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for trxd-instancer.

use std::path::PathBuf;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Working directory for rendered compose projects
    pub data_dir: PathBuf,
    /// Binary providing the `compose` subcommand
    pub compose_bin: String,
    /// Connection pool size
    pub db_max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TRXD_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("TRXD_DATABASE_URL or DATABASE_URL"))?;

        let data_dir =
            PathBuf::from(std::env::var("TRXD_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let compose_bin =
            std::env::var("TRXD_COMPOSE_BIN").unwrap_or_else(|_| "docker".to_string());

        let db_max_connections = match std::env::var("TRXD_DB_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TRXD_DB_MAX_CONNECTIONS".to_string(),
                value: raw,
            })?,
            Err(_) => 10,
        };

        Ok(Self {
            database_url,
            data_dir,
            compose_bin,
            db_max_connections,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// A setting is present but cannot be parsed.
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable or settings key.
        key: String,
        /// Raw value that failed to parse.
        value: String,
    },

    /// The settings store could not be read.
    #[error("Failed to read settings: {0}")]
    Store(#[from] crate::persistence::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_debug_and_clone() {
        let config = Config {
            database_url: "postgres://localhost/trxd".to_string(),
            data_dir: PathBuf::from("/var/lib/trxd"),
            compose_bin: "podman".to_string(),
            db_max_connections: 4,
        };

        let cloned = config.clone();
        assert_eq!(cloned.database_url, config.database_url);
        assert_eq!(cloned.data_dir, config.data_dir);
        assert_eq!(cloned.compose_bin, "podman");
        assert_eq!(cloned.db_max_connections, 4);

        let debug = format!("{:?}", config);
        assert!(debug.contains("Config"));
        assert!(debug.contains("/var/lib/trxd"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("TRXD_DATABASE_URL or DATABASE_URL");
        assert_eq!(
            err.to_string(),
            "Missing required environment variable: TRXD_DATABASE_URL or DATABASE_URL"
        );

        let err = ConfigError::InvalidValue {
            key: "hash-len".to_string(),
            value: "twelve".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid value for hash-len: \"twelve\"");
    }
}
