// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! trxd Instancer - Challenge Instance Lifecycle Management
//!
//! This crate creates, tracks, renews, tears down and automatically reclaims
//! per-team deployments of CTF challenges: a single container or a compose
//! stack, either published on a fixed port or isolated on its own network
//! behind the platform's reverse proxy, with a bounded lifetime.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    HTTP layer (validation, auth)                         │
//! │         supplies team / challenge / DeploymentConfig                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    trxd-instancer (This Crate)                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Instancer  │  │  Exposure   │  │   Reclaim   │  │   Runners   │     │
//! │  │ (create/del)│  │   Policy    │  │  Scheduler  │  │ docker/comp │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                                │
//!           ▼                                                ▼
//! ┌───────────────────────────┐          ┌──────────────────────────────────┐
//! │        PostgreSQL         │          │          Docker engine           │
//! │   (instances, configs)    │          │ containers, stacks, networks,    │
//! └───────────────────────────┘          │ reverse proxy (<project>-nginx-1)│
//!                                        └──────────────────────────────────┘
//! ```
//!
//! # Instance Lifecycle
//!
//! ```text
//!   create_instance ──► ┌─────────┐  executor started   ┌─────────┐
//!                       │ PENDING │ ──────────────────► │ RUNNING │
//!                       └────┬────┘                     └────┬────┘
//!          launch failed:    │                               │ delete_instance
//!          kept until expiry │                               │ (teardown, then row)
//!                            ▼                               ▼
//!                     reclaim scheduler ─────────────► row deleted
//! ```
//!
//! The (team_id, challenge_id) primary key is the only mutual exclusion for
//! creation. Concurrent creates for one pair race at the database; exactly one
//! wins and the rest get [`Error::AlreadyActive`] or [`Error::Race`].
//!
//! # Configuration
//!
//! Process configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TRXD_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `TRXD_DATA_DIR` | No | `.data` | Rendered compose projects |
//! | `TRXD_COMPOSE_BIN` | No | `docker` | Binary providing `compose` |
//! | `TRXD_DB_MAX_CONNECTIONS` | No | `10` | Connection pool size |
//!
//! Runtime settings are read from the `configs` table:
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | `reclaim-instance-interval` | `300` | Idle reclaim interval (seconds) |
//! | `instance-lifetime` | `1800` | Default lifetime (seconds) |
//! | `instance-max-memory` | `512` | Default memory cap (MB) |
//! | `instance-max-cpu` | `1.0` | Default CPU cap (cores) |
//! | `hash-len` | `12` | Hashed subdomain label length |
//! | `project-name` | `trxd` | Platform project; proxy is `<name>-nginx-1` |
//!
//! # Modules
//!
//! - [`config`]: Process configuration from environment variables
//! - [`settings`]: Runtime settings from the key/value store
//! - [`error`]: Error types for instancer operations
//! - [`instance`]: Instance model and resource naming
//! - [`exposure`]: Fixed-port vs isolated exposure policy
//! - [`persistence`]: Instance and settings stores
//! - [`runner`]: Container engine backends
//! - [`instancer`]: Create/delete/renew orchestration
//! - [`reclaim_scheduler`]: Expiry-driven reclamation
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Process configuration loaded from environment variables.
pub mod config;

/// Runtime settings from the key/value configuration store.
pub mod settings;

/// Error types for instancer operations.
pub mod error;

/// Wall-clock sources.
pub mod clock;

/// Instance model and deterministic resource naming.
pub mod instance;

/// Exposure policy and hostname generation.
pub mod exposure;

/// Instance and settings persistence (PostgreSQL, in-memory).
pub mod persistence;

/// Container engine backends (Docker, compose, mock).
pub mod runner;

/// Instance create/delete/renew orchestration.
pub mod instancer;

/// Background reclamation of expired instances.
pub mod reclaim_scheduler;

/// Embeddable runtime for trxd-instancer.
pub mod runtime;

pub use config::Config;
pub use error::Error;
pub use instance::{
    ChallengeEndpoint, CreatedInstance, DeployType, DeploymentConfig, Executor, Instance,
    InstanceKey, InstanceState,
};
pub use instancer::Instancer;
pub use settings::Settings;
