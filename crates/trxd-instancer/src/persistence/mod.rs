// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for trxd-instancer.
//!
//! The instance table's primary key on (team_id, challenge_id) is the only
//! mutual exclusion used for creation: [`InstanceStore::insert_pending`]
//! reports a uniqueness violation as [`StoreError::AlreadyExists`] and never
//! retries.

pub mod memory;
pub mod postgres;

pub use self::memory::{MemoryConfigStore, MemoryStore};
pub use self::postgres::{PgConfigStore, PgInstanceStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::instance::{Executor, Instance, InstanceKey};

/// Errors from persistence operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Insert collided with an existing row for the same key.
    #[error("Row already exists")]
    AlreadyExists,

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row cannot be mapped back to the model.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The backing store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage for instance rows.
///
/// Updates and deletes against a missing key succeed without effect.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a pending row. Fails with [`StoreError::AlreadyExists`] if the
    /// pair already has one.
    async fn insert_pending(
        &self,
        key: InstanceKey,
        expires_at: DateTime<Utc>,
        host: &str,
        port: Option<u16>,
    ) -> Result<()>;

    /// Fetch one instance.
    async fn get(&self, key: InstanceKey) -> Result<Option<Instance>>;

    /// Record the backing resource, moving the row to running.
    async fn attach_executor(&self, key: InstanceKey, executor: &Executor) -> Result<()>;

    /// Set a new expiry.
    async fn update_expiry(&self, key: InstanceKey, expires_at: DateTime<Utc>) -> Result<()>;

    /// Remove the row.
    async fn delete(&self, key: InstanceKey) -> Result<()>;

    /// The row with the earliest `expires_at` across all pairs.
    async fn next_to_expire(&self) -> Result<Option<Instance>>;
}

/// Key/value runtime settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Raw value for `key`, if set.
    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace `key`.
    async fn set_config(&self, key: &str, value: &str) -> Result<()>;
}
