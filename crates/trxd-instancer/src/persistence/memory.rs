// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory stores for testing and embedding.
//!
//! Same semantics as the PostgreSQL stores, including the uniqueness check on
//! insert. Either store can be switched to an unavailable mode to simulate a
//! database outage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::{ConfigStore, InstanceStore, Result, StoreError};
use crate::instance::{Executor, Instance, InstanceKey, InstanceState};

/// In-memory [`InstanceStore`].
#[derive(Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<HashMap<InstanceKey, Instance>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    /// True if no rows are stored.
    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_pending(
        &self,
        key: InstanceKey,
        expires_at: DateTime<Utc>,
        host: &str,
        port: Option<u16>,
    ) -> Result<()> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        rows.insert(
            key,
            Instance {
                key,
                expires_at,
                host: host.to_string(),
                port,
                state: InstanceState::Pending,
            },
        );
        Ok(())
    }

    async fn get(&self, key: InstanceKey) -> Result<Option<Instance>> {
        self.check()?;
        Ok(self.rows.lock().await.get(&key).cloned())
    }

    async fn attach_executor(&self, key: InstanceKey, executor: &Executor) -> Result<()> {
        self.check()?;
        if let Some(row) = self.rows.lock().await.get_mut(&key) {
            row.state = InstanceState::Running(executor.clone());
        }
        Ok(())
    }

    async fn update_expiry(&self, key: InstanceKey, expires_at: DateTime<Utc>) -> Result<()> {
        self.check()?;
        if let Some(row) = self.rows.lock().await.get_mut(&key) {
            row.expires_at = expires_at;
        }
        Ok(())
    }

    async fn delete(&self, key: InstanceKey) -> Result<()> {
        self.check()?;
        self.rows.lock().await.remove(&key);
        Ok(())
    }

    async fn next_to_expire(&self) -> Result<Option<Instance>> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .min_by_key(|row| (row.expires_at, row.key))
            .cloned())
    }
}

/// In-memory [`ConfigStore`].
#[derive(Default)]
pub struct MemoryConfigStore {
    values: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `pairs`.
    pub fn with_values<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: Mutex::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory config store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
