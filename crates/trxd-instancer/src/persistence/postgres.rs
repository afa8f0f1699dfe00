// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for instances and settings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{ConfigStore, InstanceStore, Result, StoreError};
use crate::instance::{Executor, Instance, InstanceKey, InstanceState};

// ============================================================================
// Record Types
// ============================================================================

/// Raw `instances` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    /// Owning team.
    pub team_id: i32,
    /// Instanced challenge.
    pub challenge_id: i32,
    /// Reclamation deadline.
    pub expires_at: DateTime<Utc>,
    /// Host handed to the team.
    pub host: String,
    /// External port, fixed-port mode only.
    pub port: Option<i32>,
    /// `container` or `stack`, null while pending.
    pub executor_kind: Option<String>,
    /// Container id or project name, null while pending.
    pub executor_id: Option<String>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let key = InstanceKey::new(row.team_id, row.challenge_id);

        let port = row
            .port
            .map(u16::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt(format!("{key}: port out of range")))?;

        let state = match (row.executor_kind, row.executor_id) {
            (None, None) => InstanceState::Pending,
            (Some(kind), Some(id)) => Executor::from_parts(&kind, id)
                .map(InstanceState::Running)
                .ok_or_else(|| StoreError::Corrupt(format!("{key}: unknown executor kind {kind}")))?,
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "{key}: executor kind and id must be set together"
                )));
            }
        };

        Ok(Instance {
            key,
            expires_at: row.expires_at,
            host: row.host,
            port,
            state,
        })
    }
}

const INSTANCE_COLUMNS: &str =
    "team_id, challenge_id, expires_at, host, port, executor_kind, executor_id";

// ============================================================================
// Instance Operations
// ============================================================================

/// Insert a pending instance row.
///
/// A primary key violation maps to [`StoreError::AlreadyExists`].
pub async fn insert_pending(
    pool: &PgPool,
    key: InstanceKey,
    expires_at: DateTime<Utc>,
    host: &str,
    port: Option<u16>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instances (team_id, challenge_id, expires_at, host, port)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(key.team_id)
    .bind(key.challenge_id)
    .bind(expires_at)
    .bind(host)
    .bind(port.map(i32::from))
    .execute(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::AlreadyExists,
        other => StoreError::Database(other),
    })?;

    Ok(())
}

/// Get an instance by key.
pub async fn get_instance(pool: &PgPool, key: InstanceKey) -> Result<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances WHERE team_id = $1 AND challenge_id = $2"
    ))
    .bind(key.team_id)
    .bind(key.challenge_id)
    .fetch_optional(pool)
    .await?;

    row.map(Instance::try_from).transpose()
}

/// Record the executor of a running instance.
pub async fn attach_executor(pool: &PgPool, key: InstanceKey, executor: &Executor) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE instances
        SET executor_kind = $3, executor_id = $4
        WHERE team_id = $1 AND challenge_id = $2
        "#,
    )
    .bind(key.team_id)
    .bind(key.challenge_id)
    .bind(executor.kind())
    .bind(executor.id())
    .execute(pool)
    .await?;

    Ok(())
}

/// Move an instance's expiry. No-op for an absent row.
pub async fn update_expiry(pool: &PgPool, key: InstanceKey, expires_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE instances
        SET expires_at = $3
        WHERE team_id = $1 AND challenge_id = $2
        "#,
    )
    .bind(key.team_id)
    .bind(key.challenge_id)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete an instance row. No-op for an absent row.
pub async fn delete_instance(pool: &PgPool, key: InstanceKey) -> Result<()> {
    sqlx::query("DELETE FROM instances WHERE team_id = $1 AND challenge_id = $2")
        .bind(key.team_id)
        .bind(key.challenge_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// The instance with the earliest expiry.
pub async fn next_to_expire(pool: &PgPool) -> Result<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY expires_at ASC, team_id, challenge_id LIMIT 1"
    ))
    .fetch_optional(pool)
    .await?;

    row.map(Instance::try_from).transpose()
}

// ============================================================================
// Settings Operations
// ============================================================================

/// Read a raw setting.
pub async fn get_config(pool: &PgPool, key: &str) -> Result<Option<String>> {
    let value: Option<(String,)> = sqlx::query_as("SELECT value FROM configs WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(value.map(|(v,)| v))
}

/// Insert or replace a setting.
pub async fn set_config(pool: &PgPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO configs (key, value)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Trait Implementations
// ============================================================================

/// PostgreSQL-backed [`InstanceStore`].
#[derive(Clone)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn insert_pending(
        &self,
        key: InstanceKey,
        expires_at: DateTime<Utc>,
        host: &str,
        port: Option<u16>,
    ) -> Result<()> {
        insert_pending(&self.pool, key, expires_at, host, port).await
    }

    async fn get(&self, key: InstanceKey) -> Result<Option<Instance>> {
        get_instance(&self.pool, key).await
    }

    async fn attach_executor(&self, key: InstanceKey, executor: &Executor) -> Result<()> {
        attach_executor(&self.pool, key, executor).await
    }

    async fn update_expiry(&self, key: InstanceKey, expires_at: DateTime<Utc>) -> Result<()> {
        update_expiry(&self.pool, key, expires_at).await
    }

    async fn delete(&self, key: InstanceKey) -> Result<()> {
        delete_instance(&self.pool, key).await
    }

    async fn next_to_expire(&self) -> Result<Option<Instance>> {
        next_to_expire(&self.pool).await
    }
}

/// PostgreSQL-backed [`ConfigStore`] over the `configs` table.
#[derive(Clone)]
pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        get_config(&self.pool, key).await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        set_config(&self.pool, key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> InstanceRow {
        InstanceRow {
            team_id: 7,
            challenge_id: 3,
            expires_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            host: "pwn.ctf.example".into(),
            port: Some(31337),
            executor_kind: None,
            executor_id: None,
        }
    }

    #[test]
    fn test_pending_row_maps_to_pending() {
        let instance = Instance::try_from(row()).unwrap();
        assert_eq!(instance.key, InstanceKey::new(7, 3));
        assert_eq!(instance.port, Some(31337));
        assert!(instance.is_pending());
    }

    #[test]
    fn test_running_row_maps_to_executor() {
        let mut r = row();
        r.executor_kind = Some("stack".into());
        r.executor_id = Some("chall_3_7".into());
        let instance = Instance::try_from(r).unwrap();
        assert_eq!(
            instance.state,
            InstanceState::Running(Executor::Stack("chall_3_7".into()))
        );
    }

    #[test]
    fn test_corrupt_rows_rejected() {
        let mut half = row();
        half.executor_id = Some("abc".into());
        assert!(matches!(
            Instance::try_from(half),
            Err(StoreError::Corrupt(_))
        ));

        let mut unknown = row();
        unknown.executor_kind = Some("vm".into());
        unknown.executor_id = Some("abc".into());
        assert!(matches!(
            Instance::try_from(unknown),
            Err(StoreError::Corrupt(_))
        ));

        let mut port = row();
        port.port = Some(70000);
        assert!(matches!(
            Instance::try_from(port),
            Err(StoreError::Corrupt(_))
        ));
    }
}
