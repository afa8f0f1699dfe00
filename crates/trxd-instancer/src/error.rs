// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trxd-instancer.

use thiserror::Error;

use crate::instance::InstanceKey;

/// Instancer errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A live instance already exists for this (team, challenge) pair.
    #[error("Instance already active for {0}")]
    AlreadyActive(InstanceKey),

    /// A concurrent create for the same pair won the insert.
    #[error("Lost instance creation race for {0}")]
    Race(InstanceKey),

    /// Deployment parameters are missing or unusable.
    #[error("Invalid deployment configuration: {0}")]
    InvalidConfig(String),

    /// Container engine operation failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Persistence operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::persistence::StoreError),
}

impl Error {
    /// True when the caller should report "already an active instance".
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::AlreadyActive(_) | Error::Race(_))
    }
}

/// Result type using Instancer Error.
pub type Result<T> = std::result::Result<T, Error>;
