// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - container engine backends.

pub mod compose;
pub mod docker;
pub mod mock;
mod network;
mod traits;

pub use compose::ComposeRunner;
pub use docker::DockerRunner;
pub use mock::{MockCall, MockRunner};
pub use traits::*;
