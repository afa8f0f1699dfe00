// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Simulates containers, stacks and networks in memory. Container ids are
//! derived from the container name, so re-creating a name adopts the same
//! container the way the Docker runner does.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::traits::*;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `create_container(name)`.
    CreateContainer(String),
    /// `remove_container(id)`.
    RemoveContainer(String),
    /// `up(project)`.
    StackUp(String),
    /// `down(project)`.
    StackDown(String),
    /// `ensure_network(name)`.
    EnsureNetwork(String),
    /// `remove_network(name)`.
    RemoveNetwork(String),
}

#[derive(Debug, Default)]
struct MockState {
    /// Container id -> spec.
    containers: HashMap<String, ContainerSpec>,
    /// Project -> spec.
    stacks: HashMap<String, StackSpec>,
    networks: BTreeSet<String>,
    calls: Vec<MockCall>,
}

/// Mock runner for testing.
pub struct MockRunner {
    state: Arc<Mutex<MockState>>,
    /// Optional delay to simulate engine latency (in milliseconds)
    pub execution_delay_ms: u64,
    fail_launch: AtomicBool,
    fail_teardown: AtomicBool,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            execution_delay_ms: 0,
            fail_launch: AtomicBool::new(false),
            fail_teardown: AtomicBool::new(false),
        }
    }

    /// Create a mock runner whose container and stack launches fail.
    pub fn failing() -> Self {
        let runner = Self::new();
        runner.set_fail_launch(true);
        runner
    }

    /// Create a mock runner that sleeps before every call.
    pub fn with_delay(execution_delay_ms: u64) -> Self {
        Self {
            execution_delay_ms,
            ..Self::new()
        }
    }

    /// Make container/stack launches fail (or succeed again).
    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Make container/stack/network teardown fail (or succeed again).
    pub fn set_fail_teardown(&self, fail: bool) {
        self.fail_teardown.store(fail, Ordering::SeqCst);
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.lock().await.calls.clone()
    }

    /// Specs of live containers.
    pub async fn containers(&self) -> Vec<ContainerSpec> {
        self.state.lock().await.containers.values().cloned().collect()
    }

    /// Specs of live stacks.
    pub async fn stacks(&self) -> Vec<StackSpec> {
        self.state.lock().await.stacks.values().cloned().collect()
    }

    /// Names of live networks.
    pub async fn networks(&self) -> Vec<String> {
        self.state.lock().await.networks.iter().cloned().collect()
    }

    /// Engine-style id for a container name.
    pub fn container_id(name: &str) -> String {
        hex::encode(Sha256::digest(name.as_bytes()))
    }

    async fn simulate(&self, call: MockCall) {
        if self.execution_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.execution_delay_ms)).await;
        }
        self.state.lock().await.calls.push(call);
    }

    fn check_launch(&self) -> Result<()> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(RunnerError::Other("mock launch failure".to_string()));
        }
        Ok(())
    }

    fn check_teardown(&self) -> Result<()> {
        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(RunnerError::Other("mock teardown failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.simulate(MockCall::CreateContainer(spec.name.clone()))
            .await;
        self.check_launch()?;

        let id = Self::container_id(&spec.name);
        self.state
            .lock()
            .await
            .containers
            .entry(id.clone())
            .or_insert_with(|| spec.clone());
        Ok(id)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.simulate(MockCall::RemoveContainer(id.to_string()))
            .await;
        self.check_teardown()?;
        self.state.lock().await.containers.remove(id);
        Ok(())
    }
}

#[async_trait]
impl StackBackend for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn up(&self, spec: &StackSpec) -> Result<String> {
        self.simulate(MockCall::StackUp(spec.project.clone())).await;
        self.check_launch()?;
        self.state
            .lock()
            .await
            .stacks
            .insert(spec.project.clone(), spec.clone());
        Ok(spec.project.clone())
    }

    async fn down(&self, project: &str) -> Result<()> {
        self.simulate(MockCall::StackDown(project.to_string())).await;
        self.check_teardown()?;
        self.state.lock().await.stacks.remove(project);
        Ok(())
    }
}

#[async_trait]
impl NetworkBackend for MockRunner {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.simulate(MockCall::EnsureNetwork(name.to_string()))
            .await;
        self.state.lock().await.networks.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.simulate(MockCall::RemoveNetwork(name.to_string()))
            .await;
        self.check_teardown()?;
        self.state.lock().await.networks.remove(name);
        Ok(())
    }
}
