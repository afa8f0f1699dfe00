// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compose runner for multi-service instances.
//!
//! Each project is rendered into `<data_dir>/compose/<project>/`:
//! - `compose.yml`: the challenge's definition, verbatim
//! - `compose.override.yml`: only in isolated mode, makes the instance
//!   network the project's external default network
//!
//! The stack is then driven through the `docker compose` CLI with the
//! instance variables in the process environment for interpolation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::traits::*;

const COMPOSE_FILE: &str = "compose.yml";
const OVERRIDE_FILE: &str = "compose.override.yml";
const UP_ARGS: [&str; 3] = ["up", "-d", "--remove-orphans"];

/// `docker compose` CLI runner.
#[derive(Debug, Clone)]
pub struct ComposeRunner {
    compose_bin: String,
    work_dir: PathBuf,
}

impl ComposeRunner {
    /// Create a runner invoking `<compose_bin> compose`, rendering projects
    /// under `<data_dir>/compose`.
    pub fn new(compose_bin: impl Into<String>, data_dir: impl AsRef<Path>) -> Self {
        Self {
            compose_bin: compose_bin.into(),
            work_dir: data_dir.as_ref().join("compose"),
        }
    }

    /// Directory holding a project's rendered files.
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.work_dir.join(project)
    }

    /// Write the project's compose files. Returns them in `-f` order.
    pub async fn render(&self, spec: &StackSpec) -> Result<Vec<PathBuf>> {
        let dir = self.project_dir(&spec.project);
        tokio::fs::create_dir_all(&dir).await?;

        let compose_file = dir.join(COMPOSE_FILE);
        tokio::fs::write(&compose_file, &spec.definition).await?;
        let mut files = vec![compose_file];

        let override_file = dir.join(OVERRIDE_FILE);
        match &spec.network {
            Some(network) => {
                let body = serde_json::json!({
                    "networks": {
                        "default": {
                            "name": network,
                            "external": true,
                        }
                    }
                });
                tokio::fs::write(&override_file, serde_json::to_vec_pretty(&body)?).await?;
                files.push(override_file);
            }
            None => remove_file_if_exists(&override_file).await?,
        }

        Ok(files)
    }

    fn command(&self, project: &str, files: &[PathBuf]) -> Command {
        let mut cmd = Command::new(&self.compose_bin);
        cmd.arg("compose").arg("-p").arg(project);
        for file in files {
            cmd.arg("-f").arg(file);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, action: &'static str, project: &str, mut cmd: Command) -> Result<()> {
        debug!(project, action, bin = %self.compose_bin, "Running compose");

        let output = cmd.output().await?;
        if output.status.success() {
            return Ok(());
        }

        Err(RunnerError::Compose {
            action,
            project: project.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}


async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl StackBackend for ComposeRunner {
    fn runner_type(&self) -> &'static str {
        "compose"
    }

    async fn up(&self, spec: &StackSpec) -> Result<String> {
        info!(project = %spec.project, network = ?spec.network, "Bringing stack up");

        let files = self.render(spec).await?;
        let mut cmd = self.command(&spec.project, &files);
        cmd.args(UP_ARGS)
            .current_dir(self.project_dir(&spec.project))
            .envs(&spec.env);

        self.run("up", &spec.project, cmd).await?;

        info!(project = %spec.project, "Stack started");
        Ok(spec.project.clone())
    }

    async fn down(&self, project: &str) -> Result<()> {
        info!(project, "Tearing stack down");

        let mut cmd = self.command(project, &[]);
        cmd.args(["down", "--remove-orphans", "--volumes"]);
        self.run("down", project, cmd).await?;

        let dir = self.project_dir(project);
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        Ok(())
    }
}
