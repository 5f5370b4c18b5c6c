//! The backup procedure.
//!
//! A `BackupJob` carries everything one backup needs: the store location, the
//! local state directory and the container to check. The scheduler registers
//! its `command_line()`, which re-enters this binary through `anvil backup`.
//! When the run was configured from a file, the same file is passed along so
//! the backup logs where the run did.
//!
//! Concurrent invocations are not serialized. The daily trigger, the deferred
//! trigger and a manual run can overlap, and a sync can capture a workload file
//! mid-write. Both are accepted risks.

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::errors::BackupError;
use crate::schedule::shell_join;
use crate::store::{StateStore, StoreLocation};
use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub store: StoreLocation,
    pub state_dir: PathBuf,
    pub container: String,
    /// Config file for everything not on the command line (log path, socket)
    pub config: Option<PathBuf>,
}

/// What a finished backup did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    /// The container had to be restarted first
    pub restarted: bool,
}

impl BackupJob {
    pub fn from_config(config: &Config) -> Self {
        Self {
            store: config.store.clone(),
            state_dir: config.host.state_dir.clone(),
            container: config.container.name.clone(),
            config: config
                .source
                .as_deref()
                .map(|p| std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())),
        }
    }

    /// argv that re-runs this job through the installed artifact at `program`.
    pub fn command_line(&self, program: &Path) -> Vec<String> {
        let mut argv = vec![
            program.display().to_string(),
            "backup".to_string(),
            "--store".to_string(),
            self.store.to_string(),
            "--state-dir".to_string(),
            self.state_dir.display().to_string(),
            "--container".to_string(),
            self.container.clone(),
        ];
        if let Some(path) = &self.config {
            argv.push("--config".to_string());
            argv.push(path.display().to_string());
        }
        argv
    }

    /// Shell form for cron and at, appending output to `log_path`.
    pub fn shell_command(&self, program: &Path, log_path: &Path) -> String {
        format!(
            "{} >> {} 2>&1",
            shell_join(&self.command_line(program)),
            shell_join(&[log_path.display().to_string()])
        )
    }

    /// Check the container (one restart allowed), then mirror local state to the store.
    pub async fn run(
        &self,
        engine: &dyn ContainerEngine,
        store: &dyn StateStore,
    ) -> Result<BackupOutcome, BackupError> {
        if !self.state_dir.is_dir() {
            return Err(BackupError::MissingStateDir(self.state_dir.clone()));
        }

        let mut restarted = false;
        if !engine.is_running(&self.container).await? {
            tracing::warn!(container = %self.container, "Container not running, restarting before backup");
            engine.restart(&self.container).await?;
            restarted = true;
            if !engine.is_running(&self.container).await? {
                return Err(BackupError::ContainerDown {
                    name: self.container.clone(),
                });
            }
        }

        tracing::info!(store = %self.store, dir = %self.state_dir.display(), "Mirroring state to store");
        store.push_mirror(&self.state_dir).await?;
        tracing::info!(store = %self.store, "Backup complete");
        Ok(BackupOutcome { restarted })
    }
}

/// Copy the running executable to `dest` so schedulers can invoke it.
pub fn install_artifact(dest: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    install_artifact_from(&exe, dest)
}

fn install_artifact_from(exe: &Path, dest: &Path) -> Result<()> {
    if exe == dest {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    // Write beside the target and rename, so a running backup keeps its inode.
    let staging = dest.with_extension("new");
    std::fs::copy(exe, &staging)
        .with_context(|| format!("Failed to copy {} to {}", exe.display(), staging.display()))?;
    std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to mark {} executable", staging.display()))?;
    std::fs::rename(&staging, dest)
        .with_context(|| format!("Failed to install backup artifact at {}", dest.display()))?;
    Ok(())
}
