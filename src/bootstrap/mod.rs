//! Bootstrap & continuity orchestration.
//!
//! A run is a fixed sequence of phases. Each phase either returns a fatal
//! `BootstrapError`, which ends the run, or hands control to the next one.
//! Cross-phase facts travel in `RunState` instead of process-wide flags:
//!
//! | Phase       | Reads              | Sets                |
//! |-------------|--------------------|---------------------|
//! | runtime     |                    |                     |
//! | restore     |                    | `restore_occurred`  |
//! | identity    | `restore_occurred` |                     |
//! | launch      |                    | `container_started` |
//! | toolchain   |                    | `bridge_verified`   |
//! | readiness   | `restore_occurred` |                     |
//! | continuity  |                    |                     |

pub mod continuity;
pub mod identity;
pub mod launch;
pub mod readiness;
pub mod restore;
pub mod runtime;
pub mod toolchain;

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::errors::BootstrapError;
use crate::exec::CommandRunner;
use crate::metadata::HostMetadata;
use crate::schedule::JobScheduler;
use crate::store::StateStore;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub use continuity::ScheduleOutcome;
pub use identity::IdentityOutcome;
pub use readiness::Readiness;
pub use restore::RestoreOutcome;
pub use toolchain::BridgeOutcome;

const PHASES: usize = 7;

/// Facts established by earlier phases of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub restore_occurred: bool,
    pub container_started: bool,
    pub bridge_verified: bool,
}

/// Everything the orchestrator talks to outside its own process.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub engine: Arc<dyn ContainerEngine>,
    pub store: Arc<dyn StateStore>,
    pub metadata: Arc<dyn HostMetadata>,
    pub scheduler: Arc<dyn JobScheduler>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store: String,
    pub state: RunState,
    pub restore: RestoreOutcome,
    pub identity: IdentityOutcome,
    pub bridge: BridgeOutcome,
    pub readiness: Readiness,
    pub schedule: ScheduleOutcome,
}

impl RunReport {
    /// Operator-facing summary, one line each.
    pub fn summary(&self) -> Vec<String> {
        let restore = match &self.restore {
            RestoreOutcome::Fresh => "fresh start (no snapshot)".to_string(),
            RestoreOutcome::Restored { .. } => format!("restored from {}", self.store),
            RestoreOutcome::Fallback { reason } => format!("fresh start after restore failure: {}", reason),
        };
        let mut lines = vec![format!("State: {}", restore)];
        if let IdentityOutcome::Rewritten { endpoint, .. } = &self.identity {
            lines.push(format!("Endpoint: {}", endpoint));
        }
        lines.push(format!("Socket group: {}", self.bridge.gid));
        lines.push(self.readiness.message());
        lines.push(format!("Daily backup: {}", self.schedule.daily));
        lines.push(format!(
            "First backup in {} minutes",
            self.schedule.deferred_minutes
        ));
        lines
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    deps: Collaborators,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, deps: Collaborators) -> Self {
        Self { config, deps }
    }

    pub async fn run(&self) -> Result<RunReport, BootstrapError> {
        let config = self.config.as_ref();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut state = RunState::default();
        tracing::info!(%run_id, store = %config.store, "Bootstrap starting");

        phase(1, "runtime");
        runtime::prepare(config, self.deps.runner.as_ref(), self.deps.engine.as_ref()).await?;

        phase(2, "restore");
        let restore = restore::restore(config, self.deps.store.as_ref(), &mut state).await?;
        restore::apply_ownership(
            &config.host.state_dir,
            config.host.workload_uid,
            config.host.workload_gid,
        )?;

        phase(3, "identity");
        let identity = identity::reconcile(config, self.deps.metadata.as_ref(), &state).await?;

        phase(4, "launch");
        launch::launch(config, self.deps.engine.as_ref(), &mut state).await?;

        phase(5, "toolchain");
        let bridge = toolchain::extend(config, self.deps.engine.as_ref(), &mut state).await?;

        phase(6, "readiness");
        let readiness = readiness::wait(config, &state).await;

        phase(7, "continuity");
        let schedule = continuity::establish(config, self.deps.scheduler.as_ref()).await?;

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            store: config.store.to_string(),
            state,
            restore,
            identity,
            bridge,
            readiness,
            schedule,
        };
        tracing::info!(%run_id, "Bootstrap complete");
        Ok(report)
    }
}

fn phase(n: usize, name: &str) {
    tracing::info!("[{}/{}] {}", n, PHASES, name);
}
