//! Readiness Waiter. Advisory: a timeout is reported, never raised.

use super::RunState;
use crate::config::Config;
use crate::errors::PollError;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Readiness {
    /// First-run initialization finished; the operator needs this secret
    InitialCredential {
        #[serde(skip)]
        secret: String,
    },
    /// Restored instance that had already completed setup
    ExistingSetup,
    TimedOut { attempts: u32 },
}

impl Readiness {
    pub fn message(&self) -> String {
        match self {
            Readiness::InitialCredential { secret } => {
                format!("Initial admin password: {}", secret)
            }
            Readiness::ExistingSetup => {
                "Restored from backup; use your existing credentials".to_string()
            }
            Readiness::TimedOut { attempts } => format!(
                "Readiness artifact did not appear after {} attempts; initialization may not have finished",
                attempts
            ),
        }
    }
}

/// Look once for a readiness artifact.
fn look_for_artifact(config: &Config, restored: bool) -> Option<Readiness> {
    if restored && config.setup_marker_path().is_file() {
        return Some(Readiness::ExistingSetup);
    }
    let secret = std::fs::read_to_string(config.initial_secret_path()).ok()?;
    let secret = secret.trim();
    if secret.is_empty() {
        return None;
    }
    Some(Readiness::InitialCredential {
        secret: secret.to_string(),
    })
}

pub async fn wait(config: &Config, state: &RunState) -> Readiness {
    let policy = config.timing.readiness;
    let restored = state.restore_occurred;
    tracing::info!(
        restored,
        interval = ?policy.interval,
        max = %policy.attempts,
        "Waiting for workload readiness"
    );

    match policy
        .find(|_| {
            let hit = look_for_artifact(config, restored);
            async move { hit }
        })
        .await
    {
        Ok((readiness, attempt)) => {
            tracing::info!(attempt, "Workload ready");
            readiness
        }
        Err(PollError::TimedOut { attempts, .. }) => {
            let readiness = Readiness::TimedOut { attempts };
            tracing::warn!("{}", readiness.message());
            readiness
        }
    }
}
