//! Manual restore: `anvil restore`.

use anvil::bootstrap::identity::{self, IdentityOutcome};
use anvil::bootstrap::restore::{self, RestoreOutcome};
use anvil::bootstrap::RunState;
use anvil::config::Config;
use anvil::engine::{ContainerEngine, DockerEngine};
use anvil::exec::{CommandRunner, SystemRunner};
use anvil::metadata::InstanceMetadata;
use anvil::store::open_store;
use anyhow::{Result, bail};
use std::sync::Arc;

pub async fn cmd_restore(config: &Config, force: bool) -> Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let engine = DockerEngine::new(runner.clone(), &config.host.socket_path);
    let name = &config.container.name;

    // An engine that cannot answer cannot have the container running.
    let running = engine.is_running(name).await.unwrap_or(false);
    if running && !force {
        bail!(
            "Container {} is running; stop it first or pass --force to restore underneath it",
            name
        );
    }
    if running {
        tracing::warn!(container = %name, "Restoring while the container is running");
    }

    let store = open_store(&config.store, runner);
    let mut state = RunState::default();
    let outcome = restore::restore(config, store.as_ref(), &mut state).await?;
    restore::apply_ownership(
        &config.host.state_dir,
        config.host.workload_uid,
        config.host.workload_gid,
    )?;

    let metadata = InstanceMetadata::new(&config.identity.metadata_url)?;
    let identity = identity::reconcile(config, &metadata, &state).await?;

    match outcome {
        RestoreOutcome::Restored { .. } => {
            println!(
                "{} {} into {}",
                console::style("Restored").green().bold(),
                config.store,
                config.host.state_dir.display()
            );
            if let IdentityOutcome::Rewritten { endpoint, .. } = identity {
                println!("  Endpoint now {}", endpoint);
            }
            Ok(())
        }
        RestoreOutcome::Fresh => {
            println!("No snapshot under {}; nothing restored.", config.store);
            Ok(())
        }
        RestoreOutcome::Fallback { reason } => bail!("Restore failed: {}", reason),
    }
}
