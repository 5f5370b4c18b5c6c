//! One backup invocation: `anvil backup`.

use anvil::backup::BackupJob;
use anvil::config::Config;
use anvil::engine::DockerEngine;
use anvil::exec::{CommandRunner, SystemRunner};
use anvil::store::open_store;
use anyhow::Result;
use std::sync::Arc;

pub async fn cmd_backup(config: &Config) -> Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let engine = DockerEngine::new(runner.clone(), &config.host.socket_path);
    let store = open_store(&config.store, runner);
    let job = BackupJob::from_config(config);

    match job.run(&engine, store.as_ref()).await {
        Ok(outcome) => {
            if outcome.restarted {
                tracing::info!(container = %job.container, "Backup completed after restarting the container");
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("Backup aborted: {}", e);
            Err(e.into())
        }
    }
}
