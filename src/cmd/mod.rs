//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `run`      | `Run`            |
//! | `backup`   | `Backup`         |
//! | `restore`  | `Restore`        |
//! | `schedule` | `Schedule`       |
//! | `config`   | `Config`         |

pub mod backup;
pub mod config;
pub mod restore;
pub mod run;
pub mod schedule;

pub use backup::cmd_backup;
pub use config::cmd_config;
pub use restore::cmd_restore;
pub use run::cmd_run;
pub use schedule::{cmd_schedule, cmd_schedule_print};

use anvil::bootstrap::Collaborators;
use anvil::config::Config;
use anvil::engine::DockerEngine;
use anvil::exec::{CommandRunner, SystemRunner};
use anvil::metadata::InstanceMetadata;
use anvil::schedule::HostScheduler;
use anvil::store::open_store;
use anyhow::Result;
use std::sync::Arc;

/// Real host implementations of every collaborator.
pub fn host_collaborators(config: &Config) -> Result<Collaborators> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    Ok(Collaborators {
        engine: Arc::new(DockerEngine::new(runner.clone(), &config.host.socket_path)),
        store: open_store(&config.store, runner.clone()),
        metadata: Arc::new(InstanceMetadata::new(&config.identity.metadata_url)?),
        scheduler: Arc::new(HostScheduler::new(runner.clone())),
        runner,
    })
}
