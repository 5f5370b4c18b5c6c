use anvil::config::{CliOverrides, Config};
use anvil::logging::{self, LogOptions};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Bootstrap and continuity orchestrator for a containerized CI host")]
pub struct Cli {
    /// Path to anvil.toml (defaults to /etc/anvil/anvil.toml when present)
    #[arg(short, long, global = true, env = "ANVIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Remote state store, e.g. s3://bucket/jenkins_home. Overrides [store].location
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// Local state directory. Overrides [host].state_dir
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Do not copy log output to the system logger
    #[arg(long, global = true)]
    pub no_syslog: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full boot-time bootstrap
    Run,
    /// Mirror the state directory to the store (what the scheduled triggers invoke)
    Backup {
        /// Container that must be running during the backup
        #[arg(long)]
        container: Option<String>,
    },
    /// Restore state from the store without launching anything
    Restore {
        /// Restore even though the container is running
        #[arg(long)]
        force: bool,
    },
    /// Install the backup artifact and (re)register the daily and deferred triggers
    Schedule {
        /// Print the entries instead of installing them
        #[arg(long)]
        print: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default anvil.toml
    Init,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            store: self.store.clone(),
            state_dir: self.state_dir.clone(),
        }
    }

    fn load_config(&self) -> Result<Config> {
        Config::load(self.config.as_deref(), &self.overrides())
    }

    fn init_logging(&self, config: &Config) -> logging::LogGuard {
        logging::init(&LogOptions {
            verbose: self.verbose,
            file: Some(config.host.log_path.clone()),
            syslog: !self.no_syslog,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Config { command } => {
            let _guard = logging::init(&LogOptions {
                verbose: cli.verbose,
                ..LogOptions::default()
            });
            cmd::cmd_config(&cli, command.clone())?;
        }
        Commands::Run => {
            let config = Arc::new(cli.load_config()?);
            let _guard = cli.init_logging(&config);
            cmd::cmd_run(config).await?;
        }
        Commands::Backup { container } => {
            let mut config = cli.load_config()?;
            if let Some(name) = container {
                config.container.name = name.clone();
            }
            let _guard = cli.init_logging(&config);
            cmd::cmd_backup(&config).await?;
        }
        Commands::Restore { force } => {
            let config = cli.load_config()?;
            let _guard = cli.init_logging(&config);
            cmd::cmd_restore(&config, *force).await?;
        }
        Commands::Schedule { print } => {
            let config = cli.load_config()?;
            if *print {
                cmd::cmd_schedule_print(&config)?;
            } else {
                let _guard = cli.init_logging(&config);
                cmd::cmd_schedule(&config).await?;
            }
        }
    }

    Ok(())
}
