//! Configuration view and validation commands: `anvil config`.

use anyhow::{Result, bail};
use std::path::PathBuf;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    use anvil::config::{AnvilToml, Config, DEFAULT_CONFIG_PATH, load_toml};
    use anvil::schedule::CronSchedule;

    match command {
        None | Some(ConfigCommands::Show) => {
            let (mut settings, source) = load_toml(cli.config.as_deref())?;
            settings.apply_env();
            settings.apply_overrides(&cli.overrides());

            println!();
            match &source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No config file found; using defaults"),
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&settings)?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let (mut settings, source) = load_toml(cli.config.as_deref())?;
            settings.apply_env();
            settings.apply_overrides(&cli.overrides());

            println!();
            println!("Validating configuration...");
            println!();

            let mut errors = Vec::new();
            if let Err(e) = Config::from_toml(settings.clone(), source) {
                errors.push(format!("{:#}", e));
            }
            if settings.timing.runtime_attempts == 0 || settings.timing.pull_attempts == 0 {
                errors.push("timing.runtime_attempts and timing.pull_attempts must be at least 1".to_string());
            }
            if let Err(e) = settings.schedule.daily.parse::<CronSchedule>() {
                errors.push(format!("schedule.daily: {}", e));
            }

            let warnings = settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            println!();

            if !errors.is_empty() {
                for error in &errors {
                    eprintln!("{} {}", console::style("error:").red().bold(), error);
                }
                bail!("Configuration has {} error(s)", errors.len());
            }
        }
        Some(ConfigCommands::Init) => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
            if path.exists() {
                println!("anvil.toml already exists at {}", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            let mut settings = AnvilToml::default();
            settings.apply_overrides(&cli.overrides());
            settings.save(&path)?;

            println!("Created anvil.toml at {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [store] location (required unless ANVIL_STORE or --store is set)");
            println!("  - [container] image, name, ports");
            println!("  - [[toolchain.tools]] for the CLIs installed into the container");
            println!("  - [timing] poll intervals and attempt ceilings");
            println!();
        }
    }

    Ok(())
}
