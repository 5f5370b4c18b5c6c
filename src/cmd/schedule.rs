//! Backup trigger registration: `anvil schedule`.

use anvil::backup::BackupJob;
use anvil::bootstrap::continuity;
use anvil::config::Config;
use anvil::exec::SystemRunner;
use anvil::schedule::HostScheduler;
use anyhow::Result;
use std::sync::Arc;

pub async fn cmd_schedule(config: &Config) -> Result<()> {
    let scheduler = HostScheduler::new(Arc::new(SystemRunner));
    let outcome = continuity::establish(config, &scheduler).await?;
    println!("Installed {}", outcome.artifact.display());
    println!("  daily: {}", outcome.daily);
    println!("  once:  in {} minutes", outcome.deferred_minutes);
    Ok(())
}

pub fn cmd_schedule_print(config: &Config) -> Result<()> {
    let job = BackupJob::from_config(config);
    let (recurring, once) = continuity::entries(config, &job)?;
    println!("{}", recurring.line());
    println!(
        "# at now + {} minutes: {}",
        once.delay_minutes, once.command
    );
    Ok(())
}
