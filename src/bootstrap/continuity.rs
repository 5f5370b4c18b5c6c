//! Continuity Scheduler.

use crate::backup::{BackupJob, install_artifact};
use crate::config::Config;
use crate::errors::BootstrapError;
use crate::schedule::{CronEntry, CronSchedule, JobScheduler, OneShotJob};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleOutcome {
    pub artifact: PathBuf,
    /// The installed crontab line
    pub daily: String,
    pub deferred_minutes: u32,
}

/// Entries that run `job` through the installed artifact.
pub fn entries(config: &Config, job: &BackupJob) -> Result<(CronEntry, OneShotJob), BootstrapError> {
    let schedule: CronSchedule = config
        .schedule
        .daily
        .parse()
        .map_err(|e: anyhow::Error| BootstrapError::Schedule(e.to_string()))?;
    let command = job.shell_command(&config.host.backup_path, &config.host.backup_log_path);
    let marker = config.host.backup_path.display().to_string();
    let recurring = CronEntry {
        schedule,
        command: command.clone(),
        marker: marker.clone(),
    };
    let once = OneShotJob {
        delay_minutes: config.schedule.deferred_minutes,
        command,
        marker,
    };
    Ok((recurring, once))
}

/// Install the backup artifact, then register the daily and deferred triggers.
pub async fn establish(
    config: &Config,
    scheduler: &dyn JobScheduler,
) -> Result<ScheduleOutcome, BootstrapError> {
    let artifact = &config.host.backup_path;
    install_artifact(artifact).map_err(|e| BootstrapError::Schedule(format!("{:#}", e)))?;
    tracing::info!(path = %artifact.display(), "Backup artifact installed");

    let job = BackupJob::from_config(config);
    let (recurring, once) = entries(config, &job)?;
    scheduler
        .install_recurring(&recurring)
        .await
        .map_err(|e| BootstrapError::Schedule(format!("{:#}", e)))?;
    scheduler
        .schedule_once(&once)
        .await
        .map_err(|e| BootstrapError::Schedule(format!("{:#}", e)))?;

    Ok(ScheduleOutcome {
        artifact: artifact.clone(),
        daily: recurring.line(),
        deferred_minutes: once.delay_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnvilToml;
    use crate::exec::CommandOutput;
    use crate::schedule::HostScheduler;
    use crate::testing::{FakeScheduler, ScriptedRunner};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config(dir: &Path) -> Config {
        let mut toml = AnvilToml::default();
        toml.store.location = Some("s3://ci-state/jenkins_home".into());
        toml.host.backup_path = dir.join("bin/jenkins-backup");
        toml.host.backup_log_path = dir.join("jenkins-backup.log");
        Config::from_toml(toml, None).unwrap()
    }

    #[tokio::test]
    async fn registers_one_daily_and_one_deferred_trigger() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let scheduler = FakeScheduler::default();

        let outcome = establish(&config, &scheduler).await.unwrap();

        assert!(config.host.backup_path.is_file());
        let recurring = scheduler.recurring.lock().unwrap();
        let once = scheduler.once.lock().unwrap();
        assert_eq!(recurring.len(), 1);
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].delay_minutes, 30);
        assert_eq!(recurring[0].command, once[0].command);
        assert!(outcome.daily.starts_with("0 2 * * * "));
        assert!(outcome.daily.contains("backup --store s3://ci-state/jenkins_home"));
    }

    #[tokio::test]
    async fn reregistering_replaces_both_triggers() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let scheduler = FakeScheduler::default();

        establish(&config, &scheduler).await.unwrap();
        establish(&config, &scheduler).await.unwrap();

        assert_eq!(scheduler.recurring.lock().unwrap().len(), 1);
        assert_eq!(scheduler.once.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rerun_through_host_scheduler_removes_the_earlier_deferred_job() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let (_, once) = entries(&config, &BackupJob::from_config(&config)).unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("atq", CommandOutput::ok(""));
        runner.respond("atq", CommandOutput::ok("12\tMon Oct 19 10:30:00 2026 a root\n"));
        runner.respond("at -c 12", CommandOutput::ok(once.script()));
        let scheduler = HostScheduler::new(runner.clone());

        establish(&config, &scheduler).await.unwrap();
        establish(&config, &scheduler).await.unwrap();

        assert_eq!(runner.calls_matching("at now + 30 minutes"), 2);
        assert_eq!(runner.calls_matching("atrm 12"), 1);
    }

    #[tokio::test]
    async fn scheduler_failure_is_reported() {
        let dir = tempdir().unwrap();
        let scheduler = FakeScheduler {
            fail: true,
            ..FakeScheduler::default()
        };
        let err = establish(&config(dir.path()), &scheduler).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Schedule(ref m) if m.contains("crontab")));
    }

    #[test]
    fn bad_cron_expression_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.schedule.daily = "daily".into();
        let job = BackupJob::from_config(&config);
        assert!(matches!(entries(&config, &job), Err(BootstrapError::Schedule(_))));
    }
}
