//! Host job scheduling: one recurring cron entry and one deferred one-shot.

use crate::exec::{CommandRunner, CommandSpec};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A five-field cron time expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule(String);

impl FromStr for CronSchedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("'{}' is not a five-field cron expression", s);
        }
        if fields.iter().any(|f| f.chars().any(|c| !c.is_ascii_alphanumeric() && !"*/,-".contains(c))) {
            bail!("'{}' contains characters cron does not accept", s);
        }
        Ok(Self(fields.join(" ")))
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A crontab line. `marker` identifies prior entries this one replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronEntry {
    pub schedule: CronSchedule,
    pub command: String,
    pub marker: String,
}

impl CronEntry {
    pub fn line(&self) -> String {
        format!("{} {}", self.schedule, self.command)
    }
}

/// A job to run once, `delay_minutes` from now. `marker` identifies pending
/// jobs this one replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShotJob {
    pub delay_minutes: u32,
    pub command: String,
    pub marker: String,
}

impl OneShotJob {
    /// Comment line carried in the job script so later runs can find it.
    pub fn tag(&self) -> String {
        format!("# anvil deferred: {}", self.marker)
    }

    /// Script fed to `at` on stdin.
    pub fn script(&self) -> String {
        format!("{}\n{}\n", self.tag(), self.command)
    }
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Install `entry`, replacing any existing entry with the same marker.
    async fn install_recurring(&self, entry: &CronEntry) -> Result<()>;

    /// Queue `job`, removing any pending job with the same marker.
    async fn schedule_once(&self, job: &OneShotJob) -> Result<()>;
}

/// Job ids from `atq` output (`<id>\t<date> <queue> <user>` per line).
pub fn parse_atq(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect()
}

/// Replace every line referencing `entry.marker` with `entry`, keeping the rest.
pub fn merge_crontab(existing: &str, entry: &CronEntry) -> String {
    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|line| !line.contains(entry.marker.as_str()))
        .collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let new_line = entry.line();
    lines.push(&new_line);
    let mut table = lines.join("\n");
    table.push('\n');
    table
}

/// Quote `arg` for a POSIX shell when it needs it.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The host's `crontab` and `at`.
pub struct HostScheduler {
    runner: Arc<dyn CommandRunner>,
}

impl HostScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn current_crontab(&self) -> Result<String> {
        let output = self
            .runner
            .run(&CommandSpec::new("crontab").arg("-l"))
            .await
            .context("Failed to run crontab -l")?;
        if output.success() {
            return Ok(output.stdout);
        }
        if output.stderr.contains("no crontab") {
            return Ok(String::new());
        }
        bail!("crontab -l failed: {}", output.summary());
    }

    async fn run_checked(&self, spec: CommandSpec) -> Result<String> {
        let output = self
            .runner
            .run(&spec)
            .await
            .with_context(|| format!("Failed to run {}", spec.program))?;
        if !output.success() {
            bail!("`{}` failed: {}", spec.display(), output.summary());
        }
        Ok(output.stdout)
    }

    /// Remove queued `at` jobs whose script carries `tag`. Returns the removed ids.
    async fn clear_pending(&self, tag: &str) -> Result<Vec<u32>> {
        let queue = self.run_checked(CommandSpec::new("atq")).await?;
        let mut removed = Vec::new();
        for id in parse_atq(&queue) {
            let script = self
                .run_checked(CommandSpec::new("at").arg("-c").arg(id.to_string()))
                .await?;
            if script.lines().any(|line| line.trim() == tag) {
                self.run_checked(CommandSpec::new("atrm").arg(id.to_string()))
                    .await?;
                removed.push(id);
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl JobScheduler for HostScheduler {
    async fn install_recurring(&self, entry: &CronEntry) -> Result<()> {
        let table = merge_crontab(&self.current_crontab().await?, entry);
        let output = self
            .runner
            .run(&CommandSpec::new("crontab").arg("-").stdin(table))
            .await
            .context("Failed to run crontab")?;
        if !output.success() {
            bail!("crontab rejected the table: {}", output.summary());
        }
        tracing::info!(entry = %entry.line(), "Recurring backup installed");
        Ok(())
    }

    async fn schedule_once(&self, job: &OneShotJob) -> Result<()> {
        let removed = self.clear_pending(&job.tag()).await?;
        if !removed.is_empty() {
            tracing::info!(jobs = ?removed, "Removed earlier deferred backup");
        }
        let output = self
            .runner
            .run(
                &CommandSpec::new("at")
                    .args(["now", "+"])
                    .arg(job.delay_minutes.to_string())
                    .arg("minutes")
                    .stdin(job.script()),
            )
            .await
            .context("Failed to run at")?;
        if !output.success() {
            bail!("at refused the job: {}", output.summary());
        }
        tracing::info!(minutes = job.delay_minutes, "Deferred backup scheduled");
        Ok(())
    }
}
