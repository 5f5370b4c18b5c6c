//! Configuration for a bootstrap run.
//!
//! `anvil.toml` describes the host, the workload container and the remote
//! store. Every field has a default except the store location, which must come
//! from the file, the environment, or the command line:
//!
//! ```toml
//! [store]
//! location = "s3://ci-state/jenkins_home"
//!
//! [host]
//! state_dir = "/var/jenkins_home"
//! socket_path = "/var/run/docker.sock"
//!
//! [container]
//! name = "jenkins"
//! image = "jenkins/jenkins:lts"
//!
//! [timing]
//! readiness_attempts = 60
//!
//! [[toolchain.tools]]
//! name = "terraform"
//! install = "..."
//! version = "terraform -version"
//! ```
//!
//! Layering is file → environment → CLI. The resulting `Config` is immutable
//! and shared by every phase.

use crate::poll::{Attempts, PollPolicy};
use crate::store::StoreLocation;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/anvil/anvil.toml";

/// Remote state store section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    /// `s3://bucket/prefix` or `file:///path`
    #[serde(default)]
    pub location: Option<String>,
}

/// Host paths and the workload's numeric identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSection {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Privileged control socket bridged into the container
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Where the backup executable is installed for cron and operators
    #[serde(default = "default_backup_path")]
    pub backup_path: PathBuf,
    #[serde(default = "default_backup_log_path")]
    pub backup_log_path: PathBuf,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    #[serde(default = "default_workload_id")]
    pub workload_uid: u32,
    #[serde(default = "default_workload_id")]
    pub workload_gid: u32,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/jenkins_home")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/anvil-bootstrap.log")
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/jenkins-backup")
}

fn default_backup_log_path() -> PathBuf {
    PathBuf::from("/var/log/jenkins-backup.log")
}

fn default_report_path() -> PathBuf {
    PathBuf::from("/var/lib/anvil/last-run.json")
}

fn default_workload_id() -> u32 {
    1000
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            socket_path: default_socket_path(),
            log_path: default_log_path(),
            backup_path: default_backup_path(),
            backup_log_path: default_backup_log_path(),
            report_path: default_report_path(),
            workload_uid: default_workload_id(),
            workload_gid: default_workload_id(),
        }
    }
}

/// The workload container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    #[serde(default = "default_container_name")]
    pub name: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    /// Mount point of the state directory inside the container
    #[serde(default = "default_state_dir")]
    pub home: PathBuf,
    /// In-container workload user
    #[serde(default = "default_user")]
    pub user: String,
    /// Group recreated inside the container with the socket's host gid
    #[serde(default = "default_bridge_group")]
    pub bridge_group: String,
}

fn default_container_name() -> String {
    "jenkins".to_string()
}

fn default_image() -> String {
    "jenkins/jenkins:lts".to_string()
}

fn default_service_port() -> u16 {
    8080
}

fn default_agent_port() -> u16 {
    50000
}

fn default_user() -> String {
    "jenkins".to_string()
}

fn default_bridge_group() -> String {
    "docker".to_string()
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            name: default_container_name(),
            image: default_image(),
            service_port: default_service_port(),
            agent_port: default_agent_port(),
            home: default_state_dir(),
            user: default_user(),
            bridge_group: default_bridge_group(),
        }
    }
}

/// Self-referential endpoint embedded in restored state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySection {
    /// Relative to the state directory
    #[serde(default = "default_location_file")]
    pub config_file: PathBuf,
    #[serde(default = "default_endpoint_element")]
    pub element: String,
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
}

fn default_location_file() -> PathBuf {
    PathBuf::from("jenkins.model.JenkinsLocationConfiguration.xml")
}

fn default_endpoint_element() -> String {
    "jenkinsUrl".to_string()
}

fn default_metadata_url() -> String {
    "http://169.254.169.254".to_string()
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            config_file: default_location_file(),
            element: default_endpoint_element(),
            metadata_url: default_metadata_url(),
        }
    }
}

/// An auxiliary CLI installed inside the container as root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    /// Shell snippet run with `sh -c`
    pub install: String,
    /// Command that must succeed and print a version once installed
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainSection {
    /// Run once before the tool installers
    #[serde(default = "default_prerequisites")]
    pub prerequisites: String,
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolSpec>,
}

fn default_prerequisites() -> String {
    "apt-get update -qq && apt-get install -y -qq curl unzip ca-certificates".to_string()
}

fn default_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "terraform".to_string(),
            install: "curl -fsSLo /tmp/terraform.zip \
                      https://releases.hashicorp.com/terraform/1.9.8/terraform_1.9.8_linux_amd64.zip \
                      && unzip -qo /tmp/terraform.zip -d /usr/local/bin \
                      && rm -f /tmp/terraform.zip"
                .to_string(),
            version: "terraform -version".to_string(),
        },
        ToolSpec {
            name: "docker".to_string(),
            install: "apt-get install -y -qq docker.io".to_string(),
            version: "docker --version".to_string(),
        },
        ToolSpec {
            name: "aws".to_string(),
            install: "curl -fsSLo /tmp/awscliv2.zip \
                      https://awscli.amazonaws.com/awscli-exe-linux-x86_64.zip \
                      && unzip -qo /tmp/awscliv2.zip -d /tmp \
                      && /tmp/aws/install --update \
                      && rm -rf /tmp/aws /tmp/awscliv2.zip"
                .to_string(),
            version: "aws --version".to_string(),
        },
    ]
}

impl Default for ToolchainSection {
    fn default() -> Self {
        Self {
            prerequisites: default_prerequisites(),
            tools: default_tools(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSection {
    /// Globs, relative to the state directory, for files that must be executable
    #[serde(default = "default_executable_patterns")]
    pub executable_patterns: Vec<String>,
}

fn default_executable_patterns() -> Vec<String> {
    vec!["tools/**/bin/*".to_string(), "tools/**/*.sh".to_string()]
}

impl Default for RestoreSection {
    fn default() -> Self {
        Self {
            executable_patterns: default_executable_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSection {
    /// Created only by first-run initialization
    #[serde(default = "default_initial_secret")]
    pub initial_secret: PathBuf,
    /// Present once setup has completed at least once
    #[serde(default = "default_setup_marker")]
    pub setup_marker: PathBuf,
}

fn default_initial_secret() -> PathBuf {
    PathBuf::from("secrets/initialAdminPassword")
}

fn default_setup_marker() -> PathBuf {
    PathBuf::from("jenkins.install.InstallUtil.lastExecVersion")
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            initial_secret: default_initial_secret(),
            setup_marker: default_setup_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSection {
    /// Five-field cron expression for the recurring backup
    #[serde(default = "default_daily")]
    pub daily: String,
    /// Delay of the one-shot backup after bootstrap
    #[serde(default = "default_deferred_minutes")]
    pub deferred_minutes: u32,
}

fn default_daily() -> String {
    "0 2 * * *".to_string()
}

fn default_deferred_minutes() -> u32 {
    30
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            daily: default_daily(),
            deferred_minutes: default_deferred_minutes(),
        }
    }
}

/// Poll intervals (seconds) and attempt ceilings. An attempt ceiling of 0 is unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSection {
    #[serde(default = "default_runtime_interval")]
    pub runtime_interval_secs: u64,
    #[serde(default = "default_runtime_attempts")]
    pub runtime_attempts: u32,
    #[serde(default = "default_pull_interval")]
    pub pull_interval_secs: u64,
    #[serde(default = "default_pull_attempts")]
    pub pull_attempts: u32,
    #[serde(default = "default_responsive_interval")]
    pub responsive_interval_secs: u64,
    #[serde(default)]
    pub responsive_attempts: u32,
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_secs: u64,
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
}

fn default_runtime_interval() -> u64 {
    5
}

fn default_runtime_attempts() -> u32 {
    12
}

fn default_pull_interval() -> u64 {
    10
}

fn default_pull_attempts() -> u32 {
    5
}

fn default_responsive_interval() -> u64 {
    2
}

fn default_readiness_interval() -> u64 {
    5
}

fn default_readiness_attempts() -> u32 {
    60
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            runtime_interval_secs: default_runtime_interval(),
            runtime_attempts: default_runtime_attempts(),
            pull_interval_secs: default_pull_interval(),
            pull_attempts: default_pull_attempts(),
            responsive_interval_secs: default_responsive_interval(),
            responsive_attempts: 0,
            readiness_interval_secs: default_readiness_interval(),
            readiness_attempts: default_readiness_attempts(),
        }
    }
}

/// Polling policies derived from `[timing]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub runtime: PollPolicy,
    pub pull: PollPolicy,
    pub responsive: PollPolicy,
    pub readiness: PollPolicy,
}

impl From<&TimingSection> for Timing {
    fn from(t: &TimingSection) -> Self {
        let policy = |secs: u64, attempts: u32| PollPolicy {
            interval: Duration::from_secs(secs),
            attempts: Attempts::from_ceiling(attempts),
        };
        Self {
            runtime: policy(t.runtime_interval_secs, t.runtime_attempts),
            pull: policy(t.pull_interval_secs, t.pull_attempts),
            responsive: policy(t.responsive_interval_secs, t.responsive_attempts),
            readiness: policy(t.readiness_interval_secs, t.readiness_attempts),
        }
    }
}

/// The complete anvil.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnvilToml {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub toolchain: ToolchainSection,
    #[serde(default)]
    pub restore: RestoreSection,
    #[serde(default)]
    pub readiness: ReadinessSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub timing: TimingSection,
}

impl AnvilToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse anvil.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize anvil.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `ANVIL_*` overrides using `lookup` as the environment.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(store) = lookup("ANVIL_STORE") {
            self.store.location = Some(store);
        }
        if let Some(dir) = lookup("ANVIL_STATE_DIR") {
            self.host.state_dir = PathBuf::from(dir);
        }
        if let Some(image) = lookup("ANVIL_IMAGE") {
            self.container.image = image;
        }
        if let Some(name) = lookup("ANVIL_CONTAINER") {
            self.container.name = name;
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(store) = &overrides.store {
            self.store.location = Some(store.clone());
        }
        if let Some(dir) = &overrides.state_dir {
            self.host.state_dir = dir.clone();
        }
    }

    /// Non-fatal problems worth surfacing to an operator.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match &self.store.location {
            None => warnings.push(
                "No store location configured; set [store].location, ANVIL_STORE, or --store"
                    .to_string(),
            ),
            Some(loc) => {
                if let Err(e) = loc.parse::<StoreLocation>() {
                    warnings.push(e.to_string());
                }
            }
        }
        if !self.host.state_dir.is_absolute() {
            warnings.push(format!(
                "host.state_dir '{}' is not absolute",
                self.host.state_dir.display()
            ));
        }
        if self.container.service_port == self.container.agent_port {
            warnings.push(format!(
                "container.service_port and container.agent_port are both {}",
                self.container.service_port
            ));
        }
        if self.timing.runtime_attempts == 0 {
            warnings.push("timing.runtime_attempts = 0 waits forever for the engine".to_string());
        }
        if self.timing.pull_attempts == 0 {
            warnings.push("timing.pull_attempts = 0 retries the image pull forever".to_string());
        }
        if self.schedule.daily.split_whitespace().count() != 5 {
            warnings.push(format!(
                "schedule.daily '{}' is not a five-field cron expression",
                self.schedule.daily
            ));
        }
        if self.schedule.deferred_minutes == 0 {
            warnings.push("schedule.deferred_minutes = 0 runs the first backup immediately".to_string());
        }
        if self.toolchain.tools.is_empty() {
            warnings.push("toolchain.tools is empty; nested automation will lack its CLIs".to_string());
        }
        for pattern in &self.restore.executable_patterns {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("restore.executable_patterns: invalid glob '{}'", pattern));
            }
        }

        warnings
    }
}

/// Command-line overrides, highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub store: Option<String>,
    pub state_dir: Option<PathBuf>,
}

/// Immutable runtime configuration shared by every phase.
#[derive(Debug, Clone)]
pub struct Config {
    /// File the settings were read from, if any
    pub source: Option<PathBuf>,
    pub store: StoreLocation,
    pub host: HostSection,
    pub container: ContainerSection,
    pub identity: IdentitySection,
    pub toolchain: ToolchainSection,
    pub restore: RestoreSection,
    pub readiness: ReadinessSection,
    pub schedule: ScheduleSection,
    pub timing: Timing,
}

impl Config {
    /// Load from `path` (or the default location), then apply env and CLI overrides.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>, overrides: &CliOverrides) -> Result<Self> {
        let (mut toml, source) = load_toml(path)?;
        toml.apply_env();
        toml.apply_overrides(overrides);
        Self::from_toml(toml, source)
    }

    pub fn from_toml(toml: AnvilToml, source: Option<PathBuf>) -> Result<Self> {
        let Some(location) = toml.store.location.as_deref() else {
            bail!(
                "No store location configured. Set [store].location in anvil.toml, ANVIL_STORE, or pass --store"
            );
        };
        let store: StoreLocation = location.parse()?;
        for pattern in &toml.restore.executable_patterns {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid executable pattern '{}'", pattern))?;
        }

        Ok(Self {
            source,
            store,
            timing: Timing::from(&toml.timing),
            host: toml.host,
            container: toml.container,
            identity: toml.identity,
            toolchain: toml.toolchain,
            restore: toml.restore,
            readiness: toml.readiness,
            schedule: toml.schedule,
        })
    }

    /// Path of the endpoint configuration file on the host.
    pub fn location_config_path(&self) -> PathBuf {
        self.host.state_dir.join(&self.identity.config_file)
    }

    pub fn initial_secret_path(&self) -> PathBuf {
        self.host.state_dir.join(&self.readiness.initial_secret)
    }

    pub fn setup_marker_path(&self) -> PathBuf {
        self.host.state_dir.join(&self.readiness.setup_marker)
    }
}

/// Read the TOML document, returning it with the path it came from.
pub fn load_toml(path: Option<&Path>) -> Result<(AnvilToml, Option<PathBuf>)> {
    match path {
        Some(p) => Ok((AnvilToml::load(p)?, Some(p.to_path_buf()))),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Ok((AnvilToml::load(default)?, Some(default.to_path_buf())))
            } else {
                Ok((AnvilToml::default(), None))
            }
        }
    }
}
