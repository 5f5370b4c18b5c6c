//! Container control interface.
//!
//! The orchestrator needs a small surface from the engine: liveness, image
//! pull, run/restart of one named container, exec inside it, and the process
//! listing. `DockerEngine` drives the docker CLI for everything except the
//! liveness probe, which talks to the engine API over the control socket.

use crate::errors::EngineError;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const PULL_TIMEOUT: Duration = Duration::from_secs(900);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);
const EXEC_TIMEOUT: Duration = Duration::from_secs(1800);

/// Identity an exec runs as inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecUser {
    /// The image's configured user
    Default,
    Root,
    Named(String),
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: PathBuf,
}

/// Everything needed to start the workload container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    /// (host, container) port pairs
    pub ports: Vec<(u16, u16)>,
    pub restart_policy: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            mounts: Vec::new(),
            ports: Vec::new(),
            restart_policy: None,
        }
    }

    pub fn mount(mut self, host: impl AsRef<Path>, container: impl AsRef<Path>) -> Self {
        self.mounts.push(Mount {
            host: host.as_ref().to_path_buf(),
            container: container.as_ref().to_path_buf(),
        });
        self
    }

    pub fn publish(mut self, port: u16) -> Self {
        self.ports.push((port, port));
        self
    }

    pub fn restart_policy(mut self, policy: impl Into<String>) -> Self {
        self.restart_policy = Some(policy.into());
        self
    }

    /// Arguments for `docker run`, detached.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        if let Some(policy) = &self.restart_policy {
            args.push("--restart".to_string());
            args.push(policy.clone());
        }
        for (host, container) in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", host, container));
        }
        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}",
                mount.host.display(),
                mount.container.display()
            ));
        }
        args.push(self.image.clone());
        args
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether the engine accepts administrative queries.
    async fn ping(&self) -> Result<(), EngineError>;

    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Force-remove a container by name. Missing containers are not an error.
    async fn remove(&self, name: &str) -> Result<(), EngineError>;

    async fn run(&self, spec: &ContainerSpec) -> Result<(), EngineError>;

    /// Whether `name` appears in the running process listing.
    async fn is_running(&self, name: &str) -> Result<bool, EngineError>;

    async fn restart(&self, name: &str) -> Result<(), EngineError>;

    /// Run `argv` inside the container. A non-zero exit is returned, not raised.
    async fn exec(
        &self,
        name: &str,
        user: &ExecUser,
        argv: &[String],
    ) -> Result<CommandOutput, EngineError>;
}

/// Docker, via its CLI and control socket.
pub struct DockerEngine {
    runner: Arc<dyn CommandRunner>,
    socket: PathBuf,
}

impl DockerEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, socket: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            socket: socket.into(),
        }
    }

    async fn docker(&self, spec: CommandSpec) -> Result<CommandOutput, EngineError> {
        self.runner.run(&spec).await.map_err(EngineError::Spawn)
    }

    async fn docker_checked(&self, spec: CommandSpec) -> Result<CommandOutput, EngineError> {
        let output = self.docker(spec.clone()).await?;
        if !output.success() {
            return Err(EngineError::CommandFailed {
                command: spec.display(),
                exit_code: output.exit_code,
                stderr: output.summary(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        let socket = self.socket.to_string_lossy();
        let client = bollard::Docker::connect_with_socket(&socket, 5, bollard::API_DEFAULT_VERSION)
            .map_err(|e| EngineError::Api(e.to_string()))?;
        client
            .ping()
            .await
            .map_err(|e| EngineError::Api(e.to_string()))?;
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        self.docker_checked(
            CommandSpec::new("docker")
                .args(["pull", "--quiet", image])
                .with_timeout(PULL_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), EngineError> {
        let spec = CommandSpec::new("docker")
            .args(["rm", "-f", name])
            .with_timeout(CONTROL_TIMEOUT);
        let output = self.docker(spec.clone()).await?;
        if output.success() || output.stderr.contains("No such container") {
            return Ok(());
        }
        Err(EngineError::CommandFailed {
            command: spec.display(),
            exit_code: output.exit_code,
            stderr: output.summary(),
        })
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        self.docker_checked(
            CommandSpec::new("docker")
                .args(spec.run_args())
                .with_timeout(CONTROL_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool, EngineError> {
        let output = self
            .docker_checked(
                CommandSpec::new("docker")
                    .args(["ps", "--filter"])
                    .arg(format!("name=^{}$", name))
                    .args(["--format", "{{.Names}}"])
                    .with_timeout(CONTROL_TIMEOUT),
            )
            .await?;
        Ok(output.stdout.lines().any(|line| line.trim() == name))
    }

    async fn restart(&self, name: &str) -> Result<(), EngineError> {
        self.docker_checked(
            CommandSpec::new("docker")
                .args(["restart", name])
                .with_timeout(CONTROL_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        user: &ExecUser,
        argv: &[String],
    ) -> Result<CommandOutput, EngineError> {
        let mut spec = CommandSpec::new("docker").arg("exec");
        match user {
            ExecUser::Default => {}
            ExecUser::Root => spec = spec.args(["-u", "root"]),
            ExecUser::Named(u) => spec = spec.arg("-u").arg(u.as_str()),
        }
        spec = spec
            .arg(name)
            .args(argv.iter().cloned())
            .with_timeout(EXEC_TIMEOUT);
        self.docker(spec).await
    }
}
