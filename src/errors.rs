//! Typed error hierarchy for the Anvil orchestrator.
//!
//! The enums follow the failure taxonomy of a bootstrap run:
//! - `BootstrapError`: fatal failures that abort the run with a non-zero exit
//! - `StoreError`: remote state store failures (the restore path downgrades these)
//! - `EngineError`: a container engine call failing
//! - `BackupError`: a single backup invocation failing, never the orchestrator
//! - `PollError`: a bounded poll exhausting its attempts

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal errors from the bootstrap orchestrator.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Host package installation failed: {0}")]
    RuntimeInstall(String),

    #[error("Container runtime did not become responsive after {attempts} attempts")]
    RuntimeUnavailable { attempts: u32 },

    #[error("Failed to pull image {image} after {attempts} attempts")]
    ImagePull { image: String, attempts: u32 },

    #[error("Container {name} is not running after one restart attempt")]
    ContainerStart { name: String },

    #[error("Container {name} never responded to exec after {attempts} attempts")]
    ContainerUnresponsive { name: String, attempts: u32 },

    #[error("Failed to install {tool} inside the container: {detail}")]
    ToolInstall { tool: String, detail: String },

    #[error("Privilege bridge verification failed: {detail}")]
    BridgeVerification { detail: String },

    #[error("Failed to register backup schedule: {0}")]
    Schedule(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to run {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Filesystem operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the remote state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid store location '{0}': expected s3://bucket/prefix or file:///path")]
    InvalidLocation(String),

    #[error("Store command `{command}` failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Failed to run store command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Store filesystem operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("`{command}` failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Failed to run container engine command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Container engine API error: {0}")]
    Api(String),
}

/// Errors from a single backup invocation.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Container {name} is not running and could not be restarted")]
    ContainerDown { name: String },

    #[error("State directory {0} does not exist")]
    MissingStateDir(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A bounded poll gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("Timed out after {attempts} attempts ({interval:?} interval)")]
    TimedOut { attempts: u32, interval: Duration },
}
