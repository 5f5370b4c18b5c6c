//! Toolchain Extender and privilege bridge.
//!
//! Installs the auxiliary CLIs inside the container as root, then mirrors the
//! host control socket's group id into the container so the workload user can
//! drive the engine. The container is restarted for the membership to apply to
//! the running process, and the result is verified from the workload user's
//! point of view. Any verification failure is fatal.

use super::RunState;
use super::launch::{ensure_running, wait_responsive};
use crate::config::{Config, ToolSpec};
use crate::engine::{ContainerEngine, ExecUser};
use crate::errors::BootstrapError;
use crate::exec::CommandOutput;
use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolVersion {
    pub tool: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeOutcome {
    /// Group id now shared by the host socket and the in-container group
    pub gid: u32,
    pub tools: Vec<ToolVersion>,
}

pub async fn extend(
    config: &Config,
    engine: &dyn ContainerEngine,
    state: &mut RunState,
) -> Result<BridgeOutcome, BootstrapError> {
    let name = config.container.name.as_str();

    install_tools(config, engine).await?;

    let gid = socket_gid(&config.host.socket_path)?;
    tracing::info!(gid, group = %config.container.bridge_group, "Bridging control socket group");
    bridge_group(
        engine,
        name,
        &config.container.bridge_group,
        &config.container.user,
        gid,
    )
    .await?;

    engine.restart(name).await?;
    ensure_running(engine, name).await?;
    wait_responsive(engine, name, config.timing.responsive).await?;

    let tools = verify(config, engine).await?;
    state.bridge_verified = true;
    tracing::info!(gid, "Privilege bridge verified");
    Ok(BridgeOutcome { gid, tools })
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

async fn install_tools(config: &Config, engine: &dyn ContainerEngine) -> Result<(), BootstrapError> {
    let name = config.container.name.as_str();
    let prerequisites = config.toolchain.prerequisites.trim();
    if !prerequisites.is_empty() {
        tracing::info!("Installing toolchain prerequisites");
        let out = engine.exec(name, &ExecUser::Root, &sh(prerequisites)).await?;
        check_install("prerequisites", &out)?;
    }
    for ToolSpec { name: tool, install, .. } in &config.toolchain.tools {
        tracing::info!(tool = %tool, "Installing tool");
        let out = engine.exec(name, &ExecUser::Root, &sh(install)).await?;
        check_install(tool, &out)?;
    }
    Ok(())
}

fn check_install(tool: &str, out: &CommandOutput) -> Result<(), BootstrapError> {
    if out.success() {
        return Ok(());
    }
    Err(BootstrapError::ToolInstall {
        tool: tool.to_string(),
        detail: format!("exit {}: {}", out.exit_code, out.summary()),
    })
}

/// Numeric group owning the host control socket.
pub fn socket_gid(socket: &Path) -> Result<u32, BootstrapError> {
    std::fs::metadata(socket)
        .map(|m| m.gid())
        .map_err(|source| BootstrapError::Io {
            path: socket.to_path_buf(),
            source,
        })
}

/// Recreate `group` inside the container with `gid` and add `user` to it.
///
/// Safe to repeat: the group is deleted first whenever it exists. The gid may
/// already belong to an image group, so it is added as non-unique.
pub async fn bridge_group(
    engine: &dyn ContainerEngine,
    name: &str,
    group: &str,
    user: &str,
    gid: u32,
) -> Result<(), BootstrapError> {
    let existing = engine
        .exec(name, &ExecUser::Root, &argv(&["getent", "group", group]))
        .await?;
    if existing.success() {
        tracing::debug!(entry = %existing.stdout.trim(), "Replacing existing group");
        let out = engine
            .exec(name, &ExecUser::Root, &argv(&["groupdel", group]))
            .await?;
        check_bridge("groupdel", &out)?;
    }

    let gid = gid.to_string();
    let out = engine
        .exec(name, &ExecUser::Root, &argv(&["groupadd", "-o", "-g", &gid, group]))
        .await?;
    check_bridge("groupadd", &out)?;

    let out = engine
        .exec(name, &ExecUser::Root, &argv(&["usermod", "-aG", group, user]))
        .await?;
    check_bridge("usermod", &out)
}

fn check_bridge(step: &str, out: &CommandOutput) -> Result<(), BootstrapError> {
    if out.success() {
        return Ok(());
    }
    Err(BootstrapError::BridgeVerification {
        detail: format!("{} exited {}: {}", step, out.exit_code, out.summary()),
    })
}

async fn verify(config: &Config, engine: &dyn ContainerEngine) -> Result<Vec<ToolVersion>, BootstrapError> {
    let name = config.container.name.as_str();
    let user = config.container.user.as_str();
    let group = config.container.bridge_group.as_str();

    let out = engine
        .exec(name, &ExecUser::Root, &argv(&["id", "-nG", user]))
        .await?;
    check_bridge("id", &out)?;
    if !out.stdout.split_whitespace().any(|g| g == group) {
        return Err(BootstrapError::BridgeVerification {
            detail: format!("{} is not a member of {} (groups: {})", user, group, out.stdout.trim()),
        });
    }

    let mut tools = Vec::new();
    for tool in &config.toolchain.tools {
        let out = engine.exec(name, &ExecUser::Default, &sh(&tool.version)).await?;
        if !out.success() {
            return Err(BootstrapError::BridgeVerification {
                detail: format!("`{}` failed: {}", tool.version, out.summary()),
            });
        }
        let version = out.stdout.lines().next().unwrap_or_default().trim().to_string();
        tracing::info!(tool = %tool.name, version = %version, "Tool available");
        tools.push(ToolVersion {
            tool: tool.name.clone(),
            version,
        });
    }

    let out = engine
        .exec(name, &ExecUser::Named(user.to_string()), &argv(&["docker", "ps"]))
        .await?;
    if !out.success() {
        return Err(BootstrapError::BridgeVerification {
            detail: format!("{} cannot reach the engine socket: {}", user, out.summary()),
        });
    }
    Ok(tools)
}
