//! Container Launcher.

use super::RunState;
use crate::config::Config;
use crate::engine::{ContainerEngine, ContainerSpec, ExecUser};
use crate::errors::{BootstrapError, PollError};
use crate::poll::{PollPolicy, retry};

const RESTART_POLICY: &str = "unless-stopped";

/// The workload container: state directory and control socket mounted, both ports published.
pub fn container_spec(config: &Config) -> ContainerSpec {
    ContainerSpec::new(&config.container.name, &config.container.image)
        .restart_policy(RESTART_POLICY)
        .publish(config.container.service_port)
        .publish(config.container.agent_port)
        .mount(&config.host.state_dir, &config.container.home)
        .mount(&config.host.socket_path, &config.host.socket_path)
}

pub async fn launch(
    config: &Config,
    engine: &dyn ContainerEngine,
    state: &mut RunState,
) -> Result<(), BootstrapError> {
    let spec = container_spec(config);
    let name = spec.name.as_str();

    engine.remove(name).await?;

    let image = spec.image.as_str();
    tracing::info!(image, "Pulling image");
    let ((), attempt) = retry(config.timing.pull, "Image pull", move |_| engine.pull(image))
        .await
        .map_err(|PollError::TimedOut { attempts, .. }| BootstrapError::ImagePull {
            image: image.to_string(),
            attempts,
        })?;
    tracing::info!(image, attempt, "Image pulled");

    tracing::info!(container = name, "Starting container");
    engine.run(&spec).await?;
    ensure_running(engine, name).await?;
    state.container_started = true;

    wait_responsive(engine, name, config.timing.responsive).await?;
    tracing::info!(container = name, "Container is up");
    Ok(())
}

/// One restart if the container is not in the process listing.
pub async fn ensure_running(engine: &dyn ContainerEngine, name: &str) -> Result<(), BootstrapError> {
    if engine.is_running(name).await? {
        return Ok(());
    }
    tracing::warn!(container = name, "Container not running after start, restarting once");
    engine.restart(name).await?;
    if engine.is_running(name).await? {
        return Ok(());
    }
    Err(BootstrapError::ContainerStart {
        name: name.to_string(),
    })
}

/// Poll until a trivial exec inside the container succeeds.
pub async fn wait_responsive(
    engine: &dyn ContainerEngine,
    name: &str,
    policy: PollPolicy,
) -> Result<u32, BootstrapError> {
    let noop = ["true".to_string()];
    let noop = noop.as_slice();
    policy
        .run(move |_| async move {
            matches!(engine.exec(name, &ExecUser::Default, noop).await, Ok(out) if out.success())
        })
        .await
        .map_err(|PollError::TimedOut { attempts, .. }| BootstrapError::ContainerUnresponsive {
            name: name.to_string(),
            attempts,
        })
}
