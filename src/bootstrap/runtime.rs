//! Runtime Preparer: make sure a container engine is installed and answering.
//!
//! The host also needs `crontab` and `at` for the Continuity Scheduler. They are
//! installed here, with the engine, so a bare image fails before the workload
//! starts rather than after.

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::errors::{BootstrapError, PollError};
use crate::exec::{CommandRunner, CommandSpec};
use crate::poll::retry;
use std::time::Duration;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(900);

/// Programs the host must provide, checked in this order.
const REQUIRED_PROGRAMS: &[&str] = &["docker", "crontab", "at"];

/// A host package manager and what it calls the packages we need.
#[derive(Debug, PartialEq, Eq)]
struct PackageManager {
    program: &'static str,
    engine: &'static str,
    cron: &'static str,
    cron_service: &'static str,
}

impl PackageManager {
    fn package_for(&self, program: &str) -> &'static str {
        match program {
            "docker" => self.engine,
            "crontab" => self.cron,
            _ => "at",
        }
    }
}

/// In preference order.
const PACKAGE_MANAGERS: &[PackageManager] = &[
    PackageManager {
        program: "dnf",
        engine: "docker",
        cron: "cronie",
        cron_service: "crond",
    },
    PackageManager {
        program: "yum",
        engine: "docker",
        cron: "cronie",
        cron_service: "crond",
    },
    PackageManager {
        program: "apt-get",
        engine: "docker.io",
        cron: "cron",
        cron_service: "cron",
    },
];

pub async fn prepare(
    config: &Config,
    runner: &dyn CommandRunner,
    engine: &dyn ContainerEngine,
) -> Result<(), BootstrapError> {
    let mut missing = Vec::new();
    for program in REQUIRED_PROGRAMS {
        if !runner.has_program(program).await {
            missing.push(*program);
        }
    }
    let manager = detect_manager(runner).await;
    ensure_installed(runner, manager, &missing).await?;

    let cron_service = manager.map_or("crond", |m| m.cron_service);
    for service in ["docker", cron_service, "atd"] {
        start_service(runner, service).await;
    }

    let policy = config.timing.runtime;
    tracing::info!(interval = ?policy.interval, max = %policy.attempts, "Waiting for container engine");
    let ((), attempt) = retry(policy, "Container engine ping", move |_| engine.ping())
        .await
        .map_err(|PollError::TimedOut { attempts, .. }| BootstrapError::RuntimeUnavailable {
            attempts,
        })?;
    tracing::info!(attempt, "Container engine is responsive");
    Ok(())
}

async fn detect_manager(runner: &dyn CommandRunner) -> Option<&'static PackageManager> {
    for manager in PACKAGE_MANAGERS {
        if runner.has_program(manager.program).await {
            return Some(manager);
        }
    }
    None
}

async fn ensure_installed(
    runner: &dyn CommandRunner,
    manager: Option<&PackageManager>,
    missing: &[&str],
) -> Result<(), BootstrapError> {
    if missing.is_empty() {
        tracing::debug!("docker, crontab and at already installed");
        return Ok(());
    }
    let Some(manager) = manager else {
        return Err(BootstrapError::RuntimeInstall(format!(
            "{} not installed and no supported package manager (dnf, yum, apt-get) was found",
            missing.join(", ")
        )));
    };

    let packages: Vec<&str> = missing.iter().map(|p| manager.package_for(p)).collect();
    tracing::info!(manager = manager.program, packages = ?packages, "Installing host packages");
    if manager.program == "apt-get" {
        run_checked(runner, CommandSpec::new("apt-get").arg("update")).await?;
    }
    run_checked(
        runner,
        CommandSpec::new(manager.program)
            .args(["install", "-y"])
            .args(packages)
            .with_timeout(INSTALL_TIMEOUT),
    )
    .await
}

async fn run_checked(runner: &dyn CommandRunner, spec: CommandSpec) -> Result<(), BootstrapError> {
    let output = runner
        .run(&spec)
        .await
        .map_err(|source| BootstrapError::Exec {
            program: spec.program.clone(),
            source,
        })?;
    if !output.success() {
        return Err(BootstrapError::RuntimeInstall(format!(
            "`{}` exited {}: {}",
            spec.display(),
            output.exit_code,
            output.summary()
        )));
    }
    Ok(())
}

/// Enable and start a host service. Failure is only logged: the engine ping
/// and the scheduler calls surface anything that matters.
async fn start_service(runner: &dyn CommandRunner, service: &str) {
    let spec = CommandSpec::new("systemctl").args(["enable", "--now", service]);
    match runner.run(&spec).await {
        Ok(out) if out.success() => {}
        Ok(out) => tracing::warn!(service, "systemctl could not start service: {}", out.summary()),
        Err(e) => tracing::warn!(service, "systemctl unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnvilToml;
    use crate::exec::CommandOutput;
    use crate::testing::{FakeEngine, ScriptedRunner};

    fn config() -> Config {
        let mut toml = AnvilToml::default();
        toml.store.location = Some("s3://ci-state/jenkins_home".into());
        Config::from_toml(toml, None).unwrap()
    }

    fn missing(runner: &ScriptedRunner, program: &str) {
        runner.respond(
            &format!("sh -c command -v {}", program),
            CommandOutput::failed(1, ""),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn provisioned_host_only_starts_services() {
        let runner = ScriptedRunner::new();
        let engine = FakeEngine::new(992);
        prepare(&config(), &runner, &engine).await.unwrap();

        let calls: Vec<String> = runner.calls().iter().map(|c| c.display()).collect();
        assert_eq!(
            calls,
            vec![
                "sh -c command -v docker",
                "sh -c command -v crontab",
                "sh -c command -v at",
                "sh -c command -v dnf",
                "systemctl enable --now docker",
                "systemctl enable --now crond",
                "systemctl enable --now atd",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn installs_with_first_available_package_manager() {
        let runner = ScriptedRunner::new();
        missing(&runner, "docker");
        missing(&runner, "dnf");
        missing(&runner, "yum");
        let engine = FakeEngine::new(992);

        prepare(&config(), &runner, &engine).await.unwrap();

        assert_eq!(runner.calls_matching("apt-get update"), 1);
        assert_eq!(runner.calls_matching("apt-get install -y docker.io"), 1);
        assert_eq!(runner.calls_matching("dnf install"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_install_is_fatal() {
        let runner = ScriptedRunner::new();
        missing(&runner, "docker");
        runner.respond("dnf install", CommandOutput::failed(1, "No match for argument: docker"));
        let engine = FakeEngine::new(992);

        let err = prepare(&config(), &runner, &engine).await.unwrap_err();
        assert!(matches!(err, BootstrapError::RuntimeInstall(ref m) if m.contains("No match")));
        assert_eq!(engine.with_state(|s| s.pings), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_package_manager_is_fatal() {
        let runner = ScriptedRunner::new();
        for program in ["docker", "dnf", "yum", "apt-get"] {
            missing(&runner, program);
        }
        let engine = FakeEngine::new(992);
        let err = prepare(&config(), &runner, &engine).await.unwrap_err();
        assert!(matches!(err, BootstrapError::RuntimeInstall(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn engine_ready_within_ceiling() {
        let runner = ScriptedRunner::new();
        let engine = FakeEngine::new(992);
        engine.with_state(|s| s.ping_failures = 11);
        prepare(&config(), &runner, &engine).await.unwrap();
        assert_eq!(engine.with_state(|s| s.pings), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn thirteen_failed_pings_abort_at_twelve() {
        let runner = ScriptedRunner::new();
        let engine = FakeEngine::new(992);
        engine.with_state(|s| s.ping_failures = 13);
        let start = tokio::time::Instant::now();

        let err = prepare(&config(), &runner, &engine).await.unwrap_err();

        assert!(matches!(err, BootstrapError::RuntimeUnavailable { attempts: 12 }));
        assert_eq!(engine.with_state(|s| s.pings), 12);
        assert_eq!(start.elapsed(), Duration::from_secs(55));
    }

    #[tokio::test(start_paused = true)]
    async fn systemctl_failure_is_not_fatal() {
        let runner = ScriptedRunner::new();
        runner.respond("systemctl", CommandOutput::failed(1, "System has not been booted with systemd"));
        let engine = FakeEngine::new(992);
        prepare(&config(), &runner, &engine).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn installs_missing_scheduler_tools_with_the_engine_present() {
        let runner = ScriptedRunner::new();
        missing(&runner, "crontab");
        missing(&runner, "at");
        let engine = FakeEngine::new(992);

        prepare(&config(), &runner, &engine).await.unwrap();

        assert_eq!(runner.calls_matching("dnf install -y cronie at"), 1);
        assert_eq!(runner.calls_matching("dnf install"), 1);
        assert_eq!(runner.calls_matching("systemctl enable --now crond"), 1);
        assert_eq!(runner.calls_matching("systemctl enable --now atd"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn apt_hosts_get_debian_package_and_service_names() {
        let runner = ScriptedRunner::new();
        for program in ["docker", "crontab", "dnf", "yum"] {
            missing(&runner, program);
        }
        let engine = FakeEngine::new(992);

        prepare(&config(), &runner, &engine).await.unwrap();

        assert_eq!(runner.calls_matching("apt-get install -y docker.io cron"), 1);
        assert_eq!(runner.calls_matching("systemctl enable --now cron"), 1);
        assert_eq!(runner.calls_matching("systemctl enable --now crond"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_at_without_package_manager_fails_before_ping() {
        let runner = ScriptedRunner::new();
        for program in ["at", "dnf", "yum", "apt-get"] {
            missing(&runner, program);
        }
        let engine = FakeEngine::new(992);

        let err = prepare(&config(), &runner, &engine).await.unwrap_err();

        assert!(matches!(err, BootstrapError::RuntimeInstall(ref m) if m.starts_with("at not installed")));
        assert_eq!(engine.with_state(|s| s.pings), 0);
    }
}
