//! Test doubles for the orchestrator's collaborators.

use crate::engine::{ContainerEngine, ContainerSpec, ExecUser};
use crate::errors::{EngineError, StoreError};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::metadata::HostMetadata;
use crate::schedule::{CronEntry, JobScheduler, OneShotJob};
use crate::store::{StateStore, StoreLocation};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Answers commands by display-prefix; unmatched commands succeed silently.
///
/// Each prefix holds a queue of responses. The last response is sticky.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, VecDeque<std::io::Result<CommandOutput>>)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.push(prefix, Ok(output));
    }

    pub fn fail_spawn(&self, prefix: &str) {
        self.push(
            prefix,
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "not found")),
        );
    }

    fn push(&self, prefix: &str, response: std::io::Result<CommandOutput>) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(response),
            None => rules.push((prefix.to_string(), VecDeque::from([response]))),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.display().starts_with(prefix))
            .count()
    }
}

fn clone_response(r: &std::io::Result<CommandOutput>) -> std::io::Result<CommandOutput> {
    match r {
        Ok(out) => Ok(out.clone()),
        Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let display = spec.display();
        let mut rules = self.rules.lock().unwrap();
        // Longest matching prefix wins.
        let rule = rules
            .iter_mut()
            .filter(|(p, _)| display.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len());
        match rule {
            Some((_, queue)) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default())),
            Some((_, queue)) => queue
                .front()
                .map(clone_response)
                .unwrap_or_else(|| Ok(CommandOutput::default())),
            None => Ok(CommandOutput::default()),
        }
    }
}

type RunHook = Box<dyn Fn() + Send + Sync>;

/// Mutable state behind `FakeEngine`.
pub struct FakeEngineState {
    /// Pings fail until this many have been attempted
    pub ping_failures: u32,
    pub pings: u32,
    pub pull_failures: u32,
    pub pulls: u32,
    /// The container never comes up, even after restart
    pub never_runs: bool,
    /// The container is down after `run` but comes up on restart
    pub down_until_restart: bool,
    pub running: bool,
    pub runs: Vec<ContainerSpec>,
    pub removes: u32,
    pub restarts: u32,
    /// In-container /etc/group: (name, gid, members)
    pub groups: Vec<(String, u32, Vec<String>)>,
    /// Group gids of the running workload process, fixed at (re)start
    pub process_gids: Vec<u32>,
    pub socket_gid: u32,
    pub workload_user: String,
    /// Install scripts containing this substring fail
    pub failing_script: Option<String>,
    pub execs: Vec<(ExecUser, Vec<String>)>,
}

/// An engine with one container and a tiny model of its group database.
pub struct FakeEngine {
    pub state: Mutex<FakeEngineState>,
    on_run: Mutex<Option<RunHook>>,
}

impl FakeEngine {
    pub fn new(socket_gid: u32) -> Self {
        Self {
            state: Mutex::new(FakeEngineState {
                ping_failures: 0,
                pings: 0,
                pull_failures: 0,
                pulls: 0,
                never_runs: false,
                down_until_restart: false,
                running: false,
                runs: Vec::new(),
                removes: 0,
                restarts: 0,
                // The image ships its own docker group with a different gid.
                groups: vec![
                    ("jenkins".to_string(), 1000, vec![]),
                    ("docker".to_string(), 101, vec![]),
                ],
                process_gids: Vec::new(),
                socket_gid,
                workload_user: "jenkins".to_string(),
                failing_script: None,
                execs: Vec::new(),
            }),
            on_run: Mutex::new(None),
        }
    }

    /// Called after every successful `run`, e.g. to simulate the workload writing files.
    pub fn on_run(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_run.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeEngineState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn groups_named(&self, name: &str) -> Vec<u32> {
        self.with_state(|s| {
            s.groups
                .iter()
                .filter(|(n, _, _)| n == name)
                .map(|(_, gid, _)| *gid)
                .collect()
        })
    }
}

impl FakeEngineState {
    fn refresh_process_gids(&mut self) {
        let user = self.workload_user.clone();
        self.process_gids = self
            .groups
            .iter()
            .filter(|(_, _, members)| members.contains(&user))
            .map(|(_, gid, _)| *gid)
            .collect();
    }

    fn groupadd(&mut self, gid: &str, name: &str, non_unique: bool) -> CommandOutput {
        if self.groups.iter().any(|(n, _, _)| n == name) {
            return CommandOutput::failed(9, format!("groupadd: group '{}' already exists", name));
        }
        let Ok(gid) = gid.parse::<u32>() else {
            return CommandOutput::failed(3, "invalid gid");
        };
        if !non_unique && self.groups.iter().any(|(_, g, _)| *g == gid) {
            return CommandOutput::failed(4, format!("groupadd: GID '{}' already exists", gid));
        }
        self.groups.push((name.to_string(), gid, vec![]));
        CommandOutput::ok("")
    }

    fn exec(&mut self, user: &ExecUser, argv: &[String]) -> CommandOutput {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["true"] => CommandOutput::ok(""),
            ["getent", "group", name] => {
                match self.groups.iter().find(|(n, _, _)| n == name) {
                    Some((n, gid, members)) => {
                        CommandOutput::ok(format!("{}:x:{}:{}\n", n, gid, members.join(",")))
                    }
                    None => CommandOutput::failed(2, ""),
                }
            }
            ["groupdel", name] => {
                let before = self.groups.len();
                self.groups.retain(|(n, _, _)| n != name);
                if self.groups.len() == before {
                    CommandOutput::failed(6, format!("groupdel: group '{}' does not exist", name))
                } else {
                    CommandOutput::ok("")
                }
            }
            ["groupadd", "-o", "-g", gid, name] => self.groupadd(gid, name, true),
            ["groupadd", "-g", gid, name] => self.groupadd(gid, name, false),
            ["usermod", "-aG", group, member] => {
                match self.groups.iter_mut().find(|(n, _, _)| n == group) {
                    Some((_, _, members)) => {
                        if !members.iter().any(|m| m == member) {
                            members.push(member.to_string());
                        }
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(6, format!("usermod: group '{}' does not exist", group)),
                }
            }
            ["id", "-nG", member] => {
                let names: Vec<&str> = self
                    .groups
                    .iter()
                    .filter(|(n, _, members)| n == member || members.iter().any(|m| m == member))
                    .map(|(n, _, _)| n.as_str())
                    .collect();
                CommandOutput::ok(format!("{}\n", names.join(" ")))
            }
            ["docker", "ps", ..] => {
                let allowed = *user == ExecUser::Root || self.process_gids.contains(&self.socket_gid);
                if allowed {
                    CommandOutput::ok("CONTAINER ID   IMAGE   NAMES\n")
                } else {
                    CommandOutput::failed(
                        1,
                        "permission denied while trying to connect to the Docker daemon socket",
                    )
                }
            }
            ["sh", "-c", script] => match &self.failing_script {
                Some(bad) if script.contains(bad.as_str()) => {
                    CommandOutput::failed(127, format!("{}: not found", bad))
                }
                _ => CommandOutput::ok(format!("ran: {}\n", script)),
            },
            _ => CommandOutput::failed(127, format!("unknown command {:?}", argv)),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.with_state(|s| {
            s.pings += 1;
            if s.pings <= s.ping_failures {
                Err(EngineError::Api("connection refused".into()))
            } else {
                Ok(())
            }
        })
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        self.with_state(|s| {
            s.pulls += 1;
            if s.pulls <= s.pull_failures {
                Err(EngineError::CommandFailed {
                    command: format!("docker pull {}", image),
                    exit_code: 1,
                    stderr: "net/http: TLS handshake timeout".into(),
                })
            } else {
                Ok(())
            }
        })
    }

    async fn remove(&self, _name: &str) -> Result<(), EngineError> {
        self.with_state(|s| {
            s.removes += 1;
            s.running = false;
        });
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        self.with_state(|s| {
            s.runs.push(spec.clone());
            s.running = !s.never_runs && !s.down_until_restart;
            s.refresh_process_gids();
        });
        if let Some(hook) = self.on_run.lock().unwrap().as_ref() {
            hook();
        }
        Ok(())
    }

    async fn is_running(&self, _name: &str) -> Result<bool, EngineError> {
        Ok(self.with_state(|s| s.running))
    }

    async fn restart(&self, _name: &str) -> Result<(), EngineError> {
        self.with_state(|s| {
            s.restarts += 1;
            s.running = !s.never_runs;
            s.refresh_process_gids();
        });
        Ok(())
    }

    async fn exec(
        &self,
        _name: &str,
        user: &ExecUser,
        argv: &[String],
    ) -> Result<CommandOutput, EngineError> {
        Ok(self.with_state(|s| {
            s.execs.push((user.clone(), argv.to_vec()));
            if !s.running {
                return CommandOutput::failed(1, "container is not running");
            }
            s.exec(user, argv)
        }))
    }
}

/// In-memory store with injectable failures.
pub struct FakeStore {
    location: StoreLocation,
    pub objects: Mutex<BTreeMap<PathBuf, String>>,
    pub fail_query: bool,
    pub fail_pull: bool,
    pub fail_push: bool,
    pub pushes: Mutex<Vec<BTreeMap<PathBuf, String>>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            location: StoreLocation::S3 {
                bucket: "ci-state".into(),
                prefix: "jenkins_home".into(),
            },
            objects: Mutex::new(BTreeMap::new()),
            fail_query: false,
            fail_pull: false,
            fail_push: false,
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_object(self, rel: &str, content: &str) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(PathBuf::from(rel), content.to_string());
        self
    }

    fn failure(what: &str) -> StoreError {
        StoreError::CommandFailed {
            command: format!("aws s3 {}", what),
            exit_code: 1,
            stderr: "Could not connect to the endpoint URL".into(),
        }
    }
}

#[async_trait]
impl StateStore for FakeStore {
    fn location(&self) -> &StoreLocation {
        &self.location
    }

    async fn has_objects(&self) -> Result<bool, StoreError> {
        if self.fail_query {
            return Err(Self::failure("ls"));
        }
        Ok(!self.objects.lock().unwrap().is_empty())
    }

    async fn pull_into(&self, dir: &Path) -> Result<(), StoreError> {
        if self.fail_pull {
            return Err(Self::failure("cp"));
        }
        for (rel, content) in self.objects.lock().unwrap().iter() {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&path, content).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    async fn push_mirror(&self, dir: &Path) -> Result<(), StoreError> {
        if self.fail_push {
            return Err(Self::failure("sync"));
        }
        let mut snapshot = BTreeMap::new();
        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file()
                && let Ok(rel) = entry.path().strip_prefix(dir)
            {
                let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
                snapshot.insert(rel.to_path_buf(), content);
            }
        }
        *self.objects.lock().unwrap() = snapshot.clone();
        self.pushes.lock().unwrap().push(snapshot);
        Ok(())
    }
}

pub struct FakeMetadata {
    pub address: Option<IpAddr>,
    pub queries: Mutex<u32>,
}

impl FakeMetadata {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.parse().ok(),
            queries: Mutex::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            address: None,
            queries: Mutex::new(0),
        }
    }
}

#[async_trait]
impl HostMetadata for FakeMetadata {
    async fn public_address(&self) -> anyhow::Result<IpAddr> {
        *self.queries.lock().unwrap() += 1;
        self.address
            .ok_or_else(|| anyhow::anyhow!("metadata service unreachable"))
    }
}

#[derive(Default)]
pub struct FakeScheduler {
    pub recurring: Mutex<Vec<CronEntry>>,
    pub once: Mutex<Vec<OneShotJob>>,
    pub fail: bool,
}

#[async_trait]
impl JobScheduler for FakeScheduler {
    async fn install_recurring(&self, entry: &CronEntry) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("crontab: command not found");
        }
        let mut recurring = self.recurring.lock().unwrap();
        recurring.retain(|e| e.marker != entry.marker);
        recurring.push(entry.clone());
        Ok(())
    }

    async fn schedule_once(&self, job: &OneShotJob) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("at: command not found");
        }
        let mut once = self.once.lock().unwrap();
        once.retain(|j| j.marker != job.marker);
        once.push(job.clone());
        Ok(())
    }
}
