//! State Restorer.
//!
//! Pulls the last snapshot into the state directory when the store has one.
//! Store failures never abort the run: the restorer logs them and falls back
//! to a fresh start.

use super::RunState;
use crate::config::Config;
use crate::errors::BootstrapError;
use crate::store::StateStore;
use glob::{MatchOptions, Pattern};
use serde::Serialize;
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// The store holds nothing under the prefix
    Fresh,
    Restored { executables_fixed: usize },
    /// The store could not be read; starting fresh instead
    Fallback { reason: String },
}

pub async fn restore(
    config: &Config,
    store: &dyn StateStore,
    state: &mut RunState,
) -> Result<RestoreOutcome, BootstrapError> {
    let dir = &config.host.state_dir;
    std::fs::create_dir_all(dir).map_err(|source| BootstrapError::Io {
        path: dir.clone(),
        source,
    })?;

    tracing::info!(store = %store.location(), "Checking for a prior snapshot");
    match store.has_objects().await {
        Ok(false) => {
            tracing::info!("No snapshot found, starting fresh");
            return Ok(RestoreOutcome::Fresh);
        }
        Ok(true) => {}
        Err(e) => {
            tracing::warn!("Could not query the store, starting fresh: {}", e);
            return Ok(RestoreOutcome::Fallback {
                reason: e.to_string(),
            });
        }
    }

    let before = top_level_entries(dir);
    tracing::info!(dir = %dir.display(), "Restoring snapshot");
    if let Err(e) = store.pull_into(dir).await {
        tracing::warn!("Restore failed, falling back to a fresh start: {}", e);
        discard_partial_pull(dir, &before);
        return Ok(RestoreOutcome::Fallback {
            reason: e.to_string(),
        });
    }

    let executables_fixed = mark_executables(dir, &config.restore.executable_patterns)?;
    if executables_fixed > 0 {
        tracing::info!(count = executables_fixed, "Restored executable bits");
    }
    state.restore_occurred = true;
    Ok(RestoreOutcome::Restored { executables_fixed })
}

fn top_level_entries(dir: &Path) -> HashSet<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

/// Remove whatever a failed pull left behind, keeping entries that predate it.
fn discard_partial_pull(dir: &Path, before: &HashSet<PathBuf>) {
    for path in top_level_entries(dir).difference(before) {
        let result = if path.is_dir() && !path.is_symlink() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), "Could not discard partial restore: {}", e);
        }
    }
}

/// Add execute bits to files under `dir` whose relative path matches a pattern.
pub fn mark_executables(dir: &Path, patterns: &[String]) -> Result<usize, BootstrapError> {
    let patterns: Vec<Pattern> = patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();
    if patterns.is_empty() {
        return Ok(0);
    }
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };

    let mut fixed = 0;
    for entry in WalkDir::new(dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if !patterns.iter().any(|p| p.matches_path_with(rel, options)) {
            continue;
        }
        let io_err = |source| BootstrapError::Io {
            path: entry.path().to_path_buf(),
            source,
        };
        let mut perms = entry.metadata().map_err(|e| io_err(e.into()))?.permissions();
        let mode = perms.mode();
        if mode & 0o111 != 0o111 {
            perms.set_mode(mode | 0o111);
            std::fs::set_permissions(entry.path(), perms).map_err(io_err)?;
            fixed += 1;
        }
    }
    Ok(fixed)
}

/// Recursively hand `dir` to the workload identity. Symlinks are not followed.
pub fn apply_ownership(dir: &Path, uid: u32, gid: u32) -> Result<usize, BootstrapError> {
    let mut changed = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| BootstrapError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid)).map_err(|source| {
            BootstrapError::Io {
                path: entry.path().to_path_buf(),
                source,
            }
        })?;
        changed += 1;
    }
    tracing::debug!(dir = %dir.display(), uid, gid, entries = changed, "Ownership applied");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnvilToml;
    use crate::testing::FakeStore;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    fn config(state_dir: &Path) -> Config {
        let mut toml = AnvilToml::default();
        toml.store.location = Some("s3://ci-state/jenkins_home".into());
        toml.host.state_dir = state_dir.to_path_buf();
        Config::from_toml(toml, None).unwrap()
    }

    #[tokio::test]
    async fn empty_store_is_a_fresh_start() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("jenkins_home");
        let mut state = RunState::default();

        let outcome = restore(&config(&state_dir), &FakeStore::new(), &mut state)
            .await
            .unwrap();

        assert_eq!(outcome, RestoreOutcome::Fresh);
        assert!(!state.restore_occurred);
        assert!(state_dir.is_dir());
    }

    #[tokio::test]
    async fn snapshot_is_pulled_and_flag_set() {
        let dir = tempdir().unwrap();
        let store = FakeStore::new()
            .with_object("config.xml", "<hudson/>")
            .with_object("tools/terraform/bin/terraform", "ELF")
            .with_object("jobs/build/config.xml", "<project/>");
        let mut state = RunState::default();

        let outcome = restore(&config(dir.path()), &store, &mut state).await.unwrap();

        assert!(state.restore_occurred);
        assert_eq!(outcome, RestoreOutcome::Restored { executables_fixed: 1 });
        for (rel, content) in store.objects.lock().unwrap().iter() {
            assert_eq!(&std::fs::read_to_string(dir.path().join(rel)).unwrap(), content);
        }
    }

    #[tokio::test]
    async fn pull_failure_falls_back_to_empty_directory() {
        let dir = tempdir().unwrap();
        let mut store = FakeStore::new().with_object("config.xml", "<hudson/>");
        store.fail_pull = true;
        let mut state = RunState::default();

        let outcome = restore(&config(dir.path()), &store, &mut state).await.unwrap();

        assert!(matches!(outcome, RestoreOutcome::Fallback { .. }));
        assert!(!state.restore_occurred);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn query_failure_falls_back() {
        let dir = tempdir().unwrap();
        let mut store = FakeStore::new();
        store.fail_query = true;
        let mut state = RunState::default();

        let outcome = restore(&config(dir.path()), &store, &mut state).await.unwrap();

        assert!(matches!(outcome, RestoreOutcome::Fallback { ref reason } if reason.contains("endpoint")));
        assert!(!state.restore_occurred);
    }

    #[test]
    fn discard_keeps_preexisting_entries() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
        let before = top_level_entries(dir.path());
        std::fs::create_dir_all(dir.path().join("jobs/half")).unwrap();
        std::fs::write(dir.path().join("partial.xml"), "<hud").unwrap();

        discard_partial_pull(dir.path(), &before);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[test]
    fn marks_only_matching_files_executable() {
        let dir = tempdir().unwrap();
        let files = [
            "tools/terraform/bin/terraform",
            "tools/hudson.tasks.Maven/apache-maven/bin/mvn",
            "tools/scripts/setup.sh",
            "tools/terraform/README.txt",
            "config.xml",
        ];
        for rel in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "x").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        }

        let fixed = mark_executables(
            dir.path(),
            &["tools/**/bin/*".to_string(), "tools/**/*.sh".to_string()],
        )
        .unwrap();
        assert_eq!(fixed, 3);

        let mode = |rel: &str| {
            std::fs::metadata(dir.path().join(rel)).unwrap().permissions().mode() & 0o777
        };
        assert_eq!(mode("tools/terraform/bin/terraform"), 0o755);
        assert_eq!(mode("tools/scripts/setup.sh"), 0o755);
        assert_eq!(mode("tools/terraform/README.txt"), 0o644);
        assert_eq!(mode("config.xml"), 0o644);

        // Already executable files are left alone.
        assert_eq!(
            mark_executables(dir.path(), &["tools/**/bin/*".to_string()]).unwrap(),
            0
        );
    }

    #[test]
    fn ownership_walks_the_whole_tree() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("jobs/build")).unwrap();
        std::fs::write(dir.path().join("jobs/build/config.xml"), "x").unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();

        // Chowning to our own identity is always permitted.
        let changed = apply_ownership(dir.path(), meta.uid(), meta.gid()).unwrap();

        assert_eq!(changed, 4);
        let file = std::fs::metadata(dir.path().join("jobs/build/config.xml")).unwrap();
        assert_eq!((file.uid(), file.gid()), (meta.uid(), meta.gid()));
    }
}
