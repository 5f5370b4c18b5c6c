use super::{StateStore, StoreLocation};
use crate::errors::StoreError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A store rooted at a local or mounted directory.
pub struct DirStore {
    root: PathBuf,
    location: StoreLocation,
}

impl DirStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            location: StoreLocation::Dir(root.clone()),
            root,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Relative paths of every regular file under `root`.
fn relative_files(root: &Path) -> Result<BTreeSet<PathBuf>, StoreError> {
    let mut files = BTreeSet::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| StoreError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file()
            && let Ok(rel) = entry.path().strip_prefix(root)
        {
            files.insert(rel.to_path_buf());
        }
    }
    Ok(files)
}

/// Copy every file under `from` into `to`, overwriting existing files.
fn copy_tree(from: &Path, to: &Path) -> Result<(), StoreError> {
    for rel in relative_files(from)? {
        let src = from.join(&rel);
        let dst = to.join(&rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::copy(&src, &dst).map_err(io_err(&src))?;
    }
    Ok(())
}

/// Remove directories under `root` left empty by deletions, deepest first.
fn prune_empty_dirs(root: &Path) {
    let dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    for dir in dirs {
        // Fails on non-empty directories, which is what we want.
        let _ = std::fs::remove_dir(&dir);
    }
}

#[async_trait]
impl StateStore for DirStore {
    fn location(&self) -> &StoreLocation {
        &self.location
    }

    async fn has_objects(&self) -> Result<bool, StoreError> {
        Ok(!relative_files(&self.root)?.is_empty())
    }

    async fn pull_into(&self, dir: &Path) -> Result<(), StoreError> {
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        copy_tree(&self.root, dir)
    }

    async fn push_mirror(&self, dir: &Path) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
        let local = relative_files(dir)?;
        for stale in relative_files(&self.root)?.difference(&local) {
            let path = self.root.join(stale);
            std::fs::remove_file(&path).map_err(io_err(&path))?;
        }
        prune_empty_dirs(&self.root);
        copy_tree(dir, &self.root)
    }
}
