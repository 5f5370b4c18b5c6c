//! Remote State Store.
//!
//! The store holds the last-known-good snapshot of the state directory under
//! a fixed prefix. Two operations matter:
//! - `pull_into` is a non-destructive recursive copy from the store
//! - `push_mirror` makes the store an exact mirror of local state, deleting
//!   remote objects that no longer exist locally

mod dir;
mod s3;

pub use dir::DirStore;
pub use s3::S3Store;

use crate::errors::StoreError;
use crate::exec::CommandRunner;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Where the snapshot lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    S3 { bucket: String, prefix: String },
    Dir(PathBuf),
}

impl StoreLocation {
    /// `s3://bucket/prefix/` form used by the aws CLI.
    pub fn s3_uri(bucket: &str, prefix: &str) -> String {
        format!("s3://{}/{}/", bucket, prefix)
    }
}

impl FromStr for StoreLocation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidLocation(s.to_string());

        if let Some(rest) = s.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').ok_or_else(invalid)?;
            let prefix = prefix.trim_matches('/');
            if bucket.is_empty() || prefix.is_empty() {
                return Err(invalid());
            }
            return Ok(StoreLocation::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }

        if let Some(path) = s.strip_prefix("file://") {
            let path = PathBuf::from(path);
            if !path.is_absolute() {
                return Err(invalid());
            }
            return Ok(StoreLocation::Dir(path));
        }

        Err(invalid())
    }
}

impl std::fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLocation::S3 { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
            StoreLocation::Dir(path) => write!(f, "file://{}", path.display()),
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    fn location(&self) -> &StoreLocation;

    /// Whether any object exists under the prefix.
    async fn has_objects(&self) -> Result<bool, StoreError>;

    /// Recursive, non-destructive copy of the snapshot into `dir`.
    async fn pull_into(&self, dir: &Path) -> Result<(), StoreError>;

    /// Mirror `dir` to the store, deleting remote objects absent locally.
    async fn push_mirror(&self, dir: &Path) -> Result<(), StoreError>;
}

/// Build the store implementation for `location`.
pub fn open_store(location: &StoreLocation, runner: Arc<dyn CommandRunner>) -> Arc<dyn StateStore> {
    match location {
        StoreLocation::S3 { bucket, prefix } => Arc::new(S3Store::new(bucket, prefix, runner)),
        StoreLocation::Dir(root) => Arc::new(DirStore::new(root.clone())),
    }
}
