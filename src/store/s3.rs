use super::{StateStore, StoreLocation};
use crate::errors::StoreError;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Object storage driven through the aws CLI.
pub struct S3Store {
    bucket: String,
    prefix: String,
    location: StoreLocation,
    runner: Arc<dyn CommandRunner>,
}

impl S3Store {
    pub fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let bucket = bucket.into();
        let prefix = prefix.into();
        Self {
            location: StoreLocation::S3 {
                bucket: bucket.clone(),
                prefix: prefix.clone(),
            },
            bucket,
            prefix,
            runner,
        }
    }

    fn uri(&self) -> String {
        StoreLocation::s3_uri(&self.bucket, &self.prefix)
    }

    async fn aws(&self, spec: CommandSpec) -> Result<CommandOutput, StoreError> {
        let output = self.runner.run(&spec).await.map_err(StoreError::Spawn)?;
        if !output.success() {
            return Err(StoreError::CommandFailed {
                command: spec.display(),
                exit_code: output.exit_code,
                stderr: output.summary(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl StateStore for S3Store {
    fn location(&self) -> &StoreLocation {
        &self.location
    }

    async fn has_objects(&self) -> Result<bool, StoreError> {
        let output = self
            .aws(
                CommandSpec::new("aws")
                    .args(["s3api", "list-objects-v2", "--bucket", self.bucket.as_str()])
                    .arg("--prefix")
                    .arg(format!("{}/", self.prefix))
                    .args(["--max-items", "1"])
                    .args(["--query", "Contents[0].Key", "--output", "text"])
                    .with_timeout(QUERY_TIMEOUT),
            )
            .await?;

        let key = output.stdout.trim();
        Ok(!key.is_empty() && key != "None")
    }

    async fn pull_into(&self, dir: &Path) -> Result<(), StoreError> {
        self.aws(
            CommandSpec::new("aws")
                .args(["s3", "cp"])
                .arg(self.uri())
                .arg(dir.to_string_lossy())
                .args(["--recursive", "--only-show-errors"])
                .with_timeout(TRANSFER_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    async fn push_mirror(&self, dir: &Path) -> Result<(), StoreError> {
        self.aws(
            CommandSpec::new("aws")
                .args(["s3", "sync"])
                .arg(dir.to_string_lossy())
                .arg(self.uri())
                .args(["--delete", "--only-show-errors"])
                .with_timeout(TRANSFER_TIMEOUT),
        )
        .await?;
        Ok(())
    }
}
