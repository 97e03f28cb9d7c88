//! Log source layout: one append-only `<deployment_id>.log` file per
//! deployment inside a single directory. The engine only ever reads these.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::line::DeploymentId;

/// File extension of deployment log sources.
pub const LOG_EXTENSION: &str = "log";

#[derive(Debug, Clone)]
pub struct LogDirectory {
    root: PathBuf,
}

impl LogDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the log source for `deployment`.
    pub fn path_for(&self, deployment: &DeploymentId) -> PathBuf {
        self.root.join(format!("{deployment}.{LOG_EXTENSION}"))
    }

    /// Create the directory (and parents) if missing.
    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Deployments that currently have a log source, sorted.
    ///
    /// A missing directory yields an empty list.
    pub async fn deployments(&self) -> std::io::Result<Vec<DeploymentId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(id) = DeploymentId::parse(stem) {
                found.push(id);
            }
        }
        found.sort();
        Ok(found)
    }
}
