//! Local JSON file backend

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use super::{Snapshot, StorageBackend, StorageResult};
use crate::visitors::VisitorAggregate;

/// Stores the snapshot as a single pretty-printed JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the target, so
/// readers never see a partially written snapshot.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self) -> StorageResult<Option<VisitorAggregate>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Snapshot::from_json(&raw)?.into_aggregate()))
    }

    async fn save(&self, aggregate: &VisitorAggregate) -> StorageResult<()> {
        let content = Snapshot::capture(aggregate).to_json()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        fs::write(&temp, content).await?;
        fs::rename(&temp, &self.path).await?;

        debug!("Wrote visitor snapshot to {}", self.path.display());
        Ok(())
    }
}
