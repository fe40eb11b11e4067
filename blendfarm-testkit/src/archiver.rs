use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use blendfarm::{Archiver, FarmError};
use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub struct ArchiveRecord {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// [`Archiver`] that writes a placeholder file and records each call.
#[derive(Clone, Debug, Default)]
pub struct CountingArchiver {
    calls: Arc<Mutex<Vec<ArchiveRecord>>>,
}

impl CountingArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ArchiveRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Archiver for CountingArchiver {
    async fn archive(&self, source: &Path, destination: &Path) -> Result<(), FarmError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, b"archive").await?;
        self.calls.lock().push(ArchiveRecord {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });
        Ok(())
    }
}
