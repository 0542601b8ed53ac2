//! Repository seam for queue and history persistence.
//!
//! The queue manager only depends on [`QueueRepository`]. The shipped
//! implementation keeps one JSON document on disk, written to a temporary
//! sibling and renamed into place so a crash never leaves a torn file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::error::QueueError;
use super::history::HistoryRecord;
use super::item::Item;

const STATE_VERSION: u32 = 1;

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedQueue {
    #[serde(default)]
    pub version: u32,
    /// Queued items in service order; an interrupted active item comes first.
    #[serde(default)]
    pub queued: Vec<Item>,
    /// Oldest first.
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

/// Data-access contract for queue persistence.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Loads the saved state; an absent store yields the default.
    async fn load(&self) -> Result<PersistedQueue, QueueError>;

    /// Replaces the saved state.
    async fn save(&self, state: &PersistedQueue) -> Result<(), QueueError>;
}

/// JSON file repository.
///
/// Clones share one writer lock, so saves never interleave on the
/// temporary file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    writer: Arc<Mutex<()>>,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl QueueRepository for JsonFileStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<PersistedQueue, QueueError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no saved queue state");
                return Ok(PersistedQueue::default());
            }
            Err(e) => return Err(QueueError::persistence_io(&self.path, &e)),
        };
        let state: PersistedQueue = serde_json::from_str(&raw)
            .map_err(|e| QueueError::persistence_corrupt(&self.path, &e))?;
        if state.version > STATE_VERSION {
            warn!(
                version = state.version,
                supported = STATE_VERSION,
                "queue state written by a newer version"
            );
        }
        debug!(
            queued = state.queued.len(),
            history = state.history.len(),
            "queue state restored"
        );
        Ok(state)
    }

    async fn save(&self, state: &PersistedQueue) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| QueueError::persistence_io(parent, &e))?;
        }
        let mut to_write = state.clone();
        to_write.version = STATE_VERSION;
        let json = serde_json::to_vec_pretty(&to_write)
            .map_err(|e| QueueError::persistence_corrupt(&self.path, &e))?;

        let _writer = self.writer.lock().await;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| QueueError::persistence_io(&temp, &e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| QueueError::persistence_io(&self.path, &e))
    }
}
