//! Durable controller state.
//!
//! The controller serializes its whole state after every mutating event and
//! hands the blob to a [`StateStore`]. On startup the latest blob is restored
//! and reconciled against the nodes it names.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Node, Partition};
use crate::error::{Result, SchedError};
use crate::scheduler::allocation::AllocationRecord;
use crate::scheduler::job::Job;

pub const STATE_VERSION: u32 = 1;

/// Versioned state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub next_job_id: u64,
    pub partitions: Vec<Partition>,
    pub nodes: Vec<Node>,
    pub jobs: Vec<Job>,
    pub allocations: Vec<AllocationRecord>,
}

impl PersistedState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let state: PersistedState = serde_json::from_slice(blob)?;
        if state.version != STATE_VERSION {
            return Err(SchedError::Serialization(format!(
                "unsupported state version {} (expected {})",
                state.version, STATE_VERSION
            )));
        }
        Ok(state)
    }
}

pub trait StateStore: Send + Sync {
    /// The last saved blob, or `None` when nothing was saved yet.
    fn load(&self) -> Result<Option<Vec<u8>>>;

    fn save(&self, blob: &[u8]) -> Result<()>;
}

/// Stores state in a single file. Writes go to a sibling temp file that is
/// renamed over the target, so a crash never leaves a torn file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
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

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, blob: &[u8]) -> Result<()> {
        let tmp = self.temp_path();
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        self.blob
            .lock()
            .map(|b| b.clone())
            .map_err(|_| SchedError::Io("state store lock poisoned".to_string()))
    }

    fn save(&self, blob: &[u8]) -> Result<()> {
        let mut slot = self
            .blob
            .lock()
            .map_err(|_| SchedError::Io("state store lock poisoned".to_string()))?;
        *slot = Some(blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state() -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            next_job_id: 7,
            partitions: Vec::new(),
            nodes: Vec::new(),
            jobs: Vec::new(),
            allocations: Vec::new(),
        }
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn file_store_replaces_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        store.save(b"first").unwrap();
        store.save(b"second").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some(&b"second"[..]));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn rejects_other_versions() {
        let mut state = empty_state();
        state.version = 99;
        let blob = serde_json::to_vec(&state).unwrap();
        assert!(matches!(
            PersistedState::from_bytes(&blob),
            Err(SchedError::Serialization(_))
        ));
        assert!(matches!(
            PersistedState::from_bytes(b"not json"),
            Err(SchedError::Serialization(_))
        ));
    }

    #[test]
    fn memory_store_holds_latest() {
        let store = MemoryStateStore::new();
        assert!(store.load().unwrap().is_none());
        let blob = empty_state().to_bytes().unwrap();
        store.save(&blob).unwrap();
        let restored = PersistedState::from_bytes(&store.load().unwrap().unwrap()).unwrap();
        assert_eq!(restored.next_job_id, 7);
    }
}
