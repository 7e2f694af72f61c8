//! Snapshot persistence collaborator.
//!
//! A session loads its initial content through a [`SnapshotStore`] and hands
//! the rendered text back when saving. The store is authoritative only for
//! the content it was given; the replicated state lives in memory.
//!
//! Two implementations are provided: [`MemorySnapshotStore`] for tests and
//! embedding, and [`FileSnapshotStore`] which keeps one JSON file per document.

use crate::state_vector::StateVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Result type for persistence operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by snapshot stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Document id cannot be mapped to storage
    #[error("Invalid document id: {0}")]
    InvalidDocumentId(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Internal storage error
    #[error("Internal storage error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

/// Persisted state of one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    /// Rendered text
    pub content: String,
    /// State vector of the replica that produced `content`
    #[serde(default)]
    pub state_vector: StateVector,
    pub updated_at: DateTime<Utc>,
}

impl DocumentSnapshot {
    pub fn new(content: impl Into<String>, state_vector: StateVector) -> Self {
        Self {
            content: content.into(),
            state_vector,
            updated_at: Utc::now(),
        }
    }
}

/// Storage backend for document snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot of a document, or `None` if it was never saved.
    fn load_snapshot(&self, document_id: &str) -> StorageResult<Option<DocumentSnapshot>>;

    /// Replace the stored snapshot of a document.
    fn save_snapshot(&self, document_id: &str, snapshot: &DocumentSnapshot) -> StorageResult<()>;
}

/// In-memory snapshot store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    documents: RwLock<HashMap<String, DocumentSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one document.
    pub fn with_document(document_id: impl Into<String>, content: impl Into<String>) -> Self {
        let store = Self::new();
        if let Ok(mut documents) = store.documents.write() {
            documents.insert(
                document_id.into(),
                DocumentSnapshot::new(content, StateVector::new()),
            );
        }
        store
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load_snapshot(&self, document_id: &str) -> StorageResult<Option<DocumentSnapshot>> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StorageError::InternalError("lock poisoned".into()))?;
        Ok(documents.get(document_id).cloned())
    }

    fn save_snapshot(&self, document_id: &str, snapshot: &DocumentSnapshot) -> StorageResult<()> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| StorageError::InternalError("lock poisoned".into()))?;
        documents.insert(document_id.to_string(), snapshot.clone());
        Ok(())
    }
}

/// Snapshot store writing `{root}/{document_id}.json`.
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// never leaves a half-written snapshot behind.
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, document_id: &str) -> StorageResult<PathBuf> {
        let valid = !document_id.is_empty()
            && document_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidDocumentId(document_id.to_string()));
        }
        Ok(self.root.join(format!("{document_id}.json")))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load_snapshot(&self, document_id: &str) -> StorageResult<Option<DocumentSnapshot>> {
        let path = self.snapshot_path(document_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save_snapshot(&self, document_id: &str, snapshot: &DocumentSnapshot) -> StorageResult<()> {
        let path = self.snapshot_path(document_id)?;
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(snapshot)?;
        fs::write(&temp_path, content)?;
        // Atomic rename
        fs::rename(temp_path, path)?;
        Ok(())
    }
}
