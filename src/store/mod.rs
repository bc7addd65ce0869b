//! Collaborator seams for the versioned chunked-array store.
//!
//! The backing store provides atomic multi-chunk commits and chunk-level
//! write isolation; this layer only describes the operations the streaming
//! engine consumes. `local` is a filesystem-backed implementation with
//! temp+rename commit semantics; `blob` (feature `azure`) lists real object
//! storage prefixes for discovery.

pub mod local;

#[cfg(feature = "azure")]
pub mod blob;

use crate::error::Result;
use crate::model::{DataClass, DatasetSchema, RecordBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Identifier of one transactional commit in the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Append,
}

/// Lists raw blob paths under a prefix. Split out from [`ChunkStore`] so a
/// listing-only backend (object storage) can drive discovery.
#[async_trait]
pub trait PathLister: Send + Sync {
    /// Raw dataset paths under `prefix`. An empty result is not an error;
    /// `BackendUnreachable` means listing itself could not complete after
    /// the backend's own retry policy.
    async fn list_paths(&self, prefix: &str) -> Result<Vec<String>>;
}

/// The versioned chunked-array store collaborator.
#[async_trait]
pub trait ChunkStore: PathLister {
    /// View this store as its listing facet.
    fn as_lister(&self) -> &dyn PathLister;

    /// Open an existing dataset. Fails with `RepositoryMissing` if the path
    /// has no dataset, `ConflictingWriter` if another writer holds the
    /// transaction (append mode only).
    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn StoreSession>>;

    /// Create a new dataset at `path`. Nothing becomes visible to readers
    /// until the first commit.
    async fn create(&self, path: &str, schema: &DatasetSchema) -> Result<Box<dyn StoreSession>>;
}

/// One open read or append session against a dataset.
///
/// A session dropped without commit leaves no partial chunks visible;
/// retries may replay the entire write-and-commit unconditionally.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Variable set, dimension layout and attributes of the dataset.
    async fn schema(&self) -> Result<DatasetSchema>;

    /// Last coordinate already written for `class`, or `None` when the
    /// class has no entries yet. Tracked per class even when two classes
    /// share a dimension name in the schema, so each class keeps its own
    /// independent mark. Always the exact coordinate value, never a coarser
    /// proxy.
    async fn read_last_coordinate(&self, class: DataClass) -> Result<Option<DateTime<Utc>>>;

    /// Stage one chunk of records. Append mode only.
    async fn write_chunk(&mut self, batch: &RecordBatch) -> Result<()>;

    /// Atomically publish all staged chunks under one commit.
    async fn commit(self: Box<Self>, message: &str) -> Result<CommitId>;
}
