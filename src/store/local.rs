//! Filesystem-backed chunked store with transactional commit semantics.
//!
//! One dataset is a directory holding `manifest.json` plus chunk files under
//! `chunks/<class>/`. Readers only ever consult the manifest, and the
//! manifest is replaced with a temp-write + atomic rename, so a crashed or
//! abandoned append leaves nothing visible. A `.lock` file marks an open
//! writer; holding it reports `ConflictingWriter` to later openers.
//!
//! Used by the binary and by integration tests; the production deployment
//! points the same traits at the real versioned store.

use crate::error::{Result, StreamError};
use crate::model::{DataClass, DatasetSchema, RecordBatch};
use crate::store::{ChunkStore, CommitId, OpenMode, PathLister, StoreSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const MANIFEST: &str = "manifest.json";
const LOCK: &str = ".lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    schema: DatasetSchema,
    /// Last written coordinate value per data class. Keyed by class, not by
    /// dimension: minimal and waveform share the `timestamp` dimension in
    /// the schema but advance independently.
    last: BTreeMap<String, DateTime<Utc>>,
    commits: Vec<CommitRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    id: String,
    message: String,
    committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LocalChunkStore {
    root: PathBuf,
}

impl LocalChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dataset_dir(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_end_matches('/'))
    }

    fn collect_datasets(dir: &Path, rel: &str, out: &mut Vec<String>) -> std::io::Result<()> {
        if dir.join(MANIFEST).is_file() {
            out.push(rel.to_string());
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let child_rel = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            Self::collect_datasets(&entry.path(), &child_rel, out)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PathLister for LocalChunkStore {
    async fn list_paths(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.dataset_dir(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        Self::collect_datasets(&base, prefix.trim_end_matches('/'), &mut out)
            .map_err(|e| StreamError::BackendUnreachable(e.to_string()))?;
        Ok(out)
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    fn as_lister(&self) -> &dyn PathLister {
        self
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn StoreSession>> {
        let dir = self.dataset_dir(path);
        let manifest = read_manifest(&dir, path)?;
        let mut session = LocalSession {
            dir,
            path: path.to_string(),
            mode,
            manifest,
            staging: None,
            staged: Vec::new(),
            locked: false,
        };
        if mode == OpenMode::Append {
            session.acquire_lock()?;
            session.open_staging()?;
        }
        Ok(Box::new(session))
    }

    async fn create(&self, path: &str, schema: &DatasetSchema) -> Result<Box<dyn StoreSession>> {
        let dir = self.dataset_dir(path);
        if dir.join(MANIFEST).is_file() {
            return Err(StreamError::ConflictingWriter(format!(
                "{path}: dataset already exists"
            )));
        }
        std::fs::create_dir_all(&dir)?;
        let mut session = LocalSession {
            dir,
            path: path.to_string(),
            mode: OpenMode::Append,
            manifest: Manifest {
                schema: schema.clone(),
                last: BTreeMap::new(),
                commits: Vec::new(),
            },
            staging: None,
            staged: Vec::new(),
            locked: false,
        };
        session.acquire_lock()?;
        session.open_staging()?;
        // The manifest stays in memory until the first commit; an aborted
        // create leaves no dataset behind.
        Ok(Box::new(session))
    }
}

fn read_manifest(dir: &Path, path: &str) -> Result<Manifest> {
    let raw = match std::fs::read(dir.join(MANIFEST)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StreamError::RepositoryMissing(path.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&raw)?)
}

struct StagedChunk {
    class: DataClass,
    file_name: String,
    last: DateTime<Utc>,
}

struct LocalSession {
    dir: PathBuf,
    path: String,
    mode: OpenMode,
    manifest: Manifest,
    staging: Option<TempDir>,
    staged: Vec<StagedChunk>,
    locked: bool,
}

impl LocalSession {
    fn acquire_lock(&mut self) -> Result<()> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.dir.join(LOCK))
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                self.locked = true;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StreamError::ConflictingWriter(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open_staging(&mut self) -> Result<()> {
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.dir)?;
        self.staging = Some(staging);
        Ok(())
    }

    fn release_lock(&mut self) {
        if self.locked {
            let _ = std::fs::remove_file(self.dir.join(LOCK));
            self.locked = false;
        }
    }

    /// Last coordinate for `class` including chunks staged in this session
    /// but not yet committed.
    fn pending_last(&self, class: DataClass) -> Option<DateTime<Utc>> {
        let staged = self
            .staged
            .iter()
            .filter(|c| c.class == class)
            .map(|c| c.last)
            .max();
        let committed = self.manifest.last.get(class.as_str()).copied();
        staged.max(committed)
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        // Staging directory removal is handled by TempDir.
        self.release_lock();
    }
}

#[async_trait]
impl StoreSession for LocalSession {
    async fn schema(&self) -> Result<DatasetSchema> {
        Ok(self.manifest.schema.clone())
    }

    async fn read_last_coordinate(&self, class: DataClass) -> Result<Option<DateTime<Utc>>> {
        Ok(self.manifest.last.get(class.as_str()).copied())
    }

    async fn write_chunk(&mut self, batch: &RecordBatch) -> Result<()> {
        if self.mode != OpenMode::Append {
            return Err(StreamError::Config(
                "write_chunk on a read-only session".into(),
            ));
        }
        if batch.is_empty() {
            return Ok(());
        }
        let first = batch.timestamps[0];
        let last = *batch.timestamps.last().expect("non-empty batch");
        if let Some(existing) = self.pending_last(batch.class) {
            if first <= existing {
                return Err(StreamError::NonMonotonicAppend {
                    class: batch.class.as_str().to_string(),
                    detail: format!(
                        "chunk starts at {first} but {existing} is already written"
                    ),
                });
            }
        }

        let staging = self
            .staging
            .as_ref()
            .expect("append session has a staging dir");
        let file_name = format!("{}.bin", first.timestamp_millis());
        let class_dir = batch.class.as_str();
        std::fs::create_dir_all(staging.path().join(class_dir))?;
        std::fs::write(staging.path().join(class_dir).join(&file_name), &batch.payload)?;
        self.staged.push(StagedChunk {
            class: batch.class,
            file_name,
            last,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>, message: &str) -> Result<CommitId> {
        let mut this = *self;
        if this.mode != OpenMode::Append {
            return Err(StreamError::Config("commit on a read-only session".into()));
        }
        let staging = this
            .staging
            .take()
            .expect("append session has a staging dir");

        let committed_at = Utc::now();
        let mut hasher = DefaultHasher::new();
        message.hash(&mut hasher);
        committed_at.timestamp_nanos_opt().hash(&mut hasher);
        for chunk in &this.staged {
            chunk.file_name.hash(&mut hasher);
        }
        let id = format!("{:016x}", hasher.finish());

        // Move chunk files into place first; they stay invisible until the
        // manifest rename below publishes them.
        for chunk in &this.staged {
            let class_dir = chunk.class.as_str();
            let target_dir = this.dir.join("chunks").join(class_dir);
            std::fs::create_dir_all(&target_dir)?;
            std::fs::rename(
                staging.path().join(class_dir).join(&chunk.file_name),
                target_dir.join(&chunk.file_name),
            )?;
            let entry = this
                .manifest
                .last
                .entry(class_dir.to_string())
                .or_insert(chunk.last);
            if chunk.last > *entry {
                *entry = chunk.last;
            }
        }
        this.manifest.commits.push(CommitRecord {
            id: id.clone(),
            message: message.to_string(),
            committed_at,
        });

        let tmp = this.dir.join("manifest.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&this.manifest)?)?;
        std::fs::rename(&tmp, this.dir.join(MANIFEST))?;

        this.release_lock();
        Ok(CommitId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataClass, VariableSpec};
    use bytes::Bytes;
    use chrono::Duration;

    fn schema() -> DatasetSchema {
        let mut schema = DatasetSchema::default();
        schema.variables.insert(
            "gas_ppb".into(),
            VariableSpec::new(&["timestamp"], crate::model::DType::F64),
        );
        schema.attrs.insert("gas_id".into(), "ch4".into());
        schema
    }

    fn batch(class: DataClass, start: DateTime<Utc>, n: usize) -> RecordBatch {
        RecordBatch {
            class,
            timestamps: (0..n as i64)
                .map(|i| start + Duration::seconds(i))
                .collect(),
            payload: Bytes::from(vec![7u8; n * 8]),
            bytes_per_record: 8,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn create_commit_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let path = "orion-02/site-a/2024-01-01t00-00-00z-inst-orion-02-prj-site-a-l1b";

        let mut session = store.create(path, &schema()).await.unwrap();
        session
            .write_chunk(&batch(DataClass::Minimal, now(), 10))
            .await
            .unwrap();
        let id = session.commit("append minimal").await.unwrap();
        assert!(!id.0.is_empty());

        let reader = store.open(path, OpenMode::ReadOnly).await.unwrap();
        let last = reader
            .read_last_coordinate(DataClass::Minimal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last, now() + Duration::seconds(9));
        assert_eq!(reader.schema().await.unwrap(), schema());
    }

    #[tokio::test]
    async fn abandoned_create_stays_invisible() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let path = "orion-02/site-a/2024-01-01t00-00-00z-inst-orion-02-prj-site-a-l1b";

        {
            let mut session = store.create(path, &schema()).await.unwrap();
            session
                .write_chunk(&batch(DataClass::Minimal, now(), 10))
                .await
                .unwrap();
            // Dropped without commit.
        }

        assert!(matches!(
            store.open(path, OpenMode::ReadOnly).await,
            Err(StreamError::RepositoryMissing(_))
        ));
        assert!(store.list_paths("orion-02/site-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_writer_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let path = "i/p/2024-01-01t00-00-00z-inst-i-prj-p-l1b";

        let mut first = store.create(path, &schema()).await.unwrap();
        first
            .write_chunk(&batch(DataClass::Minimal, now(), 2))
            .await
            .unwrap();
        first.commit("initial").await.unwrap();

        let holder = store.open(path, OpenMode::Append).await.unwrap();
        assert!(matches!(
            store.open(path, OpenMode::Append).await,
            Err(StreamError::ConflictingWriter(_))
        ));
        drop(holder);

        // Lock released on drop; a new writer may proceed.
        store.open(path, OpenMode::Append).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_monotonic_append() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let path = "i/p/2024-01-01t00-00-00z-inst-i-prj-p-l1b";

        let mut session = store.create(path, &schema()).await.unwrap();
        session
            .write_chunk(&batch(DataClass::Minimal, now(), 10))
            .await
            .unwrap();
        session.commit("first").await.unwrap();

        let mut replay = store.open(path, OpenMode::Append).await.unwrap();
        let err = replay
            .write_chunk(&batch(DataClass::Minimal, now(), 10))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NonMonotonicAppend { .. }));
    }

    #[tokio::test]
    async fn classes_sharing_a_dimension_keep_independent_marks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let path = "i/p/2024-01-01t00-00-00z-inst-i-prj-p-l1b";

        // Minimal lands first, covering the full window.
        let mut session = store.create(path, &schema()).await.unwrap();
        session
            .write_chunk(&batch(DataClass::Minimal, now(), 10))
            .await
            .unwrap();
        session.commit("append minimal").await.unwrap();

        // Waveform shares the `timestamp` dimension but starts from its own
        // (empty) mark; the same window must be accepted, not rejected as a
        // rewind of minimal's coordinate.
        let mut session = store.open(path, OpenMode::Append).await.unwrap();
        session
            .write_chunk(&RecordBatch {
                class: DataClass::Waveform,
                timestamps: (0..5).map(|i| now() + Duration::seconds(i)).collect(),
                payload: Bytes::from(vec![0u8; 5 * 16]),
                bytes_per_record: 16,
            })
            .await
            .unwrap();
        session.commit("append waveform").await.unwrap();

        let reader = store.open(path, OpenMode::ReadOnly).await.unwrap();
        assert_eq!(
            reader.read_last_coordinate(DataClass::Minimal).await.unwrap(),
            Some(now() + Duration::seconds(9))
        );
        assert_eq!(
            reader.read_last_coordinate(DataClass::Waveform).await.unwrap(),
            Some(now() + Duration::seconds(4))
        );

        // Within one class the monotonic check still bites.
        let mut replay = store.open(path, OpenMode::Append).await.unwrap();
        let err = replay
            .write_chunk(&RecordBatch {
                class: DataClass::Waveform,
                timestamps: vec![now() + Duration::seconds(4)],
                payload: Bytes::from(vec![0u8; 16]),
                bytes_per_record: 16,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NonMonotonicAppend { .. }));
    }

    #[tokio::test]
    async fn lists_only_datasets() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let path = "i/p/2024-01-01t00-00-00z-inst-i-prj-p-l1b";

        let mut session = store.create(path, &schema()).await.unwrap();
        session
            .write_chunk(&batch(DataClass::Minimal, now(), 2))
            .await
            .unwrap();
        session.commit("initial").await.unwrap();

        // A stray non-dataset directory is not listed.
        std::fs::create_dir_all(tmp.path().join("i/p/scratch")).unwrap();

        assert_eq!(store.list_paths("i/p").await.unwrap(), vec![path.to_string()]);
        assert!(store.list_paths("other/p").await.unwrap().is_empty());
    }
}
