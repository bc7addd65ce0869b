//! Write-and-commit execution against the backing store.
//!
//! Each attempt replays the entire write-and-commit for its `(target,
//! class, window)` tuple from scratch; the store's transactional commit
//! guarantees a failed attempt leaves no partial chunks visible, so replays
//! need no deduplication here. Transient faults are retried with bounded
//! exponential backoff; backoff waits are cancellable, an issued commit is
//! not.

use crate::cancel::CancelToken;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::model::{AppendWindow, DataClass, DatasetSchema, LogicalStream};
use crate::path::DatasetRef;
use crate::source::RecordSource;
use crate::store::{ChunkStore, CommitId, OpenMode};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Longest single backoff wait regardless of attempt count.
const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub commit_id: CommitId,
    /// Exclusive end of what actually landed; may be clamped below the
    /// requested `until` when the backend caps chunks per commit.
    pub committed_until: DateTime<Utc>,
    pub records: usize,
    pub chunks: usize,
    pub bytes: u64,
}

pub struct CommitExecutor<'a> {
    store: &'a dyn ChunkStore,
    config: &'a StreamConfig,
    stream: &'a LogicalStream,
}

impl<'a> CommitExecutor<'a> {
    pub fn new(
        store: &'a dyn ChunkStore,
        config: &'a StreamConfig,
        stream: &'a LogicalStream,
    ) -> Self {
        Self {
            store,
            config,
            stream,
        }
    }

    /// Append `[window.since, window.until)` of `class` to `target` under
    /// one transactional commit.
    ///
    /// Returns `Ok(None)` when the window holds less than one full chunk;
    /// the records stay in the source and are picked up next cycle.
    pub async fn execute(
        &self,
        target: &DatasetRef,
        creating: bool,
        schema: &DatasetSchema,
        class: DataClass,
        window: &AppendWindow,
        source: &dyn RecordSource,
        cancel: &mut CancelToken,
    ) -> Result<Option<CommitOutcome>> {
        let max_attempts = self.config.max_retry_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            match self
                .try_once(target, creating, schema, class, window, source)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(self.config.retry_base_delay_ms, attempt);
                    warn!(
                        target = %target,
                        %class,
                        %window,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient fault, backing off before retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(StreamError::ExhaustedRetries {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_once(
        &self,
        target: &DatasetRef,
        creating: bool,
        schema: &DatasetSchema,
        class: DataClass,
        window: &AppendWindow,
        source: &dyn RecordSource,
    ) -> Result<Option<CommitOutcome>> {
        let path = target.encode();
        let mut session = match self.store.open(&path, OpenMode::Append).await {
            Ok(session) => session,
            Err(StreamError::RepositoryMissing(_)) if creating => {
                debug!(target = %path, "creating dataset on first commit");
                self.store.create(&path, schema).await?
            }
            Err(e) => return Err(e),
        };

        let batch = source.read_records(class, window).await?;
        let chunk_len = self.config.chunk_len(class);
        // Append only whole chunks; a short tail cannot be grown later and
        // is re-read next cycle once it fills out.
        let full_chunks = batch.len() / chunk_len;
        if full_chunks == 0 {
            debug!(
                %class,
                %window,
                records = batch.len(),
                chunk_len,
                "window holds less than one full chunk, skipping"
            );
            return Ok(None);
        }
        let chunks = full_chunks.min(self.config.max_chunks_per_commit);
        let kept = chunks * chunk_len;

        for i in 0..chunks {
            session
                .write_chunk(&batch.slice(i * chunk_len, (i + 1) * chunk_len))
                .await?;
        }

        let committed_until = batch.timestamps[kept - 1] + Duration::milliseconds(1);
        let message = format!(
            "append {}/{} {} [{}, {})",
            self.stream.instrument,
            self.stream.project,
            class,
            window.since.to_rfc3339(),
            committed_until.to_rfc3339(),
        );
        let commit_id = session.commit(&message).await?;
        debug!(target = %path, %class, commit = %commit_id, records = kept, "committed");

        Ok(Some(CommitOutcome {
            commit_id,
            committed_until,
            records: kept,
            chunks,
            bytes: (kept * batch.bytes_per_record) as u64,
        }))
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> std::time::Duration {
    let ms = base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
    std::time::Duration::from_millis(ms).min(MAX_BACKOFF)
}
