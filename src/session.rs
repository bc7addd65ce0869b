//! The streaming session state machine.
//!
//! One session serves one (instrument, project) stream and cycles through
//! discover → plan → append-per-class → advance. All durable state lives in
//! the remote store; the session only keeps in-memory since markers as
//! forward-only hints between cycles. A restart rebuilds everything from
//! the store.

use crate::cancel::CancelToken;
use crate::commit::CommitExecutor;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::model::{DataClass, LogicalStream};
use crate::plan::AppendPlanner;
use crate::report::{ClassOutcome, ClassReport, CycleReport, SessionSummary};
use crate::source::RecordSource;
use crate::store::ChunkStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Give up catching up after this many consecutive cycles that neither
/// committed nor were caught up (the target kept vanishing).
const MAX_BARREN_CYCLES: u32 = 3;

pub struct StreamingSession<'a> {
    store: &'a dyn ChunkStore,
    source: &'a dyn RecordSource,
    config: &'a StreamConfig,
    stream: &'a LogicalStream,
    /// Exclusive committed-until per class, this process only. Merged into
    /// the planner's since hints; the store remains authoritative.
    markers: BTreeMap<DataClass, DateTime<Utc>>,
}

impl<'a> StreamingSession<'a> {
    pub fn new(
        store: &'a dyn ChunkStore,
        source: &'a dyn RecordSource,
        config: &'a StreamConfig,
        stream: &'a LogicalStream,
    ) -> Self {
        Self {
            store,
            source,
            config,
            stream,
            markers: BTreeMap::new(),
        }
    }

    fn since_hints(
        &self,
        cli_hint: Option<DateTime<Utc>>,
    ) -> BTreeMap<DataClass, DateTime<Utc>> {
        let mut hints = self.markers.clone();
        if let Some(hint) = cli_hint {
            for class in DataClass::APPEND_ORDER {
                hints
                    .entry(class)
                    .and_modify(|existing| *existing = (*existing).max(hint))
                    .or_insert(hint);
            }
        }
        hints
    }

    /// One full discover-plan-append cycle at instant `now`.
    ///
    /// A class failing with `RepositoryMissing` sends the session back to
    /// discovery: the remaining classes are skipped this cycle and the next
    /// cycle re-plans from a fresh listing. Any other per-class failure is
    /// recorded and the session moves on to the next class.
    pub async fn run_cycle(
        &mut self,
        since_hint: Option<DateTime<Utc>>,
        until_hint: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        cancel: &mut CancelToken,
    ) -> Result<CycleReport> {
        let planner = AppendPlanner::new(self.store, self.source, self.config, self.stream);
        let plan = planner
            .plan(&self.since_hints(since_hint), until_hint, now)
            .await?;
        let executor = CommitExecutor::new(self.store, self.config, self.stream);

        let mut creating = plan.creating;
        let mut rediscover = false;
        let mut degraded = false;
        let mut classes = Vec::with_capacity(plan.windows.len());

        for (class, window) in &plan.windows {
            if rediscover {
                classes.push(ClassReport {
                    class: *class,
                    outcome: ClassOutcome::Skipped {
                        reason: "target missing; re-planning next cycle".into(),
                    },
                });
                continue;
            }
            let Some(window) = window else {
                classes.push(ClassReport {
                    class: *class,
                    outcome: ClassOutcome::Skipped {
                        reason: "caught up".into(),
                    },
                });
                continue;
            };

            let outcome = match executor
                .execute(
                    &plan.target,
                    creating,
                    &plan.schema,
                    *class,
                    window,
                    self.source,
                    cancel,
                )
                .await
            {
                Ok(Some(outcome)) => {
                    creating = false;
                    self.markers
                        .entry(*class)
                        .and_modify(|marker| *marker = (*marker).max(outcome.committed_until))
                        .or_insert(outcome.committed_until);
                    ClassOutcome::Committed {
                        window: crate::model::AppendWindow::new(
                            window.since,
                            outcome.committed_until,
                        ),
                        commit_id: outcome.commit_id.0,
                        records: outcome.records,
                        bytes: outcome.bytes,
                    }
                }
                Ok(None) => ClassOutcome::Skipped {
                    reason: "window holds less than one full chunk".into(),
                },
                Err(StreamError::Cancelled) => return Err(StreamError::Cancelled),
                Err(e @ StreamError::RepositoryMissing(_)) => {
                    warn!(target = %plan.target, %class, error = %e, "target vanished mid-cycle");
                    rediscover = true;
                    degraded = true;
                    ClassOutcome::Failed {
                        classification: e.classification(),
                        detail: e.to_string(),
                    }
                }
                Err(e) => {
                    warn!(target = %plan.target, %class, error = %e, "class append failed");
                    degraded = true;
                    ClassOutcome::Failed {
                        classification: e.classification(),
                        detail: e.to_string(),
                    }
                }
            };
            classes.push(ClassReport {
                class: *class,
                outcome,
            });
        }

        Ok(CycleReport {
            target: plan.target.encode(),
            creating: plan.creating,
            classes,
            caught_up: plan.all_caught_up(),
            degraded,
        })
    }

    /// Run cycles until the stream is caught up or no further progress is
    /// possible. Calls `on_cycle` with every produced report.
    pub async fn run_until_caught_up(
        &mut self,
        since_hint: Option<DateTime<Utc>>,
        until_hint: Option<DateTime<Utc>>,
        cancel: &mut CancelToken,
        on_cycle: &mut dyn FnMut(&CycleReport),
    ) -> Result<SessionSummary> {
        let started = std::time::Instant::now();
        let mut summary = SessionSummary::default();
        let mut barren_cycles = 0u32;

        loop {
            let report = self
                .run_cycle(since_hint, until_hint, Utc::now(), cancel)
                .await?;
            summary.absorb(&report);
            info!(
                target = %report.target,
                cycle = summary.cycles,
                commits = report.commit_count(),
                records = report.committed_records(),
                caught_up = report.caught_up,
                degraded = report.degraded,
                "cycle finished"
            );
            on_cycle(&report);

            if report.caught_up {
                break;
            }
            if report.needs_rediscovery() {
                barren_cycles += 1;
                if barren_cycles >= MAX_BARREN_CYCLES {
                    warn!(barren_cycles, "target keeps vanishing; giving up");
                    break;
                }
                continue;
            }
            if report.commit_count() == 0 {
                // Remaining records are a sub-chunk tail; nothing more to do
                // until the source produces more.
                break;
            }
            barren_cycles = 0;
        }

        let elapsed = started.elapsed().as_secs_f64();
        let mb = summary.bytes as f64 / 1_000_000.0;
        info!(
            cycles = summary.cycles,
            commits = summary.commits,
            records = summary.records,
            mb = format!("{mb:.2}"),
            mb_per_s = format!("{:.2}", if elapsed > 0.0 { mb / elapsed } else { 0.0 }),
            "session caught up"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatasetSchema, RecordBatch};
    use crate::path::DatasetRef;
    use crate::source::SyntheticSource;
    use crate::store::local::LocalChunkStore;
    use crate::store::{CommitId, OpenMode, PathLister, StoreSession};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn stream() -> LogicalStream {
        LogicalStream {
            instrument: "orion-02".into(),
            project: "site-a".into(),
            gas_id: "ch4".into(),
            gas_version: "3".into(),
        }
    }

    fn config() -> StreamConfig {
        StreamConfig {
            retry_base_delay_ms: 1,
            gas_id: "ch4".into(),
            gas_version: "3".into(),
            ..Default::default()
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn first_cycle_creates_and_commits_in_fixed_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let start = ts("2024-01-01T00:00:00Z");
        let source = SyntheticSource::new(stream(), start);
        let (config, stream) = (config(), stream());
        let mut session = StreamingSession::new(&store, &source, &config, &stream);

        let until = ts("2024-01-01T00:10:00Z");
        let mut cancel = CancelToken::never();
        let report = session
            .run_cycle(None, Some(until), ts("2024-01-01T01:00:00Z"), &mut cancel)
            .await
            .unwrap();

        assert!(report.creating);
        assert!(!report.degraded);
        let order: Vec<DataClass> = report.classes.iter().map(|c| c.class).collect();
        assert_eq!(order, DataClass::APPEND_ORDER.to_vec());
        // 600 s of data: 1 retro entry, 600 minimal, 6000 high-freq, 600
        // waveform records, all whole chunks.
        assert_eq!(report.commit_count(), 4);
        assert_eq!(report.committed_records(), 1 + 600 + 6000 + 600);

        // The dataset is discoverable and carries the last coordinates.
        let reader = store.open(&report.target, OpenMode::ReadOnly).await.unwrap();
        assert_eq!(
            reader.read_last_coordinate(DataClass::Minimal).await.unwrap(),
            Some(ts("2024-01-01T00:09:59Z"))
        );
        assert_eq!(
            reader
                .read_last_coordinate(DataClass::HighFreq)
                .await
                .unwrap(),
            Some(ts("2024-01-01T00:09:59.900Z"))
        );
        assert_eq!(
            reader
                .read_last_coordinate(DataClass::Waveform)
                .await
                .unwrap(),
            Some(ts("2024-01-01T00:09:59Z"))
        );
    }

    #[tokio::test]
    async fn catch_up_terminates_once_only_a_tail_remains() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let start = ts("2024-01-01T00:00:00Z");
        // The instrument went quiet after ten minutes.
        let source = SyntheticSource::new(stream(), start).with_end(ts("2024-01-01T00:10:00Z"));
        let (config, stream) = (config(), stream());
        let mut session = StreamingSession::new(&store, &source, &config, &stream);

        let mut cancel = CancelToken::never();
        let mut reports = Vec::new();
        let summary = session
            .run_until_caught_up(None, None, &mut cancel, &mut |report| {
                reports.push(report.clone())
            })
            .await
            .unwrap();

        assert_eq!(reports[0].commit_count(), 4);
        // Second cycle finds only the sub-chunk tail past each committed
        // coordinate and stops without committing.
        assert_eq!(summary.cycles, reports.len());
        assert_eq!(summary.commits, 4);
        assert_eq!(reports.last().unwrap().commit_count(), 0);
        assert_eq!(summary.records, 1 + 600 + 6000 + 600);
    }

    #[tokio::test]
    async fn restart_resumes_from_store_not_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let start = ts("2024-01-01T00:00:00Z");
        let source = SyntheticSource::new(stream(), start);
        let (config, stream) = (config(), stream());
        let mut cancel = CancelToken::never();

        {
            let mut session = StreamingSession::new(&store, &source, &config, &stream);
            session
                .run_cycle(
                    None,
                    Some(ts("2024-01-01T00:10:00Z")),
                    ts("2024-01-01T01:00:00Z"),
                    &mut cancel,
                )
                .await
                .unwrap();
        }

        // Fresh session, no in-memory markers: resumption comes from the
        // store's last coordinates.
        let mut session = StreamingSession::new(&store, &source, &config, &stream);
        let report = session
            .run_cycle(
                None,
                Some(ts("2024-01-01T00:20:00Z")),
                ts("2024-01-01T01:00:00Z"),
                &mut cancel,
            )
            .await
            .unwrap();

        assert!(!report.creating);
        let minimal = report
            .classes
            .iter()
            .find(|c| c.class == DataClass::Minimal)
            .unwrap();
        match &minimal.outcome {
            ClassOutcome::Committed { window, records, .. } => {
                assert_eq!(window.since, ts("2024-01-01T00:09:59.001Z"));
                assert_eq!(*records, 600);
            }
            other => panic!("expected committed minimal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn since_hint_cannot_rewind_committed_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(tmp.path());
        let start = ts("2024-01-01T00:00:00Z");
        let source = SyntheticSource::new(stream(), start);
        let (config, stream) = (config(), stream());
        let mut session = StreamingSession::new(&store, &source, &config, &stream);
        let mut cancel = CancelToken::never();

        session
            .run_cycle(
                None,
                Some(ts("2024-01-01T00:10:00Z")),
                ts("2024-01-01T01:00:00Z"),
                &mut cancel,
            )
            .await
            .unwrap();

        // A hint far in the past must not replay already-committed records.
        let report = session
            .run_cycle(
                Some(ts("2023-01-01T00:00:00Z")),
                Some(ts("2024-01-01T00:20:00Z")),
                ts("2024-01-01T01:00:00Z"),
                &mut cancel,
            )
            .await
            .unwrap();
        let minimal = report
            .classes
            .iter()
            .find(|c| c.class == DataClass::Minimal)
            .unwrap();
        match &minimal.outcome {
            ClassOutcome::Committed { window, .. } => {
                assert_eq!(window.since, ts("2024-01-01T00:09:59.001Z"));
            }
            other => panic!("expected committed minimal, got {other:?}"),
        }
    }

    /// Store wrapper that rejects high-freq chunk writes, and reports the
    /// dataset missing once `vanish_after` commits have landed.
    struct FaultyStore {
        inner: LocalChunkStore,
        reject_high_freq: bool,
        commits: Arc<AtomicU32>,
        vanish_after: Option<u32>,
    }

    #[async_trait]
    impl PathLister for FaultyStore {
        async fn list_paths(&self, prefix: &str) -> crate::error::Result<Vec<String>> {
            self.inner.list_paths(prefix).await
        }
    }

    #[async_trait]
    impl ChunkStore for FaultyStore {
        fn as_lister(&self) -> &dyn PathLister {
            self
        }

        async fn open(
            &self,
            path: &str,
            mode: OpenMode,
        ) -> crate::error::Result<Box<dyn StoreSession>> {
            if let Some(threshold) = self.vanish_after {
                if mode == OpenMode::Append && self.commits.load(Ordering::SeqCst) >= threshold {
                    return Err(StreamError::RepositoryMissing(path.to_string()));
                }
            }
            let session = self.inner.open(path, mode).await?;
            Ok(Box::new(FaultySession {
                inner: session,
                reject_high_freq: self.reject_high_freq,
                commits: self.commits.clone(),
            }))
        }

        async fn create(
            &self,
            path: &str,
            schema: &DatasetSchema,
        ) -> crate::error::Result<Box<dyn StoreSession>> {
            let session = self.inner.create(path, schema).await?;
            Ok(Box::new(FaultySession {
                inner: session,
                reject_high_freq: self.reject_high_freq,
                commits: self.commits.clone(),
            }))
        }
    }

    struct FaultySession {
        inner: Box<dyn StoreSession>,
        reject_high_freq: bool,
        commits: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StoreSession for FaultySession {
        async fn schema(&self) -> crate::error::Result<DatasetSchema> {
            self.inner.schema().await
        }

        async fn read_last_coordinate(
            &self,
            class: DataClass,
        ) -> crate::error::Result<Option<DateTime<Utc>>> {
            self.inner.read_last_coordinate(class).await
        }

        async fn write_chunk(&mut self, batch: &RecordBatch) -> crate::error::Result<()> {
            if self.reject_high_freq && batch.class == DataClass::HighFreq {
                return Err(StreamError::BackendUnreachable(
                    "chunk upload refused".into(),
                ));
            }
            self.inner.write_chunk(batch).await
        }

        async fn commit(self: Box<Self>, message: &str) -> crate::error::Result<CommitId> {
            let commits = self.commits.clone();
            let id = self.inner.commit(message).await?;
            commits.fetch_add(1, Ordering::SeqCst);
            Ok(id)
        }
    }

    #[tokio::test]
    async fn class_failure_degrades_cycle_but_later_classes_continue() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FaultyStore {
            inner: LocalChunkStore::new(tmp.path()),
            reject_high_freq: true,
            commits: Arc::new(AtomicU32::new(0)),
            vanish_after: None,
        };
        let start = ts("2024-01-01T00:00:00Z");
        let source = SyntheticSource::new(stream(), start);
        let (config, stream) = (config(), stream());
        let mut session = StreamingSession::new(&store, &source, &config, &stream);
        let mut cancel = CancelToken::never();

        let report = session
            .run_cycle(
                None,
                Some(ts("2024-01-01T00:10:00Z")),
                ts("2024-01-01T01:00:00Z"),
                &mut cancel,
            )
            .await
            .unwrap();

        assert!(report.degraded);
        assert_eq!(report.commit_count(), 3);
        let high_freq = report
            .classes
            .iter()
            .find(|c| c.class == DataClass::HighFreq)
            .unwrap();
        match &high_freq.outcome {
            ClassOutcome::Failed { classification, .. } => {
                assert_eq!(*classification, "backend_unreachable");
            }
            other => panic!("expected failed high_freq, got {other:?}"),
        }
        // Waveform still committed despite the earlier failure.
        let waveform = report
            .classes
            .iter()
            .find(|c| c.class == DataClass::Waveform)
            .unwrap();
        assert!(matches!(waveform.outcome, ClassOutcome::Committed { .. }));
    }

    #[tokio::test]
    async fn vanished_target_skips_remaining_classes_and_flags_rediscovery() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FaultyStore {
            inner: LocalChunkStore::new(tmp.path()),
            reject_high_freq: false,
            commits: Arc::new(AtomicU32::new(0)),
            // Retro and minimal land, then the dataset "vanishes".
            vanish_after: Some(2),
        };
        let start = ts("2024-01-01T00:00:00Z");
        let source = SyntheticSource::new(stream(), start);
        let (config, stream) = (config(), stream());
        let mut session = StreamingSession::new(&store, &source, &config, &stream);
        let mut cancel = CancelToken::never();

        let report = session
            .run_cycle(
                None,
                Some(ts("2024-01-01T00:10:00Z")),
                ts("2024-01-01T01:00:00Z"),
                &mut cancel,
            )
            .await
            .unwrap();

        assert!(report.needs_rediscovery());
        assert_eq!(report.commit_count(), 2);
        let high_freq = report
            .classes
            .iter()
            .find(|c| c.class == DataClass::HighFreq)
            .unwrap();
        match &high_freq.outcome {
            ClassOutcome::Failed { classification, .. } => {
                assert_eq!(*classification, "repository_missing");
            }
            other => panic!("expected failed high_freq, got {other:?}"),
        }
        let waveform = report
            .classes
            .iter()
            .find(|c| c.class == DataClass::Waveform)
            .unwrap();
        assert!(matches!(waveform.outcome, ClassOutcome::Skipped { .. }));
    }
}
