//! Per-cycle append planning.
//!
//! Decides whether the latest remote dataset is appendable, synthesizes a
//! new epoch-grammar dataset when it is not, and resolves one append window
//! per enabled data class in the fixed class order.

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::locator::RepositoryLocator;
use crate::model::{AppendWindow, DataClass, DatasetSchema, LogicalStream};
use crate::path::DatasetRef;
use crate::resume::ResumeStateResolver;
use crate::source::RecordSource;
use crate::store::{ChunkStore, OpenMode, StoreSession};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome of one planning pass.
#[derive(Debug)]
pub struct Plan {
    pub target: DatasetRef,
    /// Whether `target` does not exist yet and must be created on first
    /// commit.
    pub creating: bool,
    /// One entry per enabled class, in fixed append order. `None` means the
    /// class is caught up this cycle.
    pub windows: Vec<(DataClass, Option<AppendWindow>)>,
    /// Source variable layout for the enabled classes; used to create the
    /// target when `creating` is set.
    pub schema: DatasetSchema,
}

impl Plan {
    pub fn all_caught_up(&self) -> bool {
        self.windows.iter().all(|(_, window)| window.is_none())
    }
}

pub struct AppendPlanner<'a> {
    store: &'a dyn ChunkStore,
    source: &'a dyn RecordSource,
    config: &'a StreamConfig,
    stream: &'a LogicalStream,
}

impl<'a> AppendPlanner<'a> {
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
        }
    }

    pub async fn plan(
        &self,
        since_hints: &BTreeMap<DataClass, DateTime<Utc>>,
        until_hint: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Plan> {
        let enabled = self.config.enabled_classes();
        let source_schema = self.source.schema(&enabled);

        let locator = RepositoryLocator::new(self.store.as_lister());
        let latest = locator.latest(&self.stream.prefix()).await?;

        // Probe the latest dataset. Its last coordinates anchor resumption
        // even when a fresh dataset must be created, so a gas change or a
        // day rollover never re-ingests history.
        let (target, creating, probe) = match latest {
            None => {
                debug!(prefix = %self.stream.prefix(), "no prior dataset under prefix");
                (self.synthesize(now), true, None)
            }
            Some(latest) => match self.store.open(&latest.encode(), OpenMode::ReadOnly).await {
                Ok(session) => {
                    if self.is_appendable(&latest, session.as_ref(), &source_schema, now).await? {
                        (latest, false, Some(session))
                    } else {
                        (self.synthesize(now), true, Some(session))
                    }
                }
                Err(StreamError::RepositoryMissing(_)) => {
                    // Listed but gone by the time we opened it.
                    (self.synthesize(now), true, None)
                }
                Err(StreamError::ConflictingWriter(path)) => {
                    info!(%path, "latest dataset has an open writer; starting a new one");
                    (self.synthesize(now), true, None)
                }
                Err(e) => return Err(e),
            },
        };

        let resolver = ResumeStateResolver::new(self.config.max_commit_span());
        let mut windows = Vec::with_capacity(enabled.len());
        for class in enabled {
            let window = resolver
                .resolve(
                    probe.as_deref(),
                    class,
                    since_hints.get(&class).copied(),
                    until_hint,
                    self.source,
                    now,
                )
                .await?;
            windows.push((class, window));
        }

        Ok(Plan {
            target,
            creating,
            windows,
            schema: source_schema,
        })
    }

    fn synthesize(&self, now: DateTime<Utc>) -> DatasetRef {
        DatasetRef::new_epoch(
            &self.stream.instrument,
            &self.stream.project,
            self.config.profile,
            now,
        )
    }

    async fn is_appendable(
        &self,
        target: &DatasetRef,
        session: &dyn StoreSession,
        source_schema: &DatasetSchema,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let schema = session.schema().await?;

        if !schema.significant_attrs_match(&self.stream.attrs()) {
            info!(target = %target, "grouping-key attributes changed; starting a new dataset");
            return Ok(false);
        }

        // Attributes match, so this target is ours; a variable layout it
        // cannot accept is an operator problem, not a fork point.
        if let Err(reason) = schema.accepts(source_schema) {
            return Err(StreamError::SchemaIncompatible(format!(
                "{}: {reason}",
                target.encode()
            )));
        }

        if now - target.created >= Duration::days(self.config.days_per_dataset) {
            info!(target = %target, "dataset epoch exceeded days_per_dataset; rolling over");
            return Ok(false);
        }

        Ok(true)
    }
}
