//! Resume-state resolution.
//!
//! All resumption data is recomputed from idempotent reads against the
//! remote store; nothing is cached across process restarts. The resolver is
//! a pure function of `(last written coordinate, hints, clock)` plus the one
//! read call that fetches the exact last coordinate value per class, never
//! a day-granularity proxy, which is what once made a long-idle resume
//! re-stream an entire day.

use crate::error::Result;
use crate::model::{AppendWindow, DataClass};
use crate::source::RecordSource;
use crate::store::StoreSession;
use chrono::{DateTime, Duration, Utc};

/// Where the next append must start.
///
/// With prior data, `since` is just past the last committed coordinate; the
/// caller-supplied hint can only move the start forward, never rewind past
/// what is already committed. Without prior data, the hint wins outright and
/// the earliest source timestamp is the fallback. `None` means the class has
/// no data anywhere yet.
pub fn resolve_since(
    last_written: Option<DateTime<Utc>>,
    since_hint: Option<DateTime<Utc>>,
    earliest_source: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match last_written {
        Some(last) => {
            let base = last + Duration::milliseconds(1);
            Some(match since_hint {
                Some(hint) if hint > base => hint,
                _ => base,
            })
        }
        None => since_hint.or(earliest_source),
    }
}

/// Clamp `[since, ...)` to one commit's worth of work. `None` means caught
/// up, a control signal rather than an error.
pub fn clamp_window(
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    until_hint: Option<DateTime<Utc>>,
    max_span: Duration,
) -> Option<AppendWindow> {
    let mut until = (since + max_span).min(now);
    if let Some(hint) = until_hint {
        until = until.min(hint);
    }
    if since >= until {
        None
    } else {
        Some(AppendWindow::new(since, until))
    }
}

pub struct ResumeStateResolver {
    max_span: Duration,
}

impl ResumeStateResolver {
    pub fn new(max_span: Duration) -> Self {
        Self { max_span }
    }

    /// Append window for `class` against the dataset behind `session`, or
    /// against a yet-to-be-created dataset when `session` is `None`.
    pub async fn resolve(
        &self,
        session: Option<&dyn StoreSession>,
        class: DataClass,
        since_hint: Option<DateTime<Utc>>,
        until_hint: Option<DateTime<Utc>>,
        source: &dyn RecordSource,
        now: DateTime<Utc>,
    ) -> Result<Option<AppendWindow>> {
        let last_written = match session {
            Some(session) => session.read_last_coordinate(class).await?,
            None => None,
        };
        let earliest = if last_written.is_none() {
            source.earliest(class).await?
        } else {
            None
        };
        let Some(since) = resolve_since(last_written, since_hint, earliest) else {
            return Ok(None);
        };
        Ok(clamp_window(since, now, until_hint, self.max_span))
    }
}
