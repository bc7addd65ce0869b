//! Canonical remote path naming convention.
//!
//! Two grammars coexist and both must decode:
//!
//! ```text
//! legacy/discovery: <i>/<p>/inst-<i>-prj-<p>-<YYYY-MM-DDtHH-mm-SSz>l1b[min]/
//! epoch/creation:   <i>/<p>/<YYYY-MM-DDtHH-mm-SSz>-inst-<i>-prj-<p>-l1b[min]/
//! ```
//!
//! Only the epoch form is emitted when creating new datasets. The two forms
//! stay separate variants merged at the decoder; their field order differs
//! and each must remain individually reconstructible.
//!
//! Pure functions, no I/O.

use crate::error::{Result, StreamError};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Compact second-precision UTC instant used inside path leaves.
const TS_FORMAT: &str = "%Y-%m-%dt%H-%M-%Sz";

/// Formatted length of [`TS_FORMAT`], e.g. `2024-01-01t00-00-00z`.
const TS_LEN: usize = 20;

/// Export profile: full variable set or the minimal-variable subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExportProfile {
    #[serde(rename = "l1b")]
    L1b,
    #[serde(rename = "l1bmin")]
    L1bMin,
}

impl ExportProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportProfile::L1b => "l1b",
            ExportProfile::L1bMin => "l1bmin",
        }
    }

    /// Data classes this profile exports.
    pub fn allowed_classes(&self) -> &'static [crate::model::DataClass] {
        use crate::model::DataClass::*;
        match self {
            ExportProfile::L1b => &[Retro, Minimal, HighFreq, Waveform],
            ExportProfile::L1bMin => &[Retro, Minimal],
        }
    }
}

impl fmt::Display for ExportProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which grammar a dataset path was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathShape {
    Legacy,
    Epoch,
}

/// One versioned dataset instance in the backing store, identified by path.
///
/// `created` is fixed at creation and never rewritten; it denotes dataset
/// epoch start, not last-write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub instrument: String,
    pub project: String,
    pub created: DateTime<Utc>,
    pub profile: ExportProfile,
    pub shape: PathShape,
}

impl DatasetRef {
    /// Synthesize a new dataset in the creation grammar. Sub-second
    /// precision is dropped: the path format carries whole seconds.
    pub fn new_epoch(
        instrument: &str,
        project: &str,
        profile: ExportProfile,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            project: project.to_string(),
            created: created.with_nanosecond(0).unwrap_or(created),
            profile,
            shape: PathShape::Epoch,
        }
    }

    /// Deterministic, reversible encoding of this ref as a remote path.
    pub fn encode(&self) -> String {
        let ts = self.created.format(TS_FORMAT);
        match self.shape {
            PathShape::Legacy => format!(
                "{i}/{p}/inst-{i}-prj-{p}-{ts}{prof}/",
                i = self.instrument,
                p = self.project,
                prof = self.profile.as_str(),
            ),
            PathShape::Epoch => format!(
                "{i}/{p}/{ts}-inst-{i}-prj-{p}-{prof}/",
                i = self.instrument,
                p = self.project,
                prof = self.profile.as_str(),
            ),
        }
    }

    /// Decode a remote path in either grammar.
    pub fn decode(path: &str) -> Result<Self> {
        let malformed = || StreamError::MalformedPath(path.to_string());

        let trimmed = path.trim_end_matches('/');
        let mut parts = trimmed.splitn(3, '/');
        let instrument = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let project = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let leaf = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        if leaf.contains('/') {
            return Err(malformed());
        }

        if let Some(rest) = leaf.strip_prefix(&format!("inst-{instrument}-prj-{project}-")) {
            // Legacy grammar: timestamp then profile suffix, no separator.
            if rest.len() < TS_LEN {
                return Err(malformed());
            }
            let (ts, suffix) = rest.split_at(TS_LEN);
            let profile = match suffix {
                "l1b" => ExportProfile::L1b,
                "l1bmin" => ExportProfile::L1bMin,
                _ => return Err(malformed()),
            };
            return Ok(Self {
                instrument: instrument.to_string(),
                project: project.to_string(),
                created: parse_path_timestamp(ts).ok_or_else(malformed)?,
                profile,
                shape: PathShape::Legacy,
            });
        }

        // Epoch grammar: timestamp leads, profile trails after a dash.
        if leaf.len() < TS_LEN {
            return Err(malformed());
        }
        let (ts, rest) = leaf.split_at(TS_LEN);
        let created = parse_path_timestamp(ts).ok_or_else(malformed)?;
        let profile = if rest == format!("-inst-{instrument}-prj-{project}-l1b") {
            ExportProfile::L1b
        } else if rest == format!("-inst-{instrument}-prj-{project}-l1bmin") {
            ExportProfile::L1bMin
        } else {
            return Err(malformed());
        };
        Ok(Self {
            instrument: instrument.to_string(),
            project: project.to_string(),
            created,
            profile,
            shape: PathShape::Epoch,
        })
    }
}

fn parse_path_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Total order over decoded refs: creation timestamp, then `l1b` before
/// `l1bmin`, then lexical path.
impl Ord for DatasetRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created
            .cmp(&other.created)
            .then(self.profile.cmp(&other.profile))
            .then_with(|| self.encode().cmp(&other.encode()))
    }
}

impl PartialOrd for DatasetRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
