//! Core data model: data-rate classes, append windows, schemas, record batches.
//!
//! `DataClass` is a closed enumeration with per-variant configuration rather
//! than a trait hierarchy: each class has its own coordinate dimension and an
//! independent last-written timestamp inside a given dataset.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One independently-paced variable group.
///
/// Within one commit cycle, classes are appended smallest-first so a
/// connection failure loses only the most recent, most expensive, least
/// critical class, never already-committed smaller classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    /// Per-measurement-campaign reference metadata; appended once or rarely.
    Retro,
    /// Per-`timestamp` scalar channels.
    Minimal,
    /// Per-`high_res_timestamp` channels.
    HighFreq,
    /// Per-`timestamp`, large per-sample arrays.
    Waveform,
}

impl DataClass {
    /// Fixed append order for one commit cycle.
    pub const APPEND_ORDER: [DataClass; 4] = [
        DataClass::Retro,
        DataClass::Minimal,
        DataClass::HighFreq,
        DataClass::Waveform,
    ];

    /// Coordinate dimension this class appends along.
    pub fn dimension(&self) -> &'static str {
        match self {
            DataClass::Retro => "retro",
            DataClass::Minimal => "timestamp",
            DataClass::HighFreq => "high_res_timestamp",
            DataClass::Waveform => "timestamp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataClass::Retro => "retro",
            DataClass::Minimal => "minimal",
            DataClass::HighFreq => "high_freq",
            DataClass::Waveform => "waveform",
        }
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time range `[since, until)` targeted by one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl AppendWindow {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { since, until }
    }

    pub fn span(&self) -> Duration {
        self.until - self.since
    }

    pub fn is_empty(&self) -> bool {
        self.since >= self.until
    }
}

impl fmt::Display for AppendWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.since.to_rfc3339(),
            self.until.to_rfc3339()
        )
    }
}

/// One physical instrument+project combination producing one continuous
/// time series. Derived from configuration; never persisted as an object.
///
/// The gas identity is the grouping key: a change invalidates the current
/// dataset and forces a new one. It lives in dataset attributes, not the
/// path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalStream {
    pub instrument: String,
    pub project: String,
    pub gas_id: String,
    pub gas_version: String,
}

impl LogicalStream {
    /// Root prefix for this stream in the object store.
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.instrument, self.project)
    }

    /// Dataset attributes carried on every dataset created for this stream.
    pub fn attrs(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("instrument".to_string(), self.instrument.clone()),
            ("project".to_string(), self.project.clone()),
            ("gas_id".to_string(), self.gas_id.clone()),
            ("gas_version".to_string(), self.gas_version.clone()),
        ])
    }
}

/// Attribute keys whose change invalidates the current dataset.
pub const SIGNIFICANT_KEYS: [&str; 2] = ["gas_id", "gas_version"];

/// Element type of a dataset variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F64,
    I64,
    Str,
}

/// Shape and element type of one dataset variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub dims: Vec<String>,
    pub dtype: DType,
}

impl VariableSpec {
    pub fn new(dims: &[&str], dtype: DType) -> Self {
        Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            dtype,
        }
    }
}

/// Variable set, dimension layout and attributes of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub variables: BTreeMap<String, VariableSpec>,
    pub attrs: BTreeMap<String, String>,
}

impl DatasetSchema {
    /// Whether a dataset with this schema can accept appends carrying
    /// `incoming` variables. Every incoming variable must already exist with
    /// identical dims and dtype; extra variables on the target are tolerated
    /// (they simply stop growing).
    pub fn accepts(&self, incoming: &DatasetSchema) -> std::result::Result<(), String> {
        for (name, spec) in &incoming.variables {
            match self.variables.get(name) {
                None => return Err(format!("target has no variable `{name}`")),
                Some(existing) if existing != spec => {
                    return Err(format!(
                        "variable `{name}` mismatch: target {existing:?}, incoming {spec:?}"
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Whether the grouping-key attributes match `attrs`.
    pub fn significant_attrs_match(&self, attrs: &BTreeMap<String, String>) -> bool {
        SIGNIFICANT_KEYS
            .iter()
            .all(|key| self.attrs.get(*key) == attrs.get(*key))
    }
}

/// Records for one class covering part of an append window.
///
/// Payload is a flat column of fixed-stride records; chunk slicing is a
/// cheap `Bytes` sub-slice.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub class: DataClass,
    pub timestamps: Vec<DateTime<Utc>>,
    pub payload: Bytes,
    pub bytes_per_record: usize,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Sub-batch for records `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> RecordBatch {
        RecordBatch {
            class: self.class,
            timestamps: self.timestamps[start..end].to_vec(),
            payload: self
                .payload
                .slice(start * self.bytes_per_record..end * self.bytes_per_record),
            bytes_per_record: self.bytes_per_record,
        }
    }
}
