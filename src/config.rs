//! Streaming configuration.
//!
//! Loaded from a TOML file with CLI/env overrides on top; every field has a
//! default so a bare `floe --instrument .. --project ..` run works.

use crate::error::{Result, StreamError};
use crate::model::DataClass;
use crate::path::ExportProfile;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Cap on `until - since` for one commit, to bound per-commit transfer
    /// size.
    pub max_commit_span_minutes: i64,

    /// Maximum attempts per `(target, class, window)` commit, transient
    /// faults only.
    pub max_retry_attempts: u32,

    /// Base delay for exponential backoff between retry attempts.
    pub retry_base_delay_ms: u64,

    /// Export profile written to new datasets.
    pub profile: ExportProfile,

    /// Data classes to stream. Intersected with what the profile allows and
    /// always appended in the fixed class order regardless of listing order
    /// here.
    pub classes: Vec<DataClass>,

    /// Chunk length along `timestamp` (minimal, waveform).
    pub chunk_timestamps: usize,

    /// Chunk length along `high_res_timestamp`.
    pub chunk_high_freq: usize,

    /// Backend cap on chunks per single commit; the executor clamps the
    /// committed window rather than splitting the commit.
    pub max_chunks_per_commit: usize,

    /// An existing dataset stops being appendable this long after its epoch
    /// start; a fresh one is created instead.
    pub days_per_dataset: i64,

    /// Grouping key: a change forces a new dataset.
    pub gas_id: String,
    pub gas_version: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_commit_span_minutes: 240,
            max_retry_attempts: 3,
            retry_base_delay_ms: 500,
            profile: ExportProfile::L1b,
            classes: DataClass::APPEND_ORDER.to_vec(),
            chunk_timestamps: 100,
            chunk_high_freq: 1000,
            max_chunks_per_commit: 64,
            days_per_dataset: 1,
            gas_id: String::new(),
            gas_version: String::new(),
        }
    }
}

impl StreamConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: StreamConfig = toml::from_str(&raw)
            .map_err(|e| StreamError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_commit_span_minutes <= 0 {
            return Err(StreamError::Config(
                "max_commit_span_minutes must be positive".into(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(StreamError::Config(
                "max_retry_attempts must be at least 1".into(),
            ));
        }
        if self.chunk_timestamps == 0 || self.chunk_high_freq == 0 {
            return Err(StreamError::Config("chunk lengths must be positive".into()));
        }
        if self.max_chunks_per_commit == 0 {
            return Err(StreamError::Config(
                "max_chunks_per_commit must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn max_commit_span(&self) -> Duration {
        Duration::minutes(self.max_commit_span_minutes)
    }

    /// Enabled classes in the fixed append order, filtered by the profile.
    pub fn enabled_classes(&self) -> Vec<DataClass> {
        DataClass::APPEND_ORDER
            .into_iter()
            .filter(|class| {
                self.classes.contains(class) && self.profile.allowed_classes().contains(class)
            })
            .collect()
    }

    /// Chunk length along the coordinate dimension of `class`. Retro grows
    /// one entry at a time.
    pub fn chunk_len(&self, class: DataClass) -> usize {
        match class {
            DataClass::Retro => 1,
            DataClass::Minimal | DataClass::Waveform => self.chunk_timestamps,
            DataClass::HighFreq => self.chunk_high_freq,
        }
    }
}
