//! Source-data collaborator seam, plus a deterministic synthetic source.
//!
//! The synthetic source ships in the library (not behind `cfg(test)`) so the
//! binary can run fully self-contained demo streams and the integration
//! tests can replay exact scenarios.

use crate::error::Result;
use crate::model::{AppendWindow, DType, DataClass, DatasetSchema, LogicalStream, RecordBatch, VariableSpec};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};

/// Reads records for one class and window from the instrument's local
/// acquisition output. Finite, one-shot per call.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Variable layout this source produces for the given classes. Used for
    /// the appendability probe and for creating new datasets.
    fn schema(&self, classes: &[DataClass]) -> DatasetSchema;

    /// Earliest timestamp available for `class`, or `None` when the source
    /// has produced nothing for it yet.
    async fn earliest(&self, class: DataClass) -> Result<Option<DateTime<Utc>>>;

    /// All records of `class` with coordinates in `[window.since,
    /// window.until)`, in ascending coordinate order.
    async fn read_records(&self, class: DataClass, window: &AppendWindow) -> Result<RecordBatch>;
}

/// Deterministic generator mimicking one instrument's output: a single retro
/// entry at campaign start, scalar channels every second, high-frequency
/// samples at 10 Hz and one waveform block per second.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    stream: LogicalStream,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

/// Samples per waveform block.
const WAVEFORM_SAMPLES: usize = 512;

impl SyntheticSource {
    pub fn new(stream: LogicalStream, start: DateTime<Utc>) -> Self {
        Self {
            stream,
            start,
            end: None,
        }
    }

    /// Stop producing records at `end`, as if the instrument went quiet.
    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    fn cadence(class: DataClass) -> Duration {
        match class {
            DataClass::Retro => Duration::zero(), // single entry at start
            DataClass::Minimal => Duration::seconds(1),
            DataClass::HighFreq => Duration::milliseconds(100),
            DataClass::Waveform => Duration::seconds(1),
        }
    }

    fn bytes_per_record(class: DataClass) -> usize {
        match class {
            DataClass::Retro => 64,
            DataClass::Minimal => 8,
            DataClass::HighFreq => 8,
            DataClass::Waveform => WAVEFORM_SAMPLES * 4,
        }
    }

    fn effective_until(&self, until: DateTime<Utc>) -> DateTime<Utc> {
        match self.end {
            Some(end) => until.min(end),
            None => until,
        }
    }
}

#[async_trait]
impl RecordSource for SyntheticSource {
    fn schema(&self, classes: &[DataClass]) -> DatasetSchema {
        let mut schema = DatasetSchema {
            attrs: self.stream.attrs(),
            ..Default::default()
        };
        for class in classes {
            match class {
                DataClass::Retro => {
                    schema.variables.insert(
                        "retro_setup".into(),
                        VariableSpec::new(&[class.dimension()], DType::Str),
                    );
                }
                DataClass::Minimal => {
                    schema.variables.insert(
                        "gas_ppb".into(),
                        VariableSpec::new(&[class.dimension()], DType::F64),
                    );
                }
                DataClass::HighFreq => {
                    schema.variables.insert(
                        "raw_intensity".into(),
                        VariableSpec::new(&[class.dimension()], DType::F64),
                    );
                }
                DataClass::Waveform => {
                    schema.variables.insert(
                        "waveform".into(),
                        VariableSpec::new(&[class.dimension(), "sample"], DType::F32),
                    );
                }
            }
        }
        schema
    }

    async fn earliest(&self, _class: DataClass) -> Result<Option<DateTime<Utc>>> {
        Ok(Some(self.start))
    }

    async fn read_records(&self, class: DataClass, window: &AppendWindow) -> Result<RecordBatch> {
        let bytes_per_record = Self::bytes_per_record(class);
        let mut timestamps = Vec::new();
        let mut payload = BytesMut::new();
        let until = self.effective_until(window.until);

        if class == DataClass::Retro {
            if self.start >= window.since && self.start < until {
                timestamps.push(self.start);
                let mut entry = format!(
                    "retro gas_id={} gas_version={}",
                    self.stream.gas_id, self.stream.gas_version
                )
                .into_bytes();
                entry.resize(bytes_per_record, b' ');
                payload.put_slice(&entry);
            }
            return Ok(RecordBatch {
                class,
                timestamps,
                payload: payload.freeze(),
                bytes_per_record,
            });
        }

        let cadence = Self::cadence(class);
        let cadence_ms = cadence.num_milliseconds();
        let floor = window.since.max(self.start);
        let offset_ms = (floor - self.start).num_milliseconds();
        // First tick at or after the window start, aligned to the cadence
        // grid anchored at campaign start.
        let first_index = (offset_ms + cadence_ms - 1) / cadence_ms;
        let mut t = self.start + Duration::milliseconds(first_index * cadence_ms);
        let mut index = first_index;

        while t < until {
            timestamps.push(t);
            match class {
                DataClass::Minimal => {
                    payload.put_f64_le(1900.0 + (index as f64 * 0.1).sin() * 40.0);
                }
                DataClass::HighFreq => {
                    payload.put_f64_le((index as f64 * 0.01).sin());
                }
                DataClass::Waveform => {
                    for sample in 0..WAVEFORM_SAMPLES {
                        payload.put_f32_le(((index as usize + sample) as f32 * 0.05).sin());
                    }
                }
                DataClass::Retro => unreachable!("handled above"),
            }
            index += 1;
            t = t + cadence;
        }

        Ok(RecordBatch {
            class,
            timestamps,
            payload: payload.freeze(),
            bytes_per_record,
        })
    }
}
