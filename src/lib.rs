//! floe - resumable streaming appender for instrument time series.
//!
//! Ingests multi-rate instrument records (retro, minimal, high-freq,
//! waveform) into a versioned chunked-array store. All resume state is
//! derived from the remote store itself; a crashed or restarted process
//! continues exactly past the last committed coordinate with no local state
//! file.
//!
//! # Architecture
//!
//! ```text
//! +----------+     +---------+     +----------------+     +----------+
//! | locator  | --> |  plan   | --> |    commit      | --> |  store   |
//! | discover |     | windows |     | write + retry  |     | chunked  |
//! +----------+     +---------+     +----------------+     +----------+
//!       ^               ^
//!       |               |
//!   path grammar    resume (store-derived since/until)
//! ```
//!
//! `session` drives the cycle; `source` feeds records; `report` is the
//! machine-readable outcome surface.

pub mod cancel;
pub mod commit;
pub mod config;
pub mod error;
pub mod locator;
pub mod model;
pub mod path;
pub mod plan;
pub mod report;
pub mod resume;
pub mod session;
pub mod source;
pub mod store;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use model::{AppendWindow, DataClass, DatasetSchema, LogicalStream, RecordBatch};
pub use path::{DatasetRef, ExportProfile, PathShape};
pub use report::{ClassOutcome, ClassReport, CycleReport, SessionSummary};
pub use session::StreamingSession;
pub use source::{RecordSource, SyntheticSource};
pub use store::{ChunkStore, CommitId, OpenMode, PathLister, StoreSession};
