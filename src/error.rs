//! Error taxonomy for the streaming engine.
//!
//! Transient faults (`Network`, `ConflictingWriter`) are retried inside the
//! commit executor; everything else propagates to the session, which decides
//! per-class continuation vs. halting the cycle.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Listing or opening against the backend could not complete at all.
    /// Fatal for the cycle; the session halts and reports.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// A listed path does not match either dataset path grammar.
    /// Skipped during discovery, never fatal.
    #[error("malformed dataset path: {0}")]
    MalformedPath(String),

    /// The existing target cannot accept the configured variable set.
    /// Requires operator intervention; there is no auto-migration.
    #[error("schema incompatible: {0}")]
    SchemaIncompatible(String),

    /// Connectivity dropped mid-transfer. Retryable.
    #[error("network failure: {0}")]
    Network(String),

    /// The target path vanished or was never created. Not retryable here;
    /// the session must re-plan.
    #[error("repository missing: {0}")]
    RepositoryMissing(String),

    /// Another writer holds the transaction. Retryable after backoff.
    #[error("conflicting writer on {0}")]
    ConflictingWriter(String),

    /// Transient retries were exhausted. Fatal for this class this cycle.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<StreamError>,
    },

    /// External cancellation aborted a backoff wait or a not-yet-started
    /// class. Never aborts a commit already issued to the store.
    #[error("cancelled")]
    Cancelled,

    /// The store rejected an append that would rewind or duplicate
    /// coordinate entries. Not retryable; indicates a stale window.
    #[error("non-monotonic append on {class}: {detail}")]
    NonMonotonicAppend { class: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StreamError {
    /// Whether the commit executor should retry this fault with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::Network(_) | StreamError::ConflictingWriter(_)
        )
    }

    /// Short stable label used in per-cycle reports.
    pub fn classification(&self) -> &'static str {
        match self {
            StreamError::BackendUnreachable(_) => "backend_unreachable",
            StreamError::MalformedPath(_) => "malformed_path",
            StreamError::SchemaIncompatible(_) => "schema_incompatible",
            StreamError::Network(_) => "network_failure",
            StreamError::RepositoryMissing(_) => "repository_missing",
            StreamError::ConflictingWriter(_) => "conflicting_writer",
            StreamError::ExhaustedRetries { .. } => "exhausted_retries",
            StreamError::NonMonotonicAppend { .. } => "non_monotonic_append",
            StreamError::Cancelled => "cancelled",
            StreamError::Config(_) => "config",
            StreamError::Io(_) => "io",
            StreamError::Serde(_) => "serde",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StreamError::Network("drop".into()).is_transient());
        assert!(StreamError::ConflictingWriter("a/b/c".into()).is_transient());
        assert!(!StreamError::RepositoryMissing("a/b/c".into()).is_transient());
        assert!(!StreamError::BackendUnreachable("dns".into()).is_transient());
        assert!(!StreamError::ExhaustedRetries {
            attempts: 3,
            last: Box::new(StreamError::Network("drop".into())),
        }
        .is_transient());
    }
}
