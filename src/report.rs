//! Structured per-cycle and per-run results.
//!
//! Reports are the machine-readable surface of the engine: one JSON line per
//! cycle on stdout when requested, and a summary at session end. Nothing is
//! silently dropped; every enabled class shows up in every cycle with an
//! explicit outcome.

use crate::model::{AppendWindow, DataClass};
use serde::Serialize;

/// What happened to one class during one cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClassOutcome {
    Committed {
        window: AppendWindow,
        commit_id: String,
        records: usize,
        bytes: u64,
    },
    Skipped {
        reason: String,
    },
    Failed {
        classification: &'static str,
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassReport {
    pub class: DataClass,
    #[serde(flatten)]
    pub outcome: ClassOutcome,
}

/// Result of one full discovery-plan-append cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Encoded path of the target dataset.
    pub target: String,
    /// Whether the cycle planned to create the target.
    pub creating: bool,
    pub classes: Vec<ClassReport>,
    /// Every enabled class had an empty window; nothing left to stream.
    pub caught_up: bool,
    /// At least one class failed this cycle.
    pub degraded: bool,
}

impl CycleReport {
    pub fn committed_records(&self) -> usize {
        self.classes
            .iter()
            .map(|report| match report.outcome {
                ClassOutcome::Committed { records, .. } => records,
                _ => 0,
            })
            .sum()
    }

    pub fn committed_bytes(&self) -> u64 {
        self.classes
            .iter()
            .map(|report| match report.outcome {
                ClassOutcome::Committed { bytes, .. } => bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn commit_count(&self) -> usize {
        self.classes
            .iter()
            .filter(|report| matches!(report.outcome, ClassOutcome::Committed { .. }))
            .count()
    }

    /// The target vanished mid-cycle; the next cycle must re-discover.
    pub fn needs_rediscovery(&self) -> bool {
        self.classes.iter().any(|report| {
            matches!(
                report.outcome,
                ClassOutcome::Failed {
                    classification: "repository_missing",
                    ..
                }
            )
        })
    }
}

/// Totals across all cycles of one session run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSummary {
    pub cycles: usize,
    pub commits: usize,
    pub records: usize,
    pub bytes: u64,
    pub degraded_cycles: usize,
}

impl SessionSummary {
    pub fn absorb(&mut self, cycle: &CycleReport) {
        self.cycles += 1;
        self.commits += cycle.commit_count();
        self.records += cycle.committed_records();
        self.bytes += cycle.committed_bytes();
        if cycle.degraded {
            self.degraded_cycles += 1;
        }
    }
}
