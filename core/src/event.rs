//! Pipeline events: the run's audit trail.
//!
//! RULE: Non-fatal conditions (dropped, imputed, clipped, unmatched rows)
//! are never swallowed. Each stage reports them as events, and the
//! engine appends every event to the run's log in emission order.

use crate::types::{RunId, SourceKind};
use serde::{Deserialize, Serialize};

/// Every event emitted during a run.
/// Variants are appended over time, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // ── Engine events ──────────────────────────────
    RunInitialized {
        run_id: RunId,
        seed: u64,
    },
    StageStarted {
        stage: String,
    },
    StageCompleted {
        stage: String,
        output_rows: usize,
    },
    StageFailed {
        stage: String,
        error: String,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },

    // ── Warnings ───────────────────────────────────
    DataQualityWarning {
        source: SourceKind,
        issue: DataQualityIssue,
        count: usize,
    },
    JoinMismatchWarning {
        weather_unmatched: usize,
        traffic_unmatched: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQualityIssue {
    DuplicateRemoved,
    MissingKeyDropped,
    InvalidTimestampDropped,
    KeyConflictDropped,
    UnimputableDropped,
    OutlierDropped,
    ValueImputed,
    LabelImputed,
    ValueCoerced,
    SignCorrected,
    ValueClipped,
}

/// Persisted form of one event.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub run_id: RunId,
    pub seq: u64,
    pub stage: String,
    pub event_type: String,
    pub payload: String,
}

/// Extract a stable string name from a PipelineEvent variant.
/// Used for the event_type column in event_log.
pub fn event_type_name(event: &PipelineEvent) -> &'static str {
    match event {
        PipelineEvent::RunInitialized { .. }      => "run_initialized",
        PipelineEvent::StageStarted { .. }        => "stage_started",
        PipelineEvent::StageCompleted { .. }      => "stage_completed",
        PipelineEvent::StageFailed { .. }         => "stage_failed",
        PipelineEvent::StageSkipped { .. }        => "stage_skipped",
        PipelineEvent::DataQualityWarning { .. }  => "data_quality_warning",
        PipelineEvent::JoinMismatchWarning { .. } => "join_mismatch_warning",
    }
}
