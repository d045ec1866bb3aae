use crate::types::SourceKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The schema is malformed, or the raw input does not declare a field it names.
    /// Fatal for that source only.
    #[error("Schema error ({source_kind}): {reason}")]
    Schema {
        source_kind: SourceKind,
        reason: String,
    },

    /// A stage was handed input it cannot work with.
    #[error("Precondition failed in {stage}: {reason}")]
    Precondition {
        stage: &'static str,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn schema(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        Self::Schema {
            source_kind,
            reason: reason.into(),
        }
    }

    pub fn precondition(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Precondition {
            stage,
            reason: reason.into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
