//! Shared primitive types used across the entire pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamps are wall-clock readings with no zone attached.
pub type Timestamp = chrono::NaiveDateTime;

/// The canonical run identifier.
pub type RunId = String;

/// Canonical text form used for persistence and raw re-rendering.
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which raw feed a dataset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Weather,
    Traffic,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Weather => "weather",
            Self::Traffic => "traffic",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
