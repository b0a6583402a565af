//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between components and the on-disk
//! record formats. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of an independent unit of work within a stage.
///
/// Founders are identified by provider name (`openai`). Stage-3 investor
/// evaluations use `investor@founder` (see [`evaluation_id`]).
pub type ParticipantId = String;

/// One of the three sequential pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Ideate and select.
    Stage1,
    /// Build and iterate.
    Stage2,
    /// Seed pitch.
    Stage3,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Stage1, Stage::Stage2, Stage::Stage3];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Stage1 => "stage1",
            Stage::Stage2 => "stage2",
            Stage::Stage3 => "stage3",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Stage::Stage1 => "Ideate and Select",
            Stage::Stage2 => "Build and Iterate",
            Stage::Stage3 => "Seed Pitch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant's result for a stage, as stored in backing files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutputRecord {
    pub participant: ParticipantId,
    /// Plan iteration for stage 2; `0` for single-shot records.
    #[serde(default)]
    pub version: u32,
    /// Normalized and validated payload.
    pub payload: Value,
}

impl StageOutputRecord {
    pub fn new(participant: impl Into<ParticipantId>, version: u32, payload: Value) -> Self {
        Self {
            participant: participant.into(),
            version,
            payload,
        }
    }
}

/// Failure ledger entry for one participant in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub participant: ParticipantId,
    pub stage: Stage,
    /// Stringified error chain, truncated to the configured bound.
    pub reason: String,
    /// RFC 3339 timestamp of when the failure was recorded.
    pub timestamp: String,
}

/// Participant id for one investor evaluating one founder's pitch.
pub fn evaluation_id(investor: &str, founder: &str) -> ParticipantId {
    format!("{investor}@{founder}")
}

/// Truncate `reason` to at most `limit` characters, marking the cut.
pub fn truncate_reason(reason: &str, limit: usize) -> String {
    if reason.chars().count() <= limit {
        return reason.to_string();
    }
    let kept: String = reason.chars().take(limit).collect();
    format!("{kept}... [truncated]")
}
