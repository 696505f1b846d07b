//! Shared deterministic types for pipeline core logic.
//!
//! These types define stable contracts between the sequencer and its
//! collaborators. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Tag for the six agent-backed stage families.
///
/// The sequencer dispatches on this tag rather than on agent identity
/// strings, which keeps the control-flow state machine closed and
/// exhaustively matchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Plan,
    Synthesize,
    Execute,
    Build,
    Review,
    Test,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Plan => "plan",
            StageKind::Synthesize => "synthesize",
            StageKind::Execute => "execute",
            StageKind::Build => "build",
            StageKind::Review => "review",
            StageKind::Test => "test",
        }
    }
}

/// Lifecycle status of one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// Reviewer verdict for one review cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Approved,
    RevisionsNeeded,
}

impl ReviewVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewVerdict::Approved => "APPROVED",
            ReviewVerdict::RevisionsNeeded => "REVISIONS_NEEDED",
        }
    }
}

/// Result of one bounded-loop cycle body.
///
/// Fatal conditions are returned as errors; everything else is an explicit
/// value the sequencer interprets, so loop termination never rides on
/// error propagation through intermediate layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle satisfied its gate; the loop may exit.
    Pass,
    /// The cycle failed recoverably; retry with this feedback.
    Retry(String),
}

/// Output of one completed stage, as stored in the workflow context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Unique, cycle-suffixed step name (e.g. `code_review_cycle_2`).
    pub name: String,
    pub agent_name: String,
    /// Final output text reported by the agent runtime.
    pub output: String,
}
