//! Terminal error taxonomy for the sequencer.
//!
//! These are plain structs so callers can `downcast_ref` through `anyhow`
//! and map each terminal condition to a stable exit code. Every message
//! carries the stage name, the cycle at which a bound was exhausted, and
//! the last recorded reasoning, so a human can find the exact cycle in the
//! trace log.

use std::error::Error;
use std::fmt;

/// Planning produced no usable contract. Fatal, never retried: with no
/// contract, nothing downstream can be validated.
#[derive(Debug, Clone)]
pub struct PlanningError {
    pub stage: String,
    pub reason: String,
}

impl fmt::Display for PlanningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "planning failed in '{}': {}", self.stage, self.reason)
    }
}

impl Error for PlanningError {}

/// The generation loop exhausted its bound without a passing artifact.
#[derive(Debug, Clone)]
pub struct ContractExhaustedError {
    pub stage: String,
    pub cycles: u32,
    pub last_failure: String,
}

impl fmt::Display for ContractExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "contract validation failed after {} generation cycle(s), last at '{}': {}",
            self.cycles, self.stage, self.last_failure
        )
    }
}

impl Error for ContractExhaustedError {}

/// The review loop exhausted its bound without an APPROVED decision. An
/// unapproved artifact is never presented as final.
#[derive(Debug, Clone)]
pub struct ReviewExhaustedError {
    pub stage: String,
    pub cycles: u32,
    pub last_reasoning: String,
}

impl fmt::Display for ReviewExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "review not approved after {} cycle(s), last at '{}': {}",
            self.cycles, self.stage, self.last_reasoning
        )
    }
}

impl Error for ReviewExhaustedError {}

/// The built implementation misses expected tools under strict coverage.
#[derive(Debug, Clone)]
pub struct ToolCoverageError {
    pub stage: String,
    pub missing: Vec<String>,
}

impl fmt::Display for ToolCoverageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "implementation at '{}' is missing expected tools: {}",
            self.stage,
            self.missing.join(", ")
        )
    }
}

impl Error for ToolCoverageError {}

/// The testing stage failed and the configured policy treats that as fatal.
#[derive(Debug, Clone)]
pub struct TestingFailedError {
    pub stage: String,
    pub reason: String,
}

impl fmt::Display for TestingFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "testing failed in '{}': {}", self.stage, self.reason)
    }
}

impl Error for TestingFailedError {}
