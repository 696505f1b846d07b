//! Summary derivation: a pure fold over the event log.
//!
//! The summary keeps no state of its own. Everything is reconstructed from
//! the ordered event slice, which is what makes a persisted trace auditable
//! after a crash: replaying the JSONL file yields the identical summary.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::trace::event::{EventType, TraceEvent};

/// Name used to bucket tool calls whose event carries no agent name.
const UNKNOWN_AGENT: &str = "(unknown)";

/// Per-step aggregate reconstructed from the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepTrace {
    pub agent_name: Option<String>,
    /// Seconds between the step's agent_start and agent_end, when both exist.
    pub duration: Option<f64>,
    pub turns: u32,
    pub tool_calls_count: usize,
    pub decisions_count: usize,
}

/// Aggregate view of one run, derived purely from the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceSummary {
    pub total_duration: f64,
    pub formatted_duration: String,
    pub total_events: usize,
    pub total_agents: usize,
    pub tool_calls_by_agent: BTreeMap<String, usize>,
    pub traces: BTreeMap<String, StepTrace>,
}

/// Fold the event log into a [`TraceSummary`].
///
/// Deterministic and idempotent: the same slice always yields the same
/// summary, with map keys in lexicographic order.
pub fn derive_summary(events: &[TraceEvent]) -> TraceSummary {
    let mut traces: BTreeMap<String, StepTrace> = BTreeMap::new();
    let mut starts: BTreeMap<String, f64> = BTreeMap::new();
    let mut tool_calls_by_agent: BTreeMap<String, usize> = BTreeMap::new();

    for event in events {
        let step = event.step_name.clone().unwrap_or_default();
        match event.event_type {
            EventType::AgentStart => {
                let trace = traces.entry(step.clone()).or_default();
                trace.agent_name = event.agent_name.clone();
                starts.insert(step, event.timestamp);
            }
            EventType::AgentEnd => {
                let trace = traces.entry(step.clone()).or_default();
                if let Some(start) = starts.get(&step) {
                    trace.duration = Some((event.timestamp - start).max(0.0));
                }
            }
            EventType::AgentTurn => {
                let trace = traces.entry(step).or_default();
                trace.turns = trace.turns.max(event.turn.unwrap_or(0));
            }
            EventType::ToolCall => {
                traces.entry(step).or_default().tool_calls_count += 1;
                let agent = event
                    .agent_name
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_AGENT.to_string());
                *tool_calls_by_agent.entry(agent).or_default() += 1;
            }
            EventType::DecisionPoint => {
                traces.entry(step).or_default().decisions_count += 1;
            }
            EventType::ToolResult
            | EventType::Validation
            | EventType::Error
            | EventType::Note => {}
        }
    }

    let total_duration = match (events.first(), events.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0.0),
        _ => 0.0,
    };

    TraceSummary {
        total_duration,
        formatted_duration: format_duration(total_duration),
        total_events: events.len(),
        total_agents: traces.len(),
        tool_calls_by_agent,
        traces,
    }
}

/// Human-readable duration, second precision below a minute.
pub fn format_duration(duration: f64) -> String {
    if duration < 60.0 {
        format!("{duration:.2}s")
    } else if duration < 3600.0 {
        let minutes = (duration / 60.0) as u64;
        let seconds = duration % 60.0;
        format!("{minutes}m {seconds:.1}s")
    } else {
        let hours = (duration / 3600.0) as u64;
        let minutes = ((duration % 3600.0) / 60.0) as u64;
        format!("{hours}h {minutes}m")
    }
}
