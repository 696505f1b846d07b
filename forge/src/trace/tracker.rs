//! The observability tracker: single source of truth for what happened.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::core::summary::{TraceSummary, derive_summary};
use crate::core::types::StageStatus;
use crate::trace::event::{EventType, TraceEvent, preview};
use crate::trace::sink::TraceSink;

const PROMPT_PREVIEW_LIMIT: usize = 200;
const OUTPUT_PREVIEW_LIMIT: usize = 200;
const RESULT_PREVIEW_LIMIT: usize = 500;

/// Bookkeeping for one stage execution, maintained from the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub agent_name: String,
    pub status: StageStatus,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub turns: u32,
    pub tool_call_count: u32,
}

#[derive(Debug, Clone)]
struct PendingToolCall {
    step_name: String,
    tool_name: String,
    timestamp: f64,
}

/// Ordered event log plus a durable sink.
///
/// Every `record_*` call persists the event through the sink before
/// returning, so the on-disk trace is never behind the in-memory log. The
/// summary is always re-derived from the log; there are no auxiliary
/// counters that could drift from it.
pub struct Tracker<S: TraceSink> {
    sink: S,
    events: Vec<TraceEvent>,
    stages: Vec<StageRecord>,
    pending_tool_calls: Vec<PendingToolCall>,
    start_time: f64,
}

impl<S: TraceSink> Tracker<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            events: Vec::new(),
            stages: Vec::new(),
            pending_tool_calls: Vec::new(),
            start_time: wall_clock(),
        }
    }

    /// Current timestamp, clamped so event times never decrease within a run.
    fn now(&self) -> f64 {
        let now = wall_clock();
        match self.events.last() {
            Some(last) if now < last.timestamp => last.timestamp,
            _ => now,
        }
    }

    /// Persist then append. The durable write happens first so a crash after
    /// `record` returns can never lose the event.
    fn record(&mut self, event: TraceEvent) -> Result<()> {
        self.sink.append(&event)?;
        self.events.push(event);
        Ok(())
    }

    fn stage_mut(&mut self, step_name: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|stage| stage.name == step_name)
    }

    pub fn start_agent(
        &mut self,
        step_name: &str,
        agent_name: &str,
        cycle: Option<u32>,
        instructions: &str,
    ) -> Result<()> {
        let timestamp = self.now();
        let record = StageRecord {
            name: step_name.to_string(),
            agent_name: agent_name.to_string(),
            status: StageStatus::InProgress,
            start_time: timestamp,
            end_time: None,
            turns: 0,
            tool_call_count: 0,
        };
        // A rerun of the same-named step replaces only its own record.
        if let Some(existing) = self.stage_mut(step_name) {
            *existing = record;
        } else {
            self.stages.push(record);
        }

        let mut event = TraceEvent::base(EventType::AgentStart, timestamp);
        event.step_name = Some(step_name.to_string());
        event.agent_name = Some(agent_name.to_string());
        event.cycle = cycle;
        event.message = Some(format!("starting {agent_name} for {step_name}"));
        event.metadata.insert(
            "prompt".to_string(),
            json!(preview(instructions, PROMPT_PREVIEW_LIMIT)),
        );
        self.record(event)
    }

    pub fn end_agent(&mut self, step_name: &str, output: &str, success: bool) -> Result<()> {
        let timestamp = self.now();
        let mut agent_name = None;
        let mut duration = None;
        if let Some(stage) = self.stage_mut(step_name) {
            stage.end_time = Some(timestamp);
            stage.status = if success {
                StageStatus::Completed
            } else {
                StageStatus::Failed
            };
            agent_name = Some(stage.agent_name.clone());
            duration = Some((timestamp - stage.start_time).max(0.0));
        }

        let mut event = TraceEvent::base(EventType::AgentEnd, timestamp);
        event.step_name = Some(step_name.to_string());
        event.agent_name = agent_name;
        event.message = Some(format!("completed {step_name}"));
        event.metadata.insert("success".to_string(), json!(success));
        event.metadata.insert(
            "output".to_string(),
            json!(preview(output, OUTPUT_PREVIEW_LIMIT)),
        );
        if let Some(duration) = duration {
            event.metadata.insert("duration".to_string(), json!(duration));
        }
        self.record(event)
    }

    pub fn record_turn(&mut self, step_name: &str, turn: u32) -> Result<()> {
        let mut agent_name = None;
        if let Some(stage) = self.stage_mut(step_name) {
            stage.turns = stage.turns.max(turn);
            agent_name = Some(stage.agent_name.clone());
        }
        let mut event = TraceEvent::base(EventType::AgentTurn, self.now());
        event.step_name = Some(step_name.to_string());
        event.agent_name = agent_name;
        event.turn = Some(turn);
        event.message = Some(format!("turn {turn}"));
        self.record(event)
    }

    /// Record a tool call and return its timestamp for duration pairing.
    pub fn record_tool_call(
        &mut self,
        step_name: &str,
        tool_name: &str,
        tool_args: Value,
    ) -> Result<f64> {
        let timestamp = self.now();
        self.pending_tool_calls.push(PendingToolCall {
            step_name: step_name.to_string(),
            tool_name: tool_name.to_string(),
            timestamp,
        });

        let mut event = TraceEvent::base(EventType::ToolCall, timestamp);
        event.step_name = Some(step_name.to_string());
        event.agent_name = self
            .stages
            .iter()
            .find(|stage| stage.name == step_name)
            .map(|stage| stage.agent_name.clone());
        event.tool_name = Some(tool_name.to_string());
        event.tool_args = Some(tool_args);
        event.message = Some(format!("calling {tool_name}"));
        self.record(event)?;
        Ok(timestamp)
    }

    /// Record a tool result, pairing it with the earliest matching call.
    ///
    /// A result with no matching prior call is a programming error and is
    /// rejected rather than fabricating a call. The recorded duration is the
    /// runtime-reported one when available, otherwise elapsed wall clock,
    /// clamped non-negative either way.
    pub fn record_tool_result(
        &mut self,
        step_name: &str,
        tool_name: &str,
        result: &str,
        reported_duration: Option<f64>,
    ) -> Result<()> {
        let position = self
            .pending_tool_calls
            .iter()
            .position(|call| call.step_name == step_name && call.tool_name == tool_name);
        let Some(position) = position else {
            bail!("tool result for '{tool_name}' in '{step_name}' has no matching tool call");
        };
        let call = self.pending_tool_calls.remove(position);

        let timestamp = self.now();
        let duration = reported_duration
            .unwrap_or(timestamp - call.timestamp)
            .max(0.0);
        let mut agent_name = None;
        if let Some(stage) = self.stage_mut(step_name) {
            stage.tool_call_count += 1;
            agent_name = Some(stage.agent_name.clone());
        }

        let mut event = TraceEvent::base(EventType::ToolResult, timestamp);
        event.step_name = Some(step_name.to_string());
        event.agent_name = agent_name;
        event.tool_name = Some(tool_name.to_string());
        event.tool_result = Some(preview(result, RESULT_PREVIEW_LIMIT));
        event.tool_duration = Some(duration);
        event.message = Some(format!("completed {tool_name} in {duration:.2}s"));
        self.record(event)
    }

    pub fn record_decision(
        &mut self,
        step_name: &str,
        decision: &str,
        reasoning: &str,
        cycle: Option<u32>,
    ) -> Result<()> {
        let mut event = TraceEvent::base(EventType::DecisionPoint, self.now());
        event.step_name = Some(step_name.to_string());
        event.agent_name = self
            .stages
            .iter()
            .find(|stage| stage.name == step_name)
            .map(|stage| stage.agent_name.clone());
        event.cycle = cycle;
        event.decision = Some(decision.to_string());
        event.reasoning = Some(reasoning.to_string());
        event.message = Some(format!("decision: {decision}"));
        self.record(event)
    }

    pub fn record_validation(
        &mut self,
        step_name: &str,
        validation_type: &str,
        success: bool,
        message: &str,
        details: Value,
    ) -> Result<()> {
        let mut event = TraceEvent::base(EventType::Validation, self.now());
        event.step_name = Some(step_name.to_string());
        event.message = Some(message.to_string());
        event
            .metadata
            .insert("validation_type".to_string(), json!(validation_type));
        event.metadata.insert("success".to_string(), json!(success));
        event.metadata.insert("details".to_string(), details);
        self.record(event)
    }

    pub fn record_error(&mut self, step_name: Option<&str>, message: &str) -> Result<()> {
        let mut event = TraceEvent::base(EventType::Error, self.now());
        event.step_name = step_name.map(str::to_string);
        event.agent_name = step_name.and_then(|step| {
            self.stages
                .iter()
                .find(|stage| stage.name == step)
                .map(|stage| stage.agent_name.clone())
        });
        event.message = Some(message.to_string());
        self.record(event)
    }

    pub fn record_note(&mut self, message: &str, metadata: Option<Map<String, Value>>) -> Result<()> {
        let mut event = TraceEvent::base(EventType::Note, self.now());
        event.message = Some(message.to_string());
        if let Some(metadata) = metadata {
            event.metadata = metadata;
        }
        self.record(event)
    }

    /// Derive the summary from the event log alone.
    pub fn get_summary(&self) -> TraceSummary {
        derive_summary(&self.events)
    }

    /// Serialize the full log plus the derived summary as one snapshot.
    pub fn export(&self, path: &Path, workflow_slug: &str) -> Result<()> {
        let snapshot = json!({
            "workflow_slug": workflow_slug,
            "start_time": self.start_time,
            "summary": self.get_summary(),
            "events": self.events,
        });
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create export dir {}", parent.display()))?;
        }
        let mut buf = serde_json::to_string_pretty(&snapshot).context("serialize trace export")?;
        buf.push('\n');
        fs::write(path, buf).with_context(|| format!("write trace export {}", path.display()))
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn stage(&self, step_name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| stage.name == step_name)
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }
}

fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
