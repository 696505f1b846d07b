//! Orchestration for a single agent-backed stage.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{StageKind, StageResult};
use crate::io::config::PipelineConfig;
use crate::io::paths::OutputPaths;
use crate::io::prompt::stage_spec;
use crate::io::runtime::{AgentRequest, AgentRuntime};
use crate::trace::sink::TraceSink;
use crate::trace::tracker::Tracker;

/// One stage invocation: kind, unique step name, and rendered instructions.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub kind: StageKind,
    pub step_name: String,
    pub cycle: Option<u32>,
    pub instructions: String,
}

/// What a stage invocation came to.
///
/// Runtime failures (timeouts, budget exhaustion, model errors) surface as
/// `Failed` values for the owning bounded loop to interpret; `Err` is
/// reserved for tracker faults, which are not part of loop policy.
#[derive(Debug, Clone)]
pub enum StageAttempt {
    Completed(StageResult),
    Failed(String),
}

/// Execute one stage: emit the paired agent events, replay the runtime's
/// tool invocations into the tracker, and capture the stage result.
pub fn run_stage<R: AgentRuntime, S: TraceSink>(
    runtime: &R,
    tracker: &mut Tracker<S>,
    paths: &OutputPaths,
    config: &PipelineConfig,
    workspace_root: &Path,
    run: &StageRun,
) -> Result<StageAttempt> {
    let spec = stage_spec(run.kind);
    let (response_path, runtime_log_path) = paths.runtime_files(&run.step_name);

    tracker.start_agent(&run.step_name, spec.agent_name, run.cycle, &run.instructions)?;

    let request = AgentRequest {
        stage_name: run.step_name.clone(),
        agent_name: spec.agent_name.to_string(),
        instructions: run.instructions.clone(),
        available_tools: spec
            .available_tools
            .iter()
            .map(|tool| (*tool).to_string())
            .collect(),
        max_turns: config.max_turns_per_agent,
        workdir: workspace_root.to_path_buf(),
        timeout: Duration::from_secs(config.tool_timeout_secs),
        response_path,
        runtime_log_path,
        output_limit_bytes: config.output_limit_bytes,
    };

    let response = match runtime.run(&request) {
        Ok(response) => response,
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(stage = %run.step_name, "agent invocation failed: {reason}");
            tracker.record_error(Some(&run.step_name), &reason)?;
            tracker.end_agent(&run.step_name, "(no final output)", false)?;
            return Ok(StageAttempt::Failed(reason));
        }
    };

    for invocation in &response.tool_invocations {
        tracker.record_tool_call(&run.step_name, &invocation.name, invocation.args.clone())?;
        tracker.record_tool_result(
            &run.step_name,
            &invocation.name,
            &render_tool_result(&invocation.result),
            Some(invocation.duration_secs),
        )?;
    }
    tracker.record_turn(&run.step_name, response.turns_used)?;
    tracker.end_agent(&run.step_name, &response.final_output, true)?;

    debug!(stage = %run.step_name, tools = response.tool_invocations.len(), "stage completed");
    Ok(StageAttempt::Completed(StageResult {
        name: run.step_name.clone(),
        agent_name: spec.agent_name.to_string(),
        output: response.final_output.trim().to_string(),
    }))
}

fn render_tool_result(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
