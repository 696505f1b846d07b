//! Test-only fakes: scripted runtimes, in-memory sinks, and a ready-made
//! pipeline workspace. Enabled for unit tests and via the `test-support`
//! feature for integration suites.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;

use anyhow::{Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::context::WorkflowContext;
use crate::io::config::PipelineConfig;
use crate::io::paths::OutputPaths;
use crate::io::runtime::{AgentRequest, AgentResponse, AgentRuntime, ToolInvocation};
use crate::trace::event::TraceEvent;
use crate::trace::sink::TraceSink;

/// Sink that keeps events in memory for assertions.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<TraceEvent>,
}

impl TraceSink for MemorySink {
    fn append(&mut self, event: &TraceEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ScriptedOutcome {
    Respond(AgentResponse),
    Fail(String),
}

/// One scripted agent invocation: the outcome plus any files the fake agent
/// drops into the workspace before returning (the way a real build or
/// synthesis stage would).
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    outcome: ScriptedOutcome,
    writes: Vec<(String, String)>,
}

impl ScriptedStep {
    pub fn respond(response: AgentResponse) -> Self {
        Self {
            outcome: ScriptedOutcome::Respond(response),
            writes: Vec::new(),
        }
    }

    /// A plain completion with no tool activity.
    pub fn respond_text(text: &str) -> Self {
        Self::respond(AgentResponse {
            final_output: text.to_string(),
            tool_invocations: Vec::new(),
            turns_used: 1,
        })
    }

    /// A runtime-level failure (timeout, budget exhaustion, model error).
    pub fn fail(reason: &str) -> Self {
        Self {
            outcome: ScriptedOutcome::Fail(reason.to_string()),
            writes: Vec::new(),
        }
    }

    /// Drop a file (workspace-relative) before returning the outcome.
    pub fn with_write(mut self, relative_path: &str, contents: &str) -> Self {
        self.writes.push((relative_path.to_string(), contents.to_string()));
        self
    }

    pub fn with_tool(mut self, name: &str) -> Self {
        if let ScriptedOutcome::Respond(response) = &mut self.outcome {
            response.tool_invocations.push(ToolInvocation {
                name: name.to_string(),
                args: json!({}),
                result: json!("ok"),
                duration_secs: 0.01,
            });
        }
        self
    }

    /// Planner completion whose output carries the harness contract.
    pub fn plan_with_contract() -> Self {
        let body = json!({
            "required_keys": {"users": ["id", "name"]},
        });
        Self::respond_text(&format!(
            "Plan recorded for the demo service.\n\n```json\n{body}\n```"
        ))
        .with_tool("describe_schema")
    }

    /// Synthesizer completion that writes a contract-satisfying artifact.
    pub fn synthesize_with_artifact(harness: &PipelineHarness) -> Self {
        let artifact = json!({
            "users": [
                {"id": 1, "name": "Ada"},
                {"id": 2, "name": "Grace"},
            ]
        });
        Self::respond_text("data module and artifact written")
            .with_write(&harness.data_json_rel(), &artifact.to_string())
            .with_tool("write_text")
            .with_tool("write_json")
    }

    /// Builder completion that writes metadata covering the schema tools.
    pub fn build_with_metadata(harness: &PipelineHarness) -> Self {
        let metadata = json!({
            "name": "demo",
            "description": "Offline demo service",
            "tools": [
                {"name": "lookup", "description": "Look up a record."}
            ]
        });
        Self::respond_text("service module and metadata written")
            .with_write(&harness.metadata_json_rel(), &metadata.to_string())
            .with_tool("write_json")
    }
}

/// Runtime that replays a fixed script of outcomes.
pub struct ScriptedRuntime {
    steps: RefCell<VecDeque<ScriptedStep>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedRuntime {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// True when every scripted step was consumed.
    pub fn is_exhausted(&self) -> bool {
        self.steps.borrow().is_empty()
    }

    /// Step names in invocation order.
    pub fn invocations(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|request| request.stage_name.clone())
            .collect()
    }

    /// Full requests in invocation order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }
}

impl AgentRuntime for ScriptedRuntime {
    fn run(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.requests.borrow_mut().push(request.clone());
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted runtime exhausted at stage {}", request.stage_name))?;

        for (relative_path, contents) in &step.writes {
            let path = request.workdir.join(relative_path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }

        match step.outcome {
            ScriptedOutcome::Respond(response) => Ok(response),
            ScriptedOutcome::Fail(reason) => Err(anyhow!(reason)),
        }
    }
}

/// A complete tempdir-backed workspace for pipeline tests: schema on disk,
/// output layout created, context and default config prepared.
pub struct PipelineHarness {
    pub temp: TempDir,
    pub paths: OutputPaths,
    pub context: WorkflowContext,
    pub config: PipelineConfig,
}

impl PipelineHarness {
    pub fn new() -> Self {
        Self::with_tools(&["lookup"])
    }

    /// Workspace whose schema declares the given tool names.
    pub fn with_tools(tool_names: &[&str]) -> Self {
        let temp = TempDir::new().expect("tempdir");
        let schema = json!({
            "metadata": {
                "server_info_crawled": {
                    "name": "Demo Service",
                    "tools": tool_names
                        .iter()
                        .map(|name| json!({"name": name, "description": "demo tool"}))
                        .collect::<Vec<_>>(),
                }
            }
        });
        let schema_path = temp.path().join("schema.json");
        fs::write(&schema_path, schema.to_string()).expect("write schema");

        let paths = OutputPaths::new(temp.path(), "demo", None);
        paths.ensure_layout().expect("layout");
        let context = WorkflowContext::new(
            temp.path().to_path_buf(),
            schema_path,
            schema,
            "demo".to_string(),
            None,
            &paths,
        );

        Self {
            temp,
            paths,
            context,
            config: PipelineConfig::default(),
        }
    }

    pub fn data_json_rel(&self) -> String {
        self.context.relative(&self.paths.data_json_path)
    }

    pub fn metadata_json_rel(&self) -> String {
        self.context.relative(&self.paths.metadata_json_path)
    }
}

impl Default for PipelineHarness {
    fn default() -> Self {
        Self::new()
    }
}
