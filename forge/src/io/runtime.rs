//! Agent runtime abstraction.
//!
//! The [`AgentRuntime`] trait decouples stage orchestration from the actual
//! LLM agent backend. The sequencer only ever sees the final output and the
//! structured list of tool invocations; prompt handling, model calls, and
//! sandboxed tool execution all live behind this seam. Tests use scripted
//! runtimes that return predetermined responses without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_with_timeout;

const RESPONSE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/agent_response.schema.json"
));

/// One tool execution reported by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub duration_secs: f64,
}

/// What an agent invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub final_output: String,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    #[serde(default = "default_turns")]
    pub turns_used: u32,
}

fn default_turns() -> u32 {
    1
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Cycle-suffixed step name, used for logging and artifact naming.
    pub stage_name: String,
    pub agent_name: String,
    /// Rendered instructions fed to the agent.
    pub instructions: String,
    /// Tool identifiers the agent may use.
    pub available_tools: Vec<String>,
    /// Turn budget forwarded to the backend.
    pub max_turns: u32,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Wall-clock budget for the whole invocation, tools included.
    pub timeout: Duration,
    /// Path where the agent must write its response JSON.
    pub response_path: PathBuf,
    /// Path for the captured process stdout/stderr.
    pub runtime_log_path: PathBuf,
    /// Truncate captured process output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over agent execution backends.
pub trait AgentRuntime {
    fn run(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Runtime that spawns a configured agent command per invocation.
///
/// Protocol: instructions arrive on stdin; the tool list, turn budget, and
/// response path are passed as arguments; the command must write an
/// [`AgentResponse`] JSON document to the response path before exiting.
pub struct CliRuntime {
    command: Vec<String>,
}

impl CliRuntime {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(anyhow!("agent command must not be empty"));
        }
        Ok(Self { command })
    }
}

impl AgentRuntime for CliRuntime {
    #[instrument(skip_all, fields(stage = %request.stage_name, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest) -> Result<AgentResponse> {
        info!(agent = %request.agent_name, "starting agent command");
        if let Some(parent) = request.response_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create response dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg("--agent")
            .arg(&request.agent_name)
            .arg("--max-turns")
            .arg(request.max_turns.to_string())
            .arg("--tools")
            .arg(request.available_tools.join(","))
            .arg(&request.response_path)
            .current_dir(&request.workdir);

        let output = run_with_timeout(
            cmd,
            Some(request.instructions.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run agent command")?;
        write_runtime_log(&request.runtime_log_path, &output.render_log())?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent command timed out");
            return Err(anyhow!(
                "agent command timed out after {:?} in stage {}",
                request.timeout,
                request.stage_name
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent command failed");
            return Err(anyhow!(
                "agent command failed with status {:?} in stage {}",
                output.status.code(),
                request.stage_name
            ));
        }

        let response = load_response(&request.response_path)?;
        debug!(
            turns = response.turns_used,
            tool_calls = response.tool_invocations.len(),
            "parsed agent response"
        );
        Ok(response)
    }
}

/// Read and validate a response document written by an agent command.
pub fn load_response(path: &Path) -> Result<AgentResponse> {
    if !path.exists() {
        return Err(anyhow!("missing agent response {}", path.display()));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read agent response {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_response_schema(&value)?;
    let response: AgentResponse = serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", path.display()))?;
    Ok(response)
}

fn validate_response_schema(response: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(RESPONSE_SCHEMA).context("parse bundled response schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(response) {
        let messages = compiled
            .iter_errors(response)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "agent response schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn write_runtime_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create runtime log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write runtime log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(temp: &Path, command_writes: &str) -> (CliRuntime, AgentRequest) {
        // The scripted shell reads stdin fully, then writes the response to
        // the path passed as the final argument.
        let script = format!(
            "cat > /dev/null; for arg; do last=$arg; done; printf '%s' '{command_writes}' > \"$last\""
        );
        let runtime = CliRuntime::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script,
            "agent".to_string(),
        ])
        .expect("runtime");
        let request = AgentRequest {
            stage_name: "schema_planning".to_string(),
            agent_name: "planner".to_string(),
            instructions: "analyze the schema".to_string(),
            available_tools: vec!["read_text".to_string()],
            max_turns: 5,
            workdir: temp.to_path_buf(),
            timeout: Duration::from_secs(5),
            response_path: temp.join("response.json"),
            runtime_log_path: temp.join("runtime.log"),
            output_limit_bytes: 100_000,
        };
        (runtime, request)
    }

    #[test]
    fn runs_command_and_parses_response() {
        let temp = tempfile::tempdir().expect("tempdir");
        let body = json!({
            "final_output": "plan ready",
            "tool_invocations": [{"name": "read_text", "duration_secs": 0.1}],
            "turns_used": 3
        })
        .to_string();
        let (runtime, request) = request(temp.path(), &body);

        let response = runtime.run(&request).expect("run");
        assert_eq!(response.final_output, "plan ready");
        assert_eq!(response.turns_used, 3);
        assert_eq!(response.tool_invocations.len(), 1);
        assert!(request.runtime_log_path.is_file());
    }

    #[test]
    fn rejects_response_violating_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (runtime, request) = request(temp.path(), r#"{"tool_invocations": []}"#);

        let err = runtime.run(&request).expect_err("should fail");
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn errors_when_response_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = CliRuntime::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null".to_string(),
        ])
        .expect("runtime");
        let (_, request) = request(temp.path(), "{}");

        let err = runtime.run(&request).expect_err("should fail");
        assert!(err.to_string().contains("missing agent response"));
    }

    #[test]
    fn turns_default_when_omitted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("response.json");
        fs::write(&path, r#"{"final_output": "ok"}"#).expect("write");

        let response = load_response(&path).expect("load");
        assert_eq!(response.turns_used, 1);
        assert!(response.tool_invocations.is_empty());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CliRuntime::new(Vec::new()).is_err());
    }
}
