//! Pipeline configuration stored in `forge.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Pipeline configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values; a missing file is
/// the all-defaults configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bound on the synthesize/execute/build loop.
    pub max_generation_cycles: u32,

    /// Bound on the review/revise loop.
    pub max_review_cycles: u32,

    /// Turn budget forwarded to the agent runtime, not enforced here.
    pub max_turns_per_agent: u32,

    /// Wall-clock budget in seconds for one agent invocation, including the
    /// tool executions it performs.
    pub tool_timeout_secs: u64,

    /// Whether a missing required key/field is fatal (after the generation
    /// bound) or only a warning.
    pub require_contract_validation: bool,

    /// Whether a missing expected tool aborts the run.
    pub strict_tool_coverage: bool,

    /// Policy for a failed testing stage.
    pub on_test_failure: TestFailurePolicy,

    /// Truncate captured runtime stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub agent: AgentConfig,
}

/// What to do when the testing stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestFailurePolicy {
    /// Record the failure and finish the run with a warning.
    Record,
    /// Treat the failure as terminal.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command to spawn for each agent invocation (e.g. `["codex","exec"]`).
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string()],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_generation_cycles: 3,
            max_review_cycles: 3,
            max_turns_per_agent: 20,
            tool_timeout_secs: 180,
            require_contract_validation: true,
            strict_tool_coverage: false,
            on_test_failure: TestFailurePolicy::Record,
            output_limit_bytes: 100_000,
            agent: AgentConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_generation_cycles == 0 {
            return Err(anyhow!("max_generation_cycles must be > 0"));
        }
        if self.max_review_cycles == 0 {
            return Err(anyhow!("max_review_cycles must be > 0"));
        }
        if self.max_turns_per_agent == 0 {
            return Err(anyhow!("max_turns_per_agent must be > 0"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Apply environment overrides for the bounds operators tune most often.
    pub fn apply_env_overrides(&mut self) {
        if let Some(cycles) = env_parse::<u32>("FORGE_MAX_GENERATION_CYCLES") {
            self.max_generation_cycles = cycles;
        }
        if let Some(cycles) = env_parse::<u32>("FORGE_MAX_REVIEW_CYCLES") {
            self.max_review_cycles = cycles;
        }
        if let Some(turns) = env_parse::<u32>("FORGE_MAX_TURNS") {
            self.max_turns_per_agent = turns;
        }
        if let Some(timeout) = env_parse::<u64>("FORGE_TOOL_TIMEOUT_SECS") {
            self.tool_timeout_secs = timeout;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
