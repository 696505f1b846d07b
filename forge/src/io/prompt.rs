//! Stage instruction rendering.
//!
//! Each stage family is bound to a [`StageSpec`]: the agent identity, the
//! instruction template, and the tool set that agent may use. The sequencer
//! dispatches on [`StageKind`], so adding a stage means adding a variant and
//! a spec entry, not another string comparison.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::types::StageKind;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const SYNTHESIZER_TEMPLATE: &str = include_str!("prompts/synthesizer.md");
const EXECUTOR_TEMPLATE: &str = include_str!("prompts/executor.md");
const BUILDER_TEMPLATE: &str = include_str!("prompts/builder.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const TESTER_TEMPLATE: &str = include_str!("prompts/tester.md");

/// Static binding of a stage family to its agent identity and tool set.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub kind: StageKind,
    pub agent_name: &'static str,
    pub available_tools: &'static [&'static str],
}

const STAGE_SPECS: [StageSpec; 6] = [
    StageSpec {
        kind: StageKind::Plan,
        agent_name: "planner",
        available_tools: &[
            "describe_schema",
            "get_recommended_paths",
            "record_note",
            "get_notes",
        ],
    },
    StageSpec {
        kind: StageKind::Synthesize,
        agent_name: "data_synthesizer",
        available_tools: &[
            "get_recommended_paths",
            "ensure_dir",
            "write_text",
            "write_json",
            "read_text",
            "list_directory",
            "get_notes",
            "record_note",
        ],
    },
    StageSpec {
        kind: StageKind::Execute,
        agent_name: "execution_checker",
        available_tools: &[
            "run_script",
            "read_text",
            "get_recommended_paths",
            "list_directory",
            "record_note",
            "get_notes",
        ],
    },
    StageSpec {
        kind: StageKind::Build,
        agent_name: "service_builder",
        available_tools: &[
            "get_notes",
            "get_recommended_paths",
            "ensure_dir",
            "write_text",
            "write_json",
            "read_text",
            "list_directory",
        ],
    },
    StageSpec {
        kind: StageKind::Review,
        agent_name: "reviewer",
        available_tools: &[
            "read_text",
            "list_directory",
            "get_recommended_paths",
            "get_notes",
            "record_note",
        ],
    },
    StageSpec {
        kind: StageKind::Test,
        agent_name: "test_author",
        available_tools: &[
            "ensure_dir",
            "write_text",
            "read_text",
            "run_script",
            "get_recommended_paths",
            "get_notes",
        ],
    },
];

pub fn stage_spec(kind: StageKind) -> &'static StageSpec {
    STAGE_SPECS
        .iter()
        .find(|spec| spec.kind == kind)
        .expect("every stage kind has a spec entry")
}

/// Everything a template may reference.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub goal: String,
    pub schema_summary: String,
    /// Logical artifact name -> workspace-relative path.
    pub paths: BTreeMap<String, String>,
    /// Digest of the frozen data contract, once planning has produced it.
    pub contract: Option<String>,
    /// Reviewer feedback or gate diagnostics to address this cycle.
    pub feedback: Option<String>,
    pub notes: Vec<String>,
}

impl PromptInputs {
    fn paths_block(&self) -> String {
        self.paths
            .iter()
            .map(|(name, path)| format!("- {name}: {path}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn notes_block(&self) -> String {
        self.notes
            .iter()
            .map(|note| format!("- {note}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("plan", PLANNER_TEMPLATE),
            ("synthesize", SYNTHESIZER_TEMPLATE),
            ("execute", EXECUTOR_TEMPLATE),
            ("build", BUILDER_TEMPLATE),
            ("review", REVIEWER_TEMPLATE),
            ("test", TESTER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled template should be valid");
        }
        Self { env }
    }

    pub fn render(&self, kind: StageKind, inputs: &PromptInputs) -> Result<String> {
        let template = self
            .env
            .get_template(kind.as_str())
            .context("lookup stage template")?;
        let rendered = template
            .render(context! {
                goal => inputs.goal.trim(),
                schema_summary => non_empty(&inputs.schema_summary),
                paths => non_empty(&inputs.paths_block()),
                contract => inputs.contract.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                feedback => inputs.feedback.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                notes => non_empty(&inputs.notes_block()),
            })
            .with_context(|| format!("render {} template", kind.as_str()))?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
