//! The stage sequencer.
//!
//! Drives the fixed stage order with two bounded sub-loops and guarantees
//! the run terminates in a finite number of stage invocations. Every phase
//! transition, agent invocation, and gate result is recorded through the
//! tracker before the sequencer proceeds; the run never transitions
//! silently.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::context::WorkflowContext;
use crate::core::decision::parse_review_decision;
use crate::core::gate::{parse_contract, validate_contract, validate_tool_coverage};
use crate::core::types::{CycleOutcome, ReviewVerdict, StageKind};
use crate::errors::{
    ContractExhaustedError, PlanningError, ReviewExhaustedError, TestingFailedError,
    ToolCoverageError,
};
use crate::io::config::{PipelineConfig, TestFailurePolicy};
use crate::io::paths::OutputPaths;
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::runtime::AgentRuntime;
use crate::stage::{StageAttempt, StageRun, run_stage};
use crate::trace::sink::TraceSink;
use crate::trace::tracker::Tracker;

/// Default goal shared across all stage prompts.
pub const DEFAULT_GOAL: &str = "Construct the offline service implementation, data generator, \
     data artifact, metadata, and tests from the provided schema.";

/// Run-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Planning,
    GenerationLoop,
    ExecutionCheck,
    Build,
    ReviewLoop,
    Testing,
    Done,
    Aborted,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Planning => "planning",
            RunPhase::GenerationLoop => "generation_loop",
            RunPhase::ExecutionCheck => "execution_check",
            RunPhase::Build => "build",
            RunPhase::ReviewLoop => "review_loop",
            RunPhase::Testing => "testing",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub slug: String,
    /// Generation cycles consumed before the gate passed.
    pub generation_cycles: u32,
    /// Review cycles consumed before approval.
    pub review_cycles: u32,
    pub stage_count: usize,
}

/// Execute the full pipeline against the given context and runtime.
pub fn run_pipeline<R: AgentRuntime, S: TraceSink>(
    context: &mut WorkflowContext,
    runtime: &R,
    tracker: &mut Tracker<S>,
    config: &PipelineConfig,
    paths: &OutputPaths,
    goal: &str,
) -> Result<PipelineOutcome> {
    Pipeline {
        context,
        runtime,
        tracker,
        config,
        paths,
        engine: PromptEngine::new(),
        goal: goal.to_string(),
        phase: RunPhase::Planning,
    }
    .run()
}

struct Pipeline<'a, R: AgentRuntime, S: TraceSink> {
    context: &'a mut WorkflowContext,
    runtime: &'a R,
    tracker: &'a mut Tracker<S>,
    config: &'a PipelineConfig,
    paths: &'a OutputPaths,
    engine: PromptEngine,
    goal: String,
    phase: RunPhase,
}

impl<R: AgentRuntime, S: TraceSink> Pipeline<'_, R, S> {
    fn run(mut self) -> Result<PipelineOutcome> {
        match self.execute() {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Record the abort, but never mask the terminal error with a
                // secondary tracker failure.
                if let Err(trace_err) = self.transition(RunPhase::Aborted) {
                    warn!("failed to record abort transition: {trace_err:#}");
                }
                Err(err)
            }
        }
    }

    fn execute(&mut self) -> Result<PipelineOutcome> {
        self.transition(RunPhase::Planning)?;
        self.plan()?;

        let generation_cycles = self.generation_loop()?;
        let review_cycles = self.review_loop()?;

        self.transition(RunPhase::Testing)?;
        self.testing()?;

        self.transition(RunPhase::Done)?;
        Ok(PipelineOutcome {
            slug: self.context.slug.clone(),
            generation_cycles,
            review_cycles,
            stage_count: self.context.stage_results().len(),
        })
    }

    /// Record a phase transition before acting on it.
    fn transition(&mut self, next: RunPhase) -> Result<()> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("from".to_string(), json!(self.phase.as_str()));
        metadata.insert("to".to_string(), json!(next.as_str()));
        self.tracker.record_note(
            &format!("phase transition: {} -> {}", self.phase.as_str(), next.as_str()),
            Some(metadata),
        )?;
        self.phase = next;
        Ok(())
    }

    fn prompt_inputs(&self, feedback: Option<String>) -> PromptInputs {
        PromptInputs {
            goal: self.goal.clone(),
            schema_summary: self.context.schema_summary.clone(),
            paths: self.context.relative_output_paths(),
            contract: self.context.contract().map(|contract| contract.describe()),
            feedback,
            notes: self.context.notes.clone(),
        }
    }

    fn invoke(
        &mut self,
        kind: StageKind,
        step_name: String,
        cycle: Option<u32>,
        inputs: &PromptInputs,
    ) -> Result<StageAttempt> {
        let instructions = self.engine.render(kind, inputs)?;
        let run = StageRun {
            kind,
            step_name,
            cycle,
            instructions,
        };
        run_stage(
            self.runtime,
            self.tracker,
            self.paths,
            self.config,
            &self.context.workspace_root,
            &run,
        )
    }

    /// Planning is invoked once; failure is unrecoverable because later
    /// stages have no contract to validate against.
    fn plan(&mut self) -> Result<()> {
        let step_name = "schema_planning".to_string();
        let inputs = self.prompt_inputs(None);
        let attempt = self.invoke(StageKind::Plan, step_name.clone(), None, &inputs)?;

        let result = match attempt {
            StageAttempt::Completed(result) => result,
            StageAttempt::Failed(reason) => {
                return Err(PlanningError {
                    stage: step_name,
                    reason,
                }
                .into());
            }
        };

        let Some(contract) = parse_contract(&result.output) else {
            let reason = "planner output contains no usable data contract".to_string();
            self.tracker.record_error(Some(&step_name), &reason)?;
            return Err(PlanningError {
                stage: step_name,
                reason,
            }
            .into());
        };

        let narrowed = (!contract.expected_tools.is_empty())
            .then(|| contract.expected_tools.clone());
        self.context.set_contract(contract.clone())?;
        self.context.freeze_expected_tools(narrowed)?;
        self.context.record_stage_result(result);

        let mut metadata = serde_json::Map::new();
        metadata.insert("contract".to_string(), serde_json::to_value(&contract)?);
        self.tracker
            .record_note("data contract captured", Some(metadata))?;
        info!(contract = %contract.describe(), "planning complete");
        Ok(())
    }

    /// Bounded synthesize/execute/build loop; first gate pass exits early.
    fn generation_loop(&mut self) -> Result<u32> {
        let mut feedback: Option<String> = None;
        let mut last_failure = String::new();

        for cycle in 1..=self.config.max_generation_cycles {
            self.transition(RunPhase::GenerationLoop)?;
            match self.generation_cycle(cycle, feedback.take())? {
                CycleOutcome::Pass => return Ok(cycle),
                CycleOutcome::Retry(reason) => {
                    info!(cycle, "generation cycle failed: {reason}");
                    last_failure = reason.clone();
                    feedback = Some(reason);
                }
            }
        }

        let err = ContractExhaustedError {
            stage: format!(
                "data_synthesis_cycle_{}",
                self.config.max_generation_cycles
            ),
            cycles: self.config.max_generation_cycles,
            last_failure,
        };
        self.tracker.record_error(None, &err.to_string())?;
        Err(err.into())
    }

    fn generation_cycle(&mut self, cycle: u32, feedback: Option<String>) -> Result<CycleOutcome> {
        let inputs = self.prompt_inputs(feedback);

        let synth_step = format!("data_synthesis_cycle_{cycle}");
        match self.invoke(StageKind::Synthesize, synth_step.clone(), Some(cycle), &inputs)? {
            StageAttempt::Completed(result) => self.context.record_stage_result(result),
            StageAttempt::Failed(reason) => return Ok(CycleOutcome::Retry(reason)),
        }

        self.transition(RunPhase::ExecutionCheck)?;
        let exec_step = format!("execution_check_cycle_{cycle}");
        match self.invoke(StageKind::Execute, exec_step, Some(cycle), &inputs)? {
            StageAttempt::Completed(result) => self.context.record_stage_result(result),
            StageAttempt::Failed(reason) => return Ok(CycleOutcome::Retry(reason)),
        }

        self.transition(RunPhase::Build)?;
        let build_step = format!("server_build_cycle_{cycle}");
        match self.invoke(StageKind::Build, build_step.clone(), Some(cycle), &inputs)? {
            StageAttempt::Completed(result) => self.context.record_stage_result(result),
            StageAttempt::Failed(reason) => return Ok(CycleOutcome::Retry(reason)),
        }

        self.apply_gates(cycle, &synth_step, &build_step)
    }

    /// Contract gate on the synthesized artifact, coverage gate on the built
    /// metadata. Exactly one validation event per gate call, pass or fail.
    fn apply_gates(
        &mut self,
        cycle: u32,
        synth_step: &str,
        build_step: &str,
    ) -> Result<CycleOutcome> {
        let contract = self
            .context
            .contract()
            .cloned()
            .ok_or_else(|| anyhow!("generation loop entered without a frozen contract"))?;
        let artifact = load_json_lenient(self.context.output_path("data_json")?);
        let check = validate_contract(&artifact, &contract);
        self.tracker.record_validation(
            synth_step,
            "data_contract",
            check.success,
            &check.describe(),
            serde_json::to_value(&check)?,
        )?;
        if !check.success {
            if self.config.require_contract_validation {
                return Ok(CycleOutcome::Retry(check.describe()));
            }
            self.tracker.record_note(
                &format!(
                    "contract validation failed on cycle {cycle} but is configured non-fatal: {}",
                    check.describe()
                ),
                None,
            )?;
        }

        let observed = observed_tool_names(self.context.output_path("metadata_json")?);
        let coverage = validate_tool_coverage(&observed, self.context.expected_tool_names());
        self.tracker.record_validation(
            build_step,
            "tool_coverage",
            coverage.success,
            &coverage.describe(),
            serde_json::to_value(&coverage)?,
        )?;
        if !coverage.success {
            if self.config.strict_tool_coverage {
                let err = ToolCoverageError {
                    stage: build_step.to_string(),
                    missing: coverage.missing.clone(),
                };
                self.tracker.record_error(Some(build_step), &err.to_string())?;
                return Err(err.into());
            }
            self.tracker.record_note(
                &format!("missing expected tools (non-strict): {}", coverage.missing.join(", ")),
                None,
            )?;
        }
        if !coverage.extra.is_empty() {
            self.tracker.record_note(
                &format!("implementation exposes extra tools: {}", coverage.extra.join(", ")),
                None,
            )?;
        }

        Ok(CycleOutcome::Pass)
    }

    /// Bounded review/revise loop. Approval exits; a rejection triggers
    /// exactly one rebuild with the reviewer's reasoning appended, while
    /// another review cycle remains to judge it.
    fn review_loop(&mut self) -> Result<u32> {
        let mut last_reasoning = String::new();

        for cycle in 1..=self.config.max_review_cycles {
            self.transition(RunPhase::ReviewLoop)?;
            let step_name = format!("code_review_cycle_{cycle}");
            let inputs = self.prompt_inputs(None);
            let attempt =
                self.invoke(StageKind::Review, step_name.clone(), Some(cycle), &inputs)?;

            let result = match attempt {
                StageAttempt::Completed(result) => result,
                StageAttempt::Failed(reason) => {
                    // The failed invocation consumed this cycle; the error
                    // event is already on the trace.
                    last_reasoning = reason;
                    continue;
                }
            };

            let decision = parse_review_decision(&result.output, cycle);
            self.tracker.record_decision(
                &step_name,
                decision.verdict.as_str(),
                &decision.reasoning,
                Some(cycle),
            )?;
            self.context.record_stage_result(result);

            match decision.verdict {
                ReviewVerdict::Approved => {
                    info!(cycle, "review approved");
                    return Ok(cycle);
                }
                ReviewVerdict::RevisionsNeeded => {
                    info!(cycle, "review requested revisions");
                    last_reasoning = decision.reasoning.clone();
                    if cycle < self.config.max_review_cycles {
                        self.rebuild_after_review(cycle, decision.reasoning)?;
                    }
                }
            }
        }

        let err = ReviewExhaustedError {
            stage: format!("code_review_cycle_{}", self.config.max_review_cycles),
            cycles: self.config.max_review_cycles,
            last_reasoning,
        };
        self.tracker.record_error(None, &err.to_string())?;
        Err(err.into())
    }

    fn rebuild_after_review(&mut self, cycle: u32, reasoning: String) -> Result<()> {
        self.transition(RunPhase::Build)?;
        let step_name = format!("server_build_revision_{cycle}");
        let inputs = self.prompt_inputs(Some(reasoning));
        match self.invoke(StageKind::Build, step_name, Some(cycle), &inputs)? {
            StageAttempt::Completed(result) => self.context.record_stage_result(result),
            // A failed rebuild is judged by the next review cycle; the error
            // event is already on the trace.
            StageAttempt::Failed(_) => {}
        }
        Ok(())
    }

    /// A test failure is recorded but does not re-enter the review loop;
    /// escalation is the `on_test_failure` policy hook.
    fn testing(&mut self) -> Result<()> {
        let step_name = "integration_testing".to_string();
        let inputs = self.prompt_inputs(None);
        match self.invoke(StageKind::Test, step_name.clone(), None, &inputs)? {
            StageAttempt::Completed(result) => {
                self.context.record_stage_result(result);
                Ok(())
            }
            StageAttempt::Failed(reason) => match self.config.on_test_failure {
                TestFailurePolicy::Record => {
                    self.tracker.record_note(
                        &format!("testing failed; continuing per policy: {reason}"),
                        None,
                    )?;
                    Ok(())
                }
                TestFailurePolicy::Fail => Err(TestingFailedError {
                    stage: step_name,
                    reason,
                }
                .into()),
            },
        }
    }
}

/// Read a JSON artifact, mapping any read/parse failure to `null` so the
/// contract gate fails closed on missing or malformed files.
fn load_json_lenient(path: &Path) -> Value {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| serde_json::from_str(&contents).ok())
        .unwrap_or(Value::Null)
}

/// Tool names the built metadata document exposes.
fn observed_tool_names(metadata_path: &Path) -> BTreeSet<String> {
    load_json_lenient(metadata_path)
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| tool.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Render the run summary printed after a successful pipeline.
pub fn render_run_summary(context: &WorkflowContext, outcome: &PipelineOutcome) -> String {
    let mut lines = vec![format!("Workflow slug: {}", outcome.slug), "Outputs:".to_string()];
    for (name, path) in context.output_paths() {
        lines.push(format!("- {name}: {}", context.relative(path)));
    }
    lines.push(String::new());
    lines.push("Step outcomes:".to_string());
    for step in context.stage_results() {
        lines.push(format!("[{}] {}", step.name, step.output));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemorySink, PipelineHarness, ScriptedRuntime, ScriptedStep};
    use crate::trace::event::EventType;

    #[test]
    fn happy_path_reaches_done_in_one_cycle_each() {
        let mut harness = PipelineHarness::new();
        let runtime = ScriptedRuntime::new(vec![
            ScriptedStep::plan_with_contract(),
            ScriptedStep::synthesize_with_artifact(&harness),
            ScriptedStep::respond_text("artifact executed and verified"),
            ScriptedStep::build_with_metadata(&harness),
            ScriptedStep::respond_text("APPROVED: faithful to the contract"),
            ScriptedStep::respond_text("tests written and passing"),
        ]);
        let mut tracker = Tracker::new(MemorySink::default());

        let outcome = run_pipeline(
            &mut harness.context,
            &runtime,
            &mut tracker,
            &harness.config,
            &harness.paths,
            DEFAULT_GOAL,
        )
        .expect("pipeline");

        assert_eq!(outcome.generation_cycles, 1);
        assert_eq!(outcome.review_cycles, 1);
        assert_eq!(outcome.stage_count, 6);
        assert!(runtime.is_exhausted());
        let validations = tracker
            .events()
            .iter()
            .filter(|e| e.event_type == EventType::Validation)
            .count();
        assert_eq!(validations, 2);
    }

    #[test]
    fn planning_without_contract_is_fatal_and_stops_the_run() {
        let mut harness = PipelineHarness::new();
        let runtime = ScriptedRuntime::new(vec![ScriptedStep::respond_text(
            "a plan with no contract object",
        )]);
        let mut tracker = Tracker::new(MemorySink::default());

        let err = run_pipeline(
            &mut harness.context,
            &runtime,
            &mut tracker,
            &harness.config,
            &harness.paths,
            DEFAULT_GOAL,
        )
        .expect_err("pipeline should fail");

        let planning = err.downcast_ref::<PlanningError>().expect("planning error");
        assert!(planning.reason.contains("no usable data contract"));
        // Planning failure consumed exactly one scripted invocation.
        assert!(runtime.is_exhausted());
        assert!(
            tracker
                .events()
                .iter()
                .any(|e| e.event_type == EventType::Error)
        );
    }
}
