//! End-to-end sequencer behavior against a scripted agent runtime.

use forge::errors::{ContractExhaustedError, ReviewExhaustedError, ToolCoverageError};
use forge::pipeline::{DEFAULT_GOAL, run_pipeline};
use forge::test_support::{MemorySink, PipelineHarness, ScriptedRuntime, ScriptedStep};
use forge::trace::event::{EventType, TraceEvent};
use forge::trace::tracker::Tracker;
use serde_json::json;

fn run(
    harness: &mut PipelineHarness,
    runtime: &ScriptedRuntime,
    tracker: &mut Tracker<MemorySink>,
) -> anyhow::Result<forge::pipeline::PipelineOutcome> {
    run_pipeline(
        &mut harness.context,
        runtime,
        tracker,
        &harness.config,
        &harness.paths,
        DEFAULT_GOAL,
    )
}

fn review_decisions(events: &[TraceEvent]) -> Vec<&TraceEvent> {
    events
        .iter()
        .filter(|event| {
            event.event_type == EventType::DecisionPoint
                && event
                    .step_name
                    .as_deref()
                    .is_some_and(|step| step.starts_with("code_review_cycle_"))
        })
        .collect()
}

/// Two rejections followed by an approval on the final allowed cycle must
/// reach testing, with one decision event per review cycle.
#[test]
fn review_approval_on_third_cycle_reaches_testing() {
    let mut harness = PipelineHarness::new();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("artifact executed and verified"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("REVISIONS_NEEDED: metadata description is empty"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("REVISIONS_NEEDED: service ignores the data artifact"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("APPROVED: all findings addressed"),
        ScriptedStep::respond_text("tests written and passing"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    let outcome = run(&mut harness, &runtime, &mut tracker).expect("pipeline");

    assert_eq!(outcome.review_cycles, 3);
    assert!(runtime.is_exhausted());

    let invocations = runtime.invocations();
    assert!(invocations.contains(&"server_build_revision_1".to_string()));
    assert!(invocations.contains(&"server_build_revision_2".to_string()));
    assert!(invocations.contains(&"integration_testing".to_string()));

    let decisions = review_decisions(tracker.events());
    assert_eq!(decisions.len(), 3);
    assert_eq!(decisions[2].decision.as_deref(), Some("APPROVED"));
}

/// Reviewer reasoning must reach the rebuild stage's instructions.
#[test]
fn rebuild_receives_review_feedback() {
    let mut harness = PipelineHarness::new();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("REVISIONS_NEEDED: rename the lookup tool description"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("APPROVED: fixed"),
        ScriptedStep::respond_text("tests pass"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    run(&mut harness, &runtime, &mut tracker).expect("pipeline");

    let requests = runtime.requests();
    let rebuild = requests
        .iter()
        .find(|request| request.stage_name == "server_build_revision_1")
        .expect("rebuild request");
    assert!(rebuild.instructions.contains("rename the lookup tool description"));
}

/// Exhausting the review bound raises `ReviewExhausted`; the run never
/// invokes a further review and records no testing events.
#[test]
fn review_exhaustion_is_fatal_and_skips_testing() {
    let mut harness = PipelineHarness::new();
    harness.config.max_review_cycles = 2;
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("REVISIONS_NEEDED: still wrong"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("REVISIONS_NEEDED: wrong again"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    let err = run(&mut harness, &runtime, &mut tracker).expect_err("should exhaust");

    let review = err
        .downcast_ref::<ReviewExhaustedError>()
        .expect("review exhausted");
    assert_eq!(review.cycles, 2);
    assert!(review.last_reasoning.contains("wrong again"));

    let invocations = runtime.invocations();
    assert!(!invocations.iter().any(|name| name == "code_review_cycle_3"));
    assert!(!invocations.iter().any(|name| name == "integration_testing"));
    assert!(
        !tracker
            .events()
            .iter()
            .any(|event| event.step_name.as_deref() == Some("integration_testing"))
    );
    assert_eq!(review_decisions(tracker.events()).len(), 2);
}

/// A tool timeout during generation cycle 1 records an error event and the
/// loop retries; a clean cycle 2 lets the run proceed normally.
#[test]
fn generation_timeout_retries_within_bound() {
    let mut harness = PipelineHarness::new();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::fail("agent command timed out after 180s"),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("APPROVED: good"),
        ScriptedStep::respond_text("tests pass"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    let outcome = run(&mut harness, &runtime, &mut tracker).expect("pipeline");

    assert_eq!(outcome.generation_cycles, 2);
    assert!(runtime.is_exhausted());
    assert!(tracker.events().iter().any(|event| {
        event.event_type == EventType::Error
            && event
                .message
                .as_deref()
                .is_some_and(|message| message.contains("timed out"))
    }));
}

/// Artifacts that never satisfy the contract exhaust the generation bound
/// with one failed validation event per cycle.
#[test]
fn contract_exhaustion_after_generation_bound() {
    let mut harness = PipelineHarness::new();
    let bad_artifact = json!({"wrong_key": []}).to_string();
    let mut steps = vec![ScriptedStep::plan_with_contract()];
    for _ in 0..3 {
        steps.push(
            ScriptedStep::respond_text("artifact written")
                .with_write(&harness.data_json_rel(), &bad_artifact),
        );
        steps.push(ScriptedStep::respond_text("checked"));
        steps.push(ScriptedStep::build_with_metadata(&harness));
    }
    let runtime = ScriptedRuntime::new(steps);
    let mut tracker = Tracker::new(MemorySink::default());

    let err = run(&mut harness, &runtime, &mut tracker).expect_err("should exhaust");

    let contract = err
        .downcast_ref::<ContractExhaustedError>()
        .expect("contract exhausted");
    assert_eq!(contract.cycles, 3);
    assert!(contract.last_failure.contains("users"));

    let failed_validations: Vec<_> = tracker
        .events()
        .iter()
        .filter(|event| {
            event.event_type == EventType::Validation
                && event.metadata.get("validation_type") == Some(&json!("data_contract"))
                && event.metadata.get("success") == Some(&json!(false))
        })
        .collect();
    assert_eq!(failed_validations.len(), 3);

    // The gate diagnostics feed the next cycle's synthesis instructions.
    let requests = runtime.requests();
    let second_synthesis = requests
        .iter()
        .find(|request| request.stage_name == "data_synthesis_cycle_2")
        .expect("second synthesis");
    assert!(second_synthesis.instructions.contains("missing keys"));
}

/// Missing expected tools under strict coverage abort the run.
#[test]
fn strict_coverage_missing_tool_is_fatal() {
    let mut harness = PipelineHarness::with_tools(&["a", "b"]);
    harness.config.strict_tool_coverage = true;
    let partial_metadata = json!({"name": "demo", "tools": [{"name": "a"}]}).to_string();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked"),
        ScriptedStep::respond_text("built")
            .with_write(&harness.metadata_json_rel(), &partial_metadata),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    let err = run(&mut harness, &runtime, &mut tracker).expect_err("should abort");

    let coverage = err
        .downcast_ref::<ToolCoverageError>()
        .expect("coverage error");
    assert_eq!(coverage.missing, vec!["b".to_string()]);
    assert!(tracker.events().iter().any(|event| {
        event.event_type == EventType::Validation
            && event.metadata.get("validation_type") == Some(&json!("tool_coverage"))
            && event.metadata.get("success") == Some(&json!(false))
    }));
}

/// Without strict coverage the same gap is a warning and the run finishes.
#[test]
fn lenient_coverage_records_warning_and_continues() {
    let mut harness = PipelineHarness::with_tools(&["a", "b"]);
    let partial_metadata = json!({"name": "demo", "tools": [{"name": "a"}]}).to_string();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked"),
        ScriptedStep::respond_text("built")
            .with_write(&harness.metadata_json_rel(), &partial_metadata),
        ScriptedStep::respond_text("APPROVED: acceptable"),
        ScriptedStep::respond_text("tests pass"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    run(&mut harness, &runtime, &mut tracker).expect("pipeline");

    assert!(tracker.events().iter().any(|event| {
        event.event_type == EventType::Note
            && event
                .message
                .as_deref()
                .is_some_and(|message| message.contains("missing expected tools"))
    }));
}

/// Unparseable reviewer output is treated as revisions needed, never as
/// approval.
#[test]
fn unparseable_review_decision_fails_closed() {
    let mut harness = PipelineHarness::new();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("seems plausible, probably fine"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("APPROVED: explicit this time"),
        ScriptedStep::respond_text("tests pass"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    let outcome = run(&mut harness, &runtime, &mut tracker).expect("pipeline");

    assert_eq!(outcome.review_cycles, 2);
    let decisions = review_decisions(tracker.events());
    assert_eq!(decisions[0].decision.as_deref(), Some("REVISIONS_NEEDED"));
    assert_eq!(decisions[0].reasoning.as_deref(), Some("unparseable decision"));
}

/// Every tool_call event is accounted for in the derived per-agent counts.
#[test]
fn tool_call_events_match_summary_counts() {
    let mut harness = PipelineHarness::new();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked").with_tool("run_script"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("APPROVED: good").with_tool("read_text"),
        ScriptedStep::respond_text("tests pass").with_tool("run_script"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    run(&mut harness, &runtime, &mut tracker).expect("pipeline");

    let summary = tracker.get_summary();
    let tool_call_events = tracker
        .events()
        .iter()
        .filter(|event| event.event_type == EventType::ToolCall)
        .count();
    let per_agent_total: usize = summary.tool_calls_by_agent.values().sum();
    assert!(tool_call_events > 0);
    assert_eq!(per_agent_total, tool_call_events);

    let first = serde_json::to_string(&summary).expect("serialize");
    let second = serde_json::to_string(&tracker.get_summary()).expect("serialize");
    assert_eq!(first, second);
}

/// A failed testing stage is recorded, not fatal, under the default policy.
#[test]
fn test_failure_is_recorded_not_fatal_by_default() {
    let mut harness = PipelineHarness::new();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::plan_with_contract(),
        ScriptedStep::synthesize_with_artifact(&harness),
        ScriptedStep::respond_text("checked"),
        ScriptedStep::build_with_metadata(&harness),
        ScriptedStep::respond_text("APPROVED: good"),
        ScriptedStep::fail("pytest exited with status 1"),
    ]);
    let mut tracker = Tracker::new(MemorySink::default());

    run(&mut harness, &runtime, &mut tracker).expect("pipeline");

    assert!(tracker.events().iter().any(|event| {
        event.event_type == EventType::Error
            && event.step_name.as_deref() == Some("integration_testing")
    }));
}
