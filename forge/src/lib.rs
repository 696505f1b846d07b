//! Bounded, fault-tolerant sequencer for multi-agent service generation.
//!
//! This crate drives an ordered list of LLM-backed stages that turn a
//! declarative service schema into an offline implementation, with contract
//! validation gates, a bounded review-and-revise loop, and a durable trace
//! of every decision and tool invocation. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (gate checks, decision parsing,
//!   summary derivation). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (configuration, paths, child
//!   processes, the agent runtime, prompt rendering). Isolated to enable
//!   scripted fakes in tests.
//! - **[`trace`]**: The observability subsystem the sequencer feeds: an
//!   append-only event log persisted in real time, with summaries derived
//!   purely from the log.
//!
//! Orchestration modules ([`context`], [`stage`], [`pipeline`]) coordinate
//! core logic with I/O to implement the CLI commands.

pub mod context;
pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod trace;
