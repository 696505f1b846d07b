//! Run observability: the event model, durable sinks, and the tracker.
//!
//! This is product output, distinct from the development diagnostics in
//! [`crate::logging`]: every run appends its events to a JSONL trace file in
//! real time, and the exported summary is derived from that log alone.

pub mod event;
pub mod sink;
pub mod tracker;
