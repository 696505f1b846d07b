//! Pure, deterministic pipeline logic.
//!
//! Nothing in this module performs I/O. Gate checks, decision parsing, and
//! summary derivation are plain functions over plain data so they can be
//! tested in isolation and replayed against persisted traces.

pub mod decision;
pub mod gate;
pub mod summary;
pub mod types;
