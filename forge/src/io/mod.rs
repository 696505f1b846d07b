//! Side-effecting collaborators: configuration, paths, processes, the agent
//! runtime, and prompt rendering. Isolated from `core` so orchestration
//! logic can be tested against fakes.

pub mod config;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod runtime;
