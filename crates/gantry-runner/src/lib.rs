//! Gantry step execution.
//!
//! Concrete [`gantry_core::ports::StepExecutor`] implementations: a shell
//! executor for real runs and a scripted executor for deterministic tests.

pub mod scripted;
pub mod shell;

pub use scripted::{ScriptedExecutor, StepBehavior};
pub use shell::ShellExecutor;
