//! Port traits between the engine and its external collaborators.
//!
//! The engine treats a job's steps as opaque: each step is handed to a
//! [`StepExecutor`] and comes back with an exit status. What the step does is
//! not the engine's business.

use crate::Result;
use crate::definition::StepDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Context passed to an executor for a single step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Instance identifier of the owning node.
    pub node: String,
    /// Step definition with command and env already interpolated.
    pub step: StepDefinition,
    pub workspace: PathBuf,
    /// Fully merged environment for the step.
    pub env: HashMap<String, String>,
}

/// Exit status of one executed step.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
}

/// A line of step output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub node: String,
    pub step: String,
    pub stream: OutputStream,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Executes one opaque step and reports its exit status.
///
/// Implementations must be cancel-safe: when the returned future is dropped,
/// any spawned work must be torn down.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<StepExecution>;
}
