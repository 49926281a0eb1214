//! Per-run result reporting.

use crate::outcome::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal result of one execution node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    /// Distinct reason code for non-success outcomes (timeout, gate unmet,
    /// step exit code, fail-fast cancellation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Cache key restored before the node ran, when a cache spec was present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_key: Option<String>,
}

/// Structured report for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub success: bool,
    pub nodes: Vec<NodeResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    /// The run succeeds iff every node terminated Succeeded or Skipped.
    /// A gate's outcome already folds its expression verdict in.
    pub fn from_results(
        run_id: Uuid,
        pipeline: impl Into<String>,
        nodes: Vec<NodeResult>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let success = nodes.iter().all(|n| !n.outcome.is_blocking());
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            run_id,
            pipeline: pipeline.into(),
            success,
            nodes,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    /// Process exit code for the invoker: 0 on success, 1 on any blocking
    /// outcome. Configuration errors exit 2 before a report exists.
    pub fn exit_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, outcome: Outcome) -> NodeResult {
        NodeResult {
            name: name.to_string(),
            outcome,
            duration_ms: 10,
            reason: None,
            restored_key: None,
        }
    }

    fn report(nodes: Vec<NodeResult>) -> RunReport {
        let now = Utc::now();
        RunReport::from_results(Uuid::now_v7(), "demo", nodes, now, now)
    }

    #[test]
    fn test_all_succeeded_is_success() {
        let r = report(vec![node("a", Outcome::Succeeded), node("b", Outcome::Succeeded)]);
        assert!(r.success);
        assert_eq!(r.exit_code(), 0);
    }

    #[test]
    fn test_skipped_does_not_block() {
        let r = report(vec![node("a", Outcome::Succeeded), node("b", Outcome::Skipped)]);
        assert!(r.success);
    }

    #[test]
    fn test_timeout_blocks() {
        let r = report(vec![node("a", Outcome::Succeeded), node("b", Outcome::TimedOut)]);
        assert!(!r.success);
        assert_eq!(r.exit_code(), 1);
    }

    #[test]
    fn test_cancelled_blocks() {
        let r = report(vec![node("a", Outcome::Cancelled)]);
        assert!(!r.success);
    }
}
