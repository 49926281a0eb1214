//! Execution node states and terminal outcomes.

use serde::{Deserialize, Serialize};

/// Terminal outcome of an execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    TimedOut,
}

impl Outcome {
    /// Timeouts aggregate as failures downstream; cancellation does not.
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Outcome::Failed | Outcome::TimedOut)
    }

    /// Outcomes that block overall run success. Skipped is non-blocking.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Outcome::Failed | Outcome::TimedOut | Outcome::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    fn severity(&self) -> u8 {
        match self {
            Outcome::Succeeded => 0,
            Outcome::Skipped => 1,
            Outcome::Cancelled => 2,
            Outcome::TimedOut => 3,
            Outcome::Failed => 4,
        }
    }

    /// Fold a set of sibling outcomes into one, worst first. Used when a
    /// dependency name refers to a matrix template with several instances.
    pub fn aggregate(outcomes: impl IntoIterator<Item = Outcome>) -> Outcome {
        outcomes
            .into_iter()
            .max_by_key(|o| o.severity())
            .unwrap_or(Outcome::Succeeded)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::Cancelled => "cancelled",
            Outcome::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Run state of an execution node.
///
/// Pending and Running are transient; a node reaches exactly one terminal
/// outcome and never revisits an earlier transient state. Readiness is not
/// a stored state: a pending node whose dependencies are all terminal is
/// promoted in the same scheduling pass that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Running,
    Done(Outcome),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Done(_))
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            NodeState::Done(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_counts_as_failure() {
        assert!(Outcome::TimedOut.counts_as_failure());
        assert!(Outcome::Failed.counts_as_failure());
        assert!(!Outcome::Cancelled.counts_as_failure());
        assert!(!Outcome::Skipped.counts_as_failure());
    }

    #[test]
    fn test_skipped_is_non_blocking() {
        assert!(!Outcome::Skipped.is_blocking());
        assert!(!Outcome::Succeeded.is_blocking());
        assert!(Outcome::Cancelled.is_blocking());
    }

    #[test]
    fn test_aggregate_takes_worst() {
        let agg = Outcome::aggregate([Outcome::Succeeded, Outcome::TimedOut, Outcome::Skipped]);
        assert_eq!(agg, Outcome::TimedOut);
        let agg = Outcome::aggregate([Outcome::TimedOut, Outcome::Failed]);
        assert_eq!(agg, Outcome::Failed);
        let agg = Outcome::aggregate([]);
        assert_eq!(agg, Outcome::Succeeded);
    }

    #[test]
    fn test_node_state_terminal() {
        assert!(!NodeState::Pending.is_terminal());
        assert!(!NodeState::Running.is_terminal());
        assert!(NodeState::Done(Outcome::Cancelled).is_terminal());
        assert_eq!(
            NodeState::Done(Outcome::Succeeded).outcome(),
            Some(Outcome::Succeeded)
        );
    }
}
