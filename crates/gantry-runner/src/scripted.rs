//! Scripted step execution for tests.
//!
//! Behaviors are keyed by node identifier so scheduler tests can assert
//! which nodes actually ran and in what order, without spawning processes.

use async_trait::async_trait;
use gantry_core::Result;
use gantry_core::ports::{OutputLine, StepContext, StepExecution, StepExecutor};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a scripted step does when invoked.
#[derive(Debug, Clone)]
pub struct StepBehavior {
    pub delay: Duration,
    pub exit_code: i32,
    /// Never completes on its own; only a timeout or cancellation ends it.
    pub hang: bool,
}

impl StepBehavior {
    pub fn succeed() -> Self {
        Self {
            delay: Duration::ZERO,
            exit_code: 0,
            hang: false,
        }
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            delay: Duration::ZERO,
            exit_code,
            hang: false,
        }
    }

    pub fn hang() -> Self {
        Self {
            delay: Duration::ZERO,
            exit_code: 0,
            hang: true,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Deterministic in-process executor.
#[derive(Default)]
pub struct ScriptedExecutor {
    behaviors: Mutex<HashMap<String, StepBehavior>>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior for every step of the named node.
    pub fn script(&self, node: &str, behavior: StepBehavior) {
        let mut behaviors = self.behaviors.lock().unwrap_or_else(|e| e.into_inner());
        behaviors.insert(node.to_string(), behavior);
    }

    /// Node identifiers whose steps were actually invoked, in start order.
    pub fn invoked(&self) -> Vec<String> {
        let invocations = self.invocations.lock().unwrap_or_else(|e| e.into_inner());
        invocations.clone()
    }

    pub fn was_invoked(&self, node: &str) -> bool {
        self.invoked().iter().any(|n| n == node)
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        _output: mpsc::Sender<OutputLine>,
    ) -> Result<StepExecution> {
        let behavior = {
            let behaviors = self.behaviors.lock().unwrap_or_else(|e| e.into_inner());
            behaviors
                .get(&ctx.node)
                .cloned()
                .unwrap_or_else(StepBehavior::succeed)
        };
        {
            let mut invocations = self.invocations.lock().unwrap_or_else(|e| e.into_inner());
            invocations.push(ctx.node.clone());
        }

        if behavior.hang {
            // Far enough out that a node timeout always fires first.
            tokio::time::sleep(Duration::from_secs(365 * 24 * 3600)).await;
        } else if behavior.delay > Duration::ZERO {
            tokio::time::sleep(behavior.delay).await;
        }

        Ok(StepExecution {
            exit_code: behavior.exit_code,
            success: behavior.exit_code == 0,
            duration_ms: behavior.delay.as_millis() as u64,
        })
    }
}
