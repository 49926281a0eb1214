//! Gantry scheduler.
//!
//! Builds the execution graph from a pipeline definition (dependency
//! resolution, matrix expansion, trigger filtering) and drives every node to
//! a terminal outcome.

pub mod dag;
pub mod matrix;
pub mod scheduler;
pub mod triggers;

pub use dag::{DagError, ExecutionGraph, NodeMeta};
pub use matrix::JobInstance;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use triggers::TriggerContext;
