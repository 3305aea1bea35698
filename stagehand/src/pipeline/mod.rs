//! Table-driven pipeline execution.
//!
//! A flow is expressed as an [`ExecutionPlan`]: an ordered list of tasks that
//! share one context. [`PipelineExecutor`] runs them one after another, stops
//! at the first failure, and checks the cancellation token before each task.
//!
//! ```text
//! ExecutionPlan → Task 1 → Task 2 → ... → PipelineMetrics
//!                    │ (error / cancelled)
//!                    └──► return immediately
//! ```
//!
//! Stages never overlap, so there is no parallel mode. Teardown is not a
//! task: callers run their cleanup stack after `execute` returns, whatever
//! the outcome.

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod task;

pub use metrics::{PipelineMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, PipelineExecutor};
pub use task::{BoxedTask, PipelineTask};
