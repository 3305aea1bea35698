//! Sequential pipeline executor.

use super::metrics::{PipelineMetrics, TaskMetrics};
use super::task::BoxedTask;
use stagehand_shared::{StagehandError, StagehandResult};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct ExecutionPlan<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self { tasks }
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every task of `plan` in order.
    ///
    /// Returns the first task error as-is. A token cancelled between tasks
    /// yields `StagehandError::Cancelled` without starting the next task;
    /// cancellation during a task is observed by the task itself.
    pub async fn execute<Ctx>(
        plan: ExecutionPlan<Ctx>,
        ctx: Ctx,
        cancel: &CancellationToken,
    ) -> StagehandResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut task_metrics = Vec::with_capacity(plan.len());

        for task in plan.tasks {
            if cancel.is_cancelled() {
                tracing::debug!(next = task.name(), "Pipeline cancelled");
                return Err(StagehandError::Cancelled);
            }

            let name = task.name().to_string();
            let task_start = Instant::now();
            tracing::debug!(task = %name, "Task starting");

            task.run(ctx.clone()).await.inspect_err(|e| {
                tracing::debug!(task = %name, error = %e, "Task failed");
            })?;

            task_metrics.push(TaskMetrics {
                name,
                duration_ms: task_start.elapsed().as_millis(),
            });
        }

        let metrics = PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            tasks: task_metrics,
        };
        metrics.log();
        Ok(metrics)
    }
}
