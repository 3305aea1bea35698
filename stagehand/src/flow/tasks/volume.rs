//! Task: create the shared volume.

use super::{FlowCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use stagehand_shared::StagehandResult;

pub struct CreateVolumeTask;

#[async_trait]
impl PipelineTask<FlowCtx> for CreateVolumeTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let engine = ctx.lock().await.global.engine.clone();
        let volume = engine
            .create_volume()
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;
        tracing::debug!(volume = %volume.short(), "Shared volume created");

        let mut ctx = ctx.lock().await;
        let id = volume.clone();
        ctx.cleanup.push("remove shared volume", async move {
            engine.remove_volume(&id).await
        });
        ctx.volume = Some(volume);
        Ok(())
    }

    fn name(&self) -> &str {
        "create_volume"
    }
}
