//! Task trait for pipeline execution.

use async_trait::async_trait;
use stagehand_shared::StagehandResult;

/// One step of a flow.
///
/// Tasks run with a shared context, which is cloned per task; writes go
/// through interior mutability.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> StagehandResult<()>;

    /// Name used in logs and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
