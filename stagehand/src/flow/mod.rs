//! Release, deploy and destroy flows.
//!
//! ## Architecture
//!
//! Each flow is a table-driven execution plan over a shared [`FlowState`]:
//!
//! ```text
//! release:
//!   create_volume → configure_release → build_release
//!     → persist_release_metadata → upload_release
//!
//! deploy / destroy:
//!   create_volume → prepare_terraform → start_terraform → init_terraform
//!     → assemble_commands → select_workspace → plan → apply   (apply skipped
//!                                                               when plan-only)
//! ```
//!
//! Tasks register teardown (shared volume, provisioning unit) on a cleanup
//! stack as they acquire resources. The stack runs after the executor
//! returns, on success, failure and cancellation alike, and its failures are
//! folded into the flow's result.

mod commands;
mod config;
mod manifest;
mod state;
mod tasks;
mod terraform;

pub use commands::{ProvisionCommand, ProvisionMode, VarFiles, provision_commands};
pub use config::{
    ConfigRequest, ConfigureReleaseResponse, PrepareTerraformResponse, UploadReleaseResponse,
    run_config_action,
};
pub use manifest::{MANIFEST_FILE, Manifest};
pub use state::PipelineState;
pub use terraform::{TerraformUnit, backend_override, parse_workspaces};

use crate::engine::SharedEngine;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor};
use crate::stream::{OutputSinks, ProcessSinks};
use stagehand_shared::StagehandResult;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tasks::{
    ApplyTask, AssembleCommandsTask, BuildReleaseTask, ConfigureReleaseTask, CreateVolumeTask,
    FlowCtx, FlowRequest, FlowState, InitTerraformTask, PersistMetadataTask, PlanTask,
    PrepareTerraformTask, SelectWorkspaceTask, StartTerraformTask, UploadReleaseTask,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Everything a command needs from the outside world.
///
/// Built once per invocation and passed down explicitly.
#[derive(Clone)]
pub struct GlobalState {
    pub engine: SharedEngine,
    /// Host path of the source tree, mounted read-only at `/code`.
    pub code_dir: PathBuf,
    pub manifest: Manifest,
    pub component: String,
    pub commit: String,
    /// Raw environment handed to the config unit.
    pub env: BTreeMap<String, String>,
    pub sinks: Arc<dyn OutputSinks>,
    pub cancel: CancellationToken,
}

impl GlobalState {
    pub fn new(
        engine: SharedEngine,
        code_dir: PathBuf,
        manifest: Manifest,
        component: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            code_dir,
            manifest,
            component: component.into(),
            commit: commit.into(),
            env: BTreeMap::new(),
            sinks: Arc::new(ProcessSinks),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_sinks(mut self, sinks: Arc<dyn OutputSinks>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Release,
    Deploy,
    Destroy,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowKind::Release => "release",
            FlowKind::Deploy => "deploy",
            FlowKind::Destroy => "destroy",
        })
    }
}

fn get_execution_plan(kind: FlowKind, plan_only: bool) -> ExecutionPlan<FlowCtx> {
    let tasks: Vec<BoxedTask<FlowCtx>> = match kind {
        FlowKind::Release => vec![
            Box::new(CreateVolumeTask),
            Box::new(ConfigureReleaseTask),
            Box::new(BuildReleaseTask),
            Box::new(PersistMetadataTask),
            Box::new(UploadReleaseTask),
        ],
        FlowKind::Deploy | FlowKind::Destroy => {
            let mut tasks: Vec<BoxedTask<FlowCtx>> = vec![
                Box::new(CreateVolumeTask),
                Box::new(PrepareTerraformTask),
                Box::new(StartTerraformTask),
                Box::new(InitTerraformTask),
                Box::new(AssembleCommandsTask),
                Box::new(SelectWorkspaceTask),
                Box::new(PlanTask),
            ];
            if !plan_only {
                tasks.push(Box::new(ApplyTask));
            }
            tasks
        }
    };

    ExecutionPlan::new(tasks)
}

async fn run_flow(global: &GlobalState, request: FlowRequest) -> StagehandResult<()> {
    let plan = get_execution_plan(request.kind, request.plan_only);
    tracing::info!(flow = %request.kind, tasks = ?plan.task_names(), "Starting");

    let ctx: FlowCtx = Arc::new(Mutex::new(FlowState::new(global.clone(), request)));
    let result = PipelineExecutor::execute(plan, Arc::clone(&ctx), &global.cancel).await;

    let cleanup = std::mem::take(&mut ctx.lock().await.cleanup);
    cleanup.finish(result.map(|_| ())).await
}

/// Build a release of `version` and publish it.
pub async fn release(global: &GlobalState, version: &str) -> StagehandResult<()> {
    run_flow(
        global,
        FlowRequest {
            kind: FlowKind::Release,
            version: Some(version.to_string()),
            env_name: None,
            plan_only: false,
        },
    )
    .await
}

/// Deploy `version` to `env_name`.
pub async fn deploy(
    global: &GlobalState,
    env_name: &str,
    version: &str,
    plan_only: bool,
) -> StagehandResult<()> {
    run_flow(
        global,
        FlowRequest {
            kind: FlowKind::Deploy,
            version: Some(version.to_string()),
            env_name: Some(env_name.to_string()),
            plan_only,
        },
    )
    .await
}

/// Destroy the infrastructure of `env_name`. Without a version the release
/// metadata var-file is not passed.
pub async fn destroy(
    global: &GlobalState,
    env_name: &str,
    version: Option<&str>,
    plan_only: bool,
) -> StagehandResult<()> {
    run_flow(
        global,
        FlowRequest {
            kind: FlowKind::Destroy,
            version: version.map(str::to_string),
            env_name: Some(env_name.to_string()),
            plan_only,
        },
    )
    .await
}

/// Progress line for the operator, interleaved with unit stderr.
async fn announce(
    sinks: &dyn OutputSinks,
    label: &str,
    command: &ProvisionCommand,
) -> StagehandResult<()> {
    let mut stderr = sinks.stderr();
    stderr
        .write_all(format!("\n{}\n{}\n\n", label, command).as_bytes())
        .await?;
    stderr.flush().await?;
    Ok(())
}
