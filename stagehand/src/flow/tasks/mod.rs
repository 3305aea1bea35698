//! Pipeline tasks for the release, deploy and destroy flows.
//!
//! Tasks share one [`FlowState`] behind an async mutex. Each task locks it
//! briefly to read its inputs, releases it while units run, then locks it
//! again to record outputs and register teardown.

mod provision;
mod release;
mod volume;

pub(super) use provision::{
    ApplyTask, AssembleCommandsTask, InitTerraformTask, PlanTask, PrepareTerraformTask,
    SelectWorkspaceTask, StartTerraformTask,
};
pub(super) use release::{
    BuildReleaseTask, ConfigureReleaseTask, PersistMetadataTask, UploadReleaseTask,
};
pub(super) use volume::CreateVolumeTask;

use super::commands::ProvisionCommand;
use super::config::PrepareTerraformResponse;
use super::state::PipelineState;
use super::terraform::TerraformUnit;
use super::{FlowKind, GlobalState};
use crate::cleanup::CleanupStack;
use crate::engine::VolumeId;
use crate::handoff::Metadata;
use stagehand_shared::{StagehandError, StagehandResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) type FlowCtx = Arc<Mutex<FlowState>>;

/// What the operator asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlowRequest {
    pub kind: FlowKind,
    pub version: Option<String>,
    pub env_name: Option<String>,
    pub plan_only: bool,
}

pub(crate) struct FlowState {
    pub global: GlobalState,
    pub request: FlowRequest,
    pub pipeline: PipelineState,
    pub cleanup: CleanupStack,

    pub volume: Option<VolumeId>,
    pub release_document: Option<BTreeMap<String, Metadata>>,
    pub prepared: Option<PrepareTerraformResponse>,
    pub terraform: Option<Arc<TerraformUnit>>,
    /// Plan command and the command that follows it.
    pub commands: Option<(ProvisionCommand, ProvisionCommand)>,
}

fn missing(what: &str, task: &str) -> StagehandError {
    StagehandError::Internal(format!("{} not available, {} task must run first", what, task))
}

impl FlowState {
    pub fn new(global: GlobalState, request: FlowRequest) -> Self {
        Self {
            global,
            request,
            pipeline: PipelineState::default(),
            cleanup: CleanupStack::new(),
            volume: None,
            release_document: None,
            prepared: None,
            terraform: None,
            commands: None,
        }
    }

    pub fn volume(&self) -> StagehandResult<VolumeId> {
        self.volume
            .clone()
            .ok_or_else(|| missing("volume", "create_volume"))
    }

    pub fn version(&self) -> StagehandResult<String> {
        self.request
            .version
            .clone()
            .ok_or_else(|| StagehandError::Config("a version is required".into()))
    }

    pub fn env_name(&self) -> StagehandResult<String> {
        self.request
            .env_name
            .clone()
            .ok_or_else(|| StagehandError::Config("an environment name is required".into()))
    }

    pub fn prepared(&self) -> StagehandResult<PrepareTerraformResponse> {
        self.prepared
            .clone()
            .ok_or_else(|| missing("terraform settings", "prepare_terraform"))
    }

    pub fn terraform(&self) -> StagehandResult<Arc<TerraformUnit>> {
        self.terraform
            .clone()
            .ok_or_else(|| missing("terraform unit", "start_terraform"))
    }

    pub fn commands(&self) -> StagehandResult<(ProvisionCommand, ProvisionCommand)> {
        self.commands
            .clone()
            .ok_or_else(|| missing("commands", "assemble_commands"))
    }
}

pub(super) async fn task_start(ctx: &FlowCtx, task_name: &str) -> FlowKind {
    let kind = ctx.lock().await.request.kind;
    tracing::debug!(flow = %kind, task = task_name, "Task started");
    kind
}

pub(super) fn log_task_error(kind: FlowKind, task_name: &str, error: &StagehandError) {
    tracing::debug!(flow = %kind, task = task_name, error = %error, "Task failed");
}
