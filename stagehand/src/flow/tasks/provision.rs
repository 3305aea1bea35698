//! Tasks: deploy and destroy flows.
//!
//! ```text
//! prepare_terraform ─► start_terraform ─► init_terraform ─► assemble_commands
//!   (config unit)       (idle unit)        (infra + backend)
//!        ─► select_workspace ─► plan ─► [apply | destroy]
//! ```
//!
//! Plan-only runs leave the last task out of the plan.

use super::{FlowCtx, log_task_error, task_start};
use crate::flow::commands::{ProvisionCommand, ProvisionMode, VarFiles, provision_commands};
use crate::flow::config::{ConfigRequest, PrepareTerraformResponse, run_config_action};
use crate::flow::terraform::TerraformUnit;
use crate::flow::{FlowKind, announce};
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use stagehand_shared::{StagehandError, StagehandResult};
use std::sync::Arc;

fn mode(kind: FlowKind) -> StagehandResult<ProvisionMode> {
    match kind {
        FlowKind::Deploy => Ok(ProvisionMode::Deploy),
        FlowKind::Destroy => Ok(ProvisionMode::Destroy),
        FlowKind::Release => Err(StagehandError::Internal(
            "release flow has no provisioning mode".into(),
        )),
    }
}

pub struct PrepareTerraformTask;

#[async_trait]
impl PipelineTask<FlowCtx> for PrepareTerraformTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (global, volume, env_name, version) = {
            let ctx = ctx.lock().await;
            (
                ctx.global.clone(),
                ctx.volume()?,
                ctx.env_name()?,
                ctx.request.version.clone(),
            )
        };

        let request = ConfigRequest::PrepareTerraform {
            version: version.unwrap_or_default(),
            env_name,
            config: global.manifest.config.params.clone(),
            env: global.env.clone(),
            state_should_exist: (kind == FlowKind::Destroy).then_some(true),
        };
        let response: PrepareTerraformResponse = run_config_action(&global, &volume, &request)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;

        if response.terraform_image.trim().is_empty() {
            return Err(StagehandError::Config(
                "config unit returned no terraform image".into(),
            ));
        }
        tracing::debug!(
            backend = %response.terraform_backend_type,
            image = %response.terraform_image,
            "Terraform prepared"
        );

        let mut ctx = ctx.lock().await;
        ctx.pipeline.merge_env(&response.env);
        ctx.prepared = Some(response);
        Ok(())
    }

    fn name(&self) -> &str {
        "prepare_terraform"
    }
}

pub struct StartTerraformTask;

#[async_trait]
impl PipelineTask<FlowCtx> for StartTerraformTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (global, volume, prepared, env) = {
            let ctx = ctx.lock().await;
            (
                ctx.global.clone(),
                ctx.volume()?,
                ctx.prepared()?,
                ctx.pipeline.env.clone(),
            )
        };

        let terraform = TerraformUnit::start(&global, &prepared.terraform_image, &volume, env)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;

        let mut ctx = ctx.lock().await;
        let unit = terraform.unit();
        ctx.cleanup
            .push("remove terraform unit", async move { unit.done().await });
        ctx.terraform = Some(Arc::new(terraform));
        Ok(())
    }

    fn name(&self) -> &str {
        "start_terraform"
    }
}

pub struct InitTerraformTask;

#[async_trait]
impl PipelineTask<FlowCtx> for InitTerraformTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (code_dir, prepared, terraform) = {
            let ctx = ctx.lock().await;
            (
                ctx.global.code_dir.clone(),
                ctx.prepared()?,
                ctx.terraform()?,
            )
        };

        async {
            terraform.stage_infra(&code_dir).await?;
            terraform
                .configure_backend(
                    &prepared.terraform_backend_type,
                    &prepared.terraform_backend_config,
                )
                .await
        }
        .await
        .inspect_err(|e| log_task_error(kind, task_name, e))
    }

    fn name(&self) -> &str {
        "init_terraform"
    }
}

pub struct AssembleCommandsTask;

#[async_trait]
impl PipelineTask<FlowCtx> for AssembleCommandsTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let env_name = ctx.env_name()?;
        let var_files = VarFiles::discover(
            &ctx.global.code_dir,
            &env_name,
            ctx.request.version.as_deref(),
        );
        tracing::debug!(var_files = ?var_files.paths(), "Var-files");

        let commands = provision_commands(mode(kind)?, &var_files);
        ctx.commands = Some(commands);
        Ok(())
    }

    fn name(&self) -> &str {
        "assemble_commands"
    }
}

pub struct SelectWorkspaceTask;

#[async_trait]
impl PipelineTask<FlowCtx> for SelectWorkspaceTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (env_name, terraform) = {
            let ctx = ctx.lock().await;
            (ctx.env_name()?, ctx.terraform()?)
        };

        terraform
            .switch_workspace(&env_name)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))
    }

    fn name(&self) -> &str {
        "select_workspace"
    }
}

async fn run_announced(
    ctx: &FlowCtx,
    label: &str,
    pick: fn((ProvisionCommand, ProvisionCommand)) -> ProvisionCommand,
) -> StagehandResult<()> {
    let (sinks, terraform, command) = {
        let ctx = ctx.lock().await;
        (
            Arc::clone(&ctx.global.sinks),
            ctx.terraform()?,
            pick(ctx.commands()?),
        )
    };
    announce(sinks.as_ref(), label, &command).await?;
    terraform.run(&command).await
}

pub struct PlanTask;

#[async_trait]
impl PipelineTask<FlowCtx> for PlanTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        run_announced(&ctx, "generating plan", |(plan, _)| plan)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))
    }

    fn name(&self) -> &str {
        "plan"
    }
}

pub struct ApplyTask;

#[async_trait]
impl PipelineTask<FlowCtx> for ApplyTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let label = match mode(kind)? {
            ProvisionMode::Deploy => "applying plan",
            ProvisionMode::Destroy => "destroying",
        };
        run_announced(&ctx, label, |(_, follow_up)| follow_up)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))
    }

    fn name(&self) -> &str {
        "apply"
    }
}
