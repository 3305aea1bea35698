//! Tasks: release flow.
//!
//! ```text
//! configure_release ─► build_release ─► persist_release_metadata ─► upload_release
//!  (config unit)       (release unit,    (helper unit writes          (config unit
//!                       metadata hook)    /build/release-metadata.json) uploads)
//! ```

use super::{FlowCtx, log_task_error, task_start};
use crate::flow::GlobalState;
use crate::flow::config::{
    ConfigRequest, ConfigureReleaseResponse, UploadReleaseResponse, run_config_action,
};
use crate::handoff::{self, Metadata, MetadataFile};
use crate::pipeline::PipelineTask;
use crate::stage::{LaunchSpec, StageIo, StageRunner, VolumeBinding};
use async_trait::async_trait;
use stagehand_shared::constants::{handoff as files, mounts, names};
use stagehand_shared::{StagehandError, StagehandResult};
use std::collections::BTreeMap;
use tokio::io::AsyncWriteExt;

/// Keys every release stage sees regardless of the config unit.
pub(crate) fn derived_env(global: &GlobalState, version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("VERSION".to_string(), version.to_string()),
        ("TEAM".to_string(), global.manifest.team.clone()),
        ("COMPONENT".to_string(), global.component.clone()),
        ("COMMIT".to_string(), global.commit.clone()),
    ])
}

/// The persisted var-file: release metadata under one top-level key.
pub(crate) fn release_document(metadata: &Metadata) -> BTreeMap<String, Metadata> {
    BTreeMap::from([(files::RELEASE_METADATA_KEY.to_string(), metadata.clone())])
}

pub struct ConfigureReleaseTask;

#[async_trait]
impl PipelineTask<FlowCtx> for ConfigureReleaseTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (global, volume, version) = {
            let ctx = ctx.lock().await;
            (ctx.global.clone(), ctx.volume()?, ctx.version()?)
        };

        let request = ConfigRequest::ConfigureRelease {
            version: version.clone(),
            config: global.manifest.config.params.clone(),
            env: global.env.clone(),
        };
        let response: ConfigureReleaseResponse = run_config_action(&global, &volume, &request)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;

        // Raw env, then derived keys, then whatever the config unit decided.
        let mut ctx = ctx.lock().await;
        ctx.pipeline.merge_env(&global.env);
        ctx.pipeline.merge_env(&derived_env(&global, &version));
        ctx.pipeline.merge_env(&response.env);
        Ok(())
    }

    fn name(&self) -> &str {
        "configure_release"
    }
}

pub struct BuildReleaseTask;

#[async_trait]
impl PipelineTask<FlowCtx> for BuildReleaseTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (global, volume, env) = {
            let ctx = ctx.lock().await;
            (ctx.global.clone(), ctx.volume()?, ctx.pipeline.env.clone())
        };
        let image = global.manifest.release.image.clone();

        let mut progress = global.sinks.stderr();
        global
            .engine
            .ensure_image(&image, &mut progress)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;

        let spec = LaunchSpec::new(image, names::RELEASE)
            .working_dir(mounts::CODE_DIR)
            .env(env)
            .bind(VolumeBinding::host(&global.code_dir, mounts::CODE_DIR).read_only())
            .bind(VolumeBinding::volume(&volume, mounts::BUILD_DIR));
        let hook = MetadataFile::release();

        let report = StageRunner::new(global.engine.clone(), global.cancel.clone())
            .run(&spec, StageIo::from_sinks(global.sinks.as_ref()), Some(&hook))
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;

        // Metadata goes to the volume, not into the live environment.
        let output = report.output.unwrap_or_default();
        ctx.lock().await.pipeline.merge(&output);
        Ok(())
    }

    fn name(&self) -> &str {
        "build_release"
    }
}

pub struct PersistMetadataTask;

#[async_trait]
impl PipelineTask<FlowCtx> for PersistMetadataTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (global, volume, document) = {
            let ctx = ctx.lock().await;
            (
                ctx.global.clone(),
                ctx.volume()?,
                release_document(&ctx.pipeline.metadata),
            )
        };

        let contents = serde_json::to_vec(&document).map_err(|e| {
            StagehandError::Internal(format!("could not encode release metadata: {}", e))
        })?;
        handoff::write_to_volume(
            global.engine.as_ref(),
            &volume,
            &global.manifest.config.image,
            files::RELEASE_METADATA_FILE,
            &contents,
        )
        .await
        .inspect_err(|e| log_task_error(kind, task_name, e))?;

        ctx.lock().await.release_document = Some(document);
        Ok(())
    }

    fn name(&self) -> &str {
        "persist_release_metadata"
    }
}

pub struct UploadReleaseTask;

#[async_trait]
impl PipelineTask<FlowCtx> for UploadReleaseTask {
    async fn run(self: Box<Self>, ctx: FlowCtx) -> StagehandResult<()> {
        let task_name = self.name();
        let kind = task_start(&ctx, task_name).await;

        let (global, volume, document) = {
            let ctx = ctx.lock().await;
            let document = ctx.release_document.clone().ok_or_else(|| {
                StagehandError::Internal("release metadata was not persisted".into())
            })?;
            (ctx.global.clone(), ctx.volume()?, document)
        };

        let terraform_image = pinned_image(&global, &global.manifest.terraform.image)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;
        tracing::debug!(image = %terraform_image, "Recording terraform image with release");

        let request = ConfigRequest::UploadRelease {
            terraform_image,
            release_metadata: document,
        };
        let response: UploadReleaseResponse = run_config_action(&global, &volume, &request)
            .await
            .inspect_err(|e| log_task_error(kind, task_name, e))?;

        if !response.message.is_empty() {
            let mut stderr = global.sinks.stderr();
            stderr
                .write_all(format!("{}\n", response.message.trim_end()).as_bytes())
                .await?;
            stderr.flush().await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "upload_release"
    }
}

/// The image reference pinned to its repository digest, when the engine
/// knows one. Locally built images have none and are used as given.
async fn pinned_image(global: &GlobalState, image: &str) -> StagehandResult<String> {
    let mut progress = global.sinks.stderr();
    global.engine.ensure_image(image, &mut progress).await?;
    let digests = global.engine.image_digests(image).await?;
    Ok(digests
        .into_iter()
        .next()
        .unwrap_or_else(|| image.to_string()))
}
