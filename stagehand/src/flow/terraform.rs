//! The provisioning unit and the tool-level steps run inside it.

use super::GlobalState;
use super::commands::{
    ProvisionCommand, init_command, workspace_list_command, workspace_new_command,
    workspace_select_command,
};
use crate::engine::VolumeId;
use crate::stage::{LaunchSpec, ProvisionUnit, VolumeBinding};
use crate::stream::{OutputSinks, SharedBuffer};
use bytes::Bytes;
use stagehand_shared::constants::{handoff, mounts, names, provision};
use stagehand_shared::{StagehandError, StagehandResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A running provisioning unit plus the environment its commands get.
pub struct TerraformUnit {
    unit: ProvisionUnit,
    env: BTreeMap<String, String>,
    sinks: Arc<dyn OutputSinks>,
}

impl TerraformUnit {
    /// Pull the image if needed and start an idle unit with the code tree
    /// at `/code` (read-only) and the shared volume at `/build`.
    pub async fn start(
        global: &GlobalState,
        image: &str,
        volume: &VolumeId,
        env: BTreeMap<String, String>,
    ) -> StagehandResult<Self> {
        let mut progress = global.sinks.stderr();
        global.engine.ensure_image(image, &mut progress).await?;

        let spec = LaunchSpec::new(image, names::TERRAFORM)
            .entrypoint(provision::IDLE_ENTRYPOINT.iter().copied())
            .working_dir(mounts::BUILD_DIR)
            .bind(VolumeBinding::host(&global.code_dir, mounts::CODE_DIR).read_only())
            .bind(VolumeBinding::volume(volume, mounts::BUILD_DIR))
            .init();

        let unit =
            ProvisionUnit::start(global.engine.clone(), &spec, global.cancel.clone()).await?;
        Ok(Self {
            unit,
            env,
            sinks: Arc::clone(&global.sinks),
        })
    }

    /// Handle for the cleanup stack.
    pub fn unit(&self) -> ProvisionUnit {
        self.unit.clone()
    }

    /// Copy `<code>/infra` into the unit's work dir. The provider lock file
    /// travels with it when present.
    pub async fn stage_infra(&self, code_dir: &Path) -> StagehandResult<()> {
        let code_dir = code_dir.to_path_buf();
        let has_lock = code_dir
            .join(provision::INFRA_DIR)
            .join(handoff::TERRAFORM_LOCK_FILE)
            .is_file();
        let archive = tokio::task::spawn_blocking(move || infra_archive(&code_dir))
            .await
            .map_err(|e| StagehandError::Internal(format!("archiving infra failed: {}", e)))??;

        tracing::debug!(bytes = archive.len(), lock_file = has_lock, "Staging infra code");
        self.unit.copy_archive(mounts::BUILD_DIR, archive).await
    }

    /// Write the backend override and initialise the working directory.
    pub async fn configure_backend(
        &self,
        backend_type: &str,
        backend_config: &BTreeMap<String, String>,
    ) -> StagehandResult<()> {
        self.unit
            .copy_file(
                provision::WORK_DIR,
                handoff::BACKEND_OVERRIDE_FILE,
                backend_override(backend_type).as_bytes(),
            )
            .await?;
        self.run(&init_command(backend_config)).await
    }

    /// Select the workspace named `name`, creating it when missing.
    pub async fn switch_workspace(&self, name: &str) -> StagehandResult<()> {
        let listing = self.capture(&workspace_list_command()).await?;
        let command = if parse_workspaces(&listing).iter().any(|w| w == name) {
            workspace_select_command(name)
        } else {
            tracing::info!(workspace = name, "Creating workspace");
            workspace_new_command(name)
        };
        self.run(&command).await
    }

    /// Run a command with its output going to the operator.
    pub async fn run(&self, command: &ProvisionCommand) -> StagehandResult<()> {
        self.unit
            .exec(
                &command.to_exec(&self.env, provision::WORK_DIR),
                self.sinks.stdout(),
                self.sinks.stderr(),
            )
            .await
    }

    async fn capture(&self, command: &ProvisionCommand) -> StagehandResult<String> {
        let stdout = SharedBuffer::new();
        self.unit
            .exec(
                &command.to_exec(&self.env, provision::WORK_DIR),
                stdout.sink(),
                self.sinks.stderr(),
            )
            .await?;
        Ok(stdout.to_string_lossy())
    }
}

/// Backend block with an empty body; settings come from `-backend-config`.
pub fn backend_override(backend_type: &str) -> String {
    format!("terraform {{\n  backend \"{}\" {{}}\n}}\n", backend_type)
}

/// Workspace names from `workspace list` output (current one marked `*`).
pub fn parse_workspaces(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_start_matches('*').trim())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// Tar of the host's `<code>/infra`, rooted at `infra/`.
pub fn infra_archive(code_dir: &Path) -> StagehandResult<Bytes> {
    let infra: PathBuf = code_dir.join(provision::INFRA_DIR);
    if !infra.is_dir() {
        return Err(StagehandError::Config(format!(
            "no {} directory in {}",
            provision::INFRA_DIR,
            code_dir.display()
        )));
    }

    let archive_err = |e: std::io::Error| {
        StagehandError::Internal(format!("failed to archive {}: {}", infra.display(), e))
    };
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(provision::INFRA_DIR, &infra)
        .map_err(archive_err)?;
    let data = builder.into_inner().map_err(archive_err)?;
    Ok(Bytes::from(data))
}
