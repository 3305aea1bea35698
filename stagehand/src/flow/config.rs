//! Config unit protocol.
//!
//! The config unit is a one-shot request/response service: it reads exactly
//! one JSON request on stdin and writes one JSON object to stdout. Its stderr
//! is forwarded to the operator. It mounts the shared volume at `/build`.
//!
//! ```text
//! {"Action":"configure_release","Version":"1.2","Config":{..},"Env":{..}}
//!   ──► {"Env":{"AWS_ACCESS_KEY_ID":"..."}}
//! ```

use super::GlobalState;
use crate::engine::VolumeId;
use crate::handoff::Metadata;
use crate::stage::{LaunchSpec, StageIo, StageRunner, VolumeBinding};
use crate::stream::SharedBuffer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stagehand_shared::constants::{mounts, names};
use stagehand_shared::{StagehandError, StagehandResult};
use std::collections::BTreeMap;
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "Action",
    rename_all = "snake_case",
    rename_all_fields = "PascalCase"
)]
pub enum ConfigRequest {
    ConfigureRelease {
        version: String,
        config: Map<String, Value>,
        env: BTreeMap<String, String>,
    },
    UploadRelease {
        terraform_image: String,
        release_metadata: BTreeMap<String, Metadata>,
    },
    PrepareTerraform {
        version: String,
        env_name: String,
        config: Map<String, Value>,
        env: BTreeMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        state_should_exist: Option<bool>,
    },
}

impl ConfigRequest {
    pub fn action(&self) -> &'static str {
        match self {
            ConfigRequest::ConfigureRelease { .. } => "configure_release",
            ConfigRequest::UploadRelease { .. } => "upload_release",
            ConfigRequest::PrepareTerraform { .. } => "prepare_terraform",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigureReleaseResponse {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadReleaseResponse {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrepareTerraformResponse {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub terraform_image: String,
    pub terraform_backend_type: String,
    #[serde(default)]
    pub terraform_backend_config: BTreeMap<String, String>,
}

/// Send one request to the config unit and decode its answer.
pub async fn run_config_action<R>(
    global: &GlobalState,
    volume: &VolumeId,
    request: &ConfigRequest,
) -> StagehandResult<R>
where
    R: DeserializeOwned,
{
    let action = request.action();
    let image = &global.manifest.config.image;

    let mut progress = global.sinks.stderr();
    global.engine.ensure_image(image, &mut progress).await?;

    let payload = serde_json::to_vec(request).map_err(|e| {
        StagehandError::Internal(format!("could not encode {} request: {}", action, e))
    })?;
    let spec = LaunchSpec::new(image.as_str(), names::CONFIG)
        .bind(VolumeBinding::volume(volume, mounts::BUILD_DIR));

    let response = SharedBuffer::new();
    let io = StageIo::new(response.sink(), global.sinks.stderr())
        .with_input(Box::new(Cursor::new(payload)));

    tracing::debug!(action, "Running config unit");
    StageRunner::new(global.engine.clone(), global.cancel.clone())
        .run(&spec, io, None)
        .await?;

    serde_json::from_slice(&response.contents()).map_err(|e| {
        StagehandError::Config(format!(
            "invalid response from config unit to {}: {}",
            action, e
        ))
    })
}
