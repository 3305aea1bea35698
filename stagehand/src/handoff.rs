//! Volume-based state handoff between stages.
//!
//! Units never share memory. A producing stage writes a file into its own
//! filesystem (or the shared volume mounted at `/build`); the orchestrator
//! copies single files out or in as one-entry tar archives. Volume contents
//! are otherwise opaque here.

use crate::engine::{Engine, UnitId, VolumeId};
use crate::stage::{BeforeRemove, LaunchSpec, VolumeBinding};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use stagehand_shared::constants::{handoff, mounts, names};
use stagehand_shared::{StagehandError, StagehandResult, combine};
use std::collections::BTreeMap;
use std::io::Read;

/// Values a stage may emit in its metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    Map(BTreeMap<String, String>),
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// What a finished stage hands to the ones after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub env: BTreeMap<String, String>,
    pub metadata: Metadata,
}

impl StageOutput {
    pub fn with_env(env: BTreeMap<String, String>) -> Self {
        Self {
            env,
            ..Default::default()
        }
    }

    pub fn with_metadata(metadata: Metadata) -> Self {
        Self {
            metadata,
            ..Default::default()
        }
    }
}

/// Pre-removal hook that reads one JSON metadata file out of the unit.
#[derive(Debug, Clone)]
pub struct MetadataFile {
    path: String,
}

impl MetadataFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// The release stage's metadata document.
    pub fn release() -> Self {
        Self::new(handoff::RELEASE_METADATA_PATH)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl BeforeRemove for MetadataFile {
    async fn before_remove(
        &self,
        engine: &dyn Engine,
        unit: &UnitId,
    ) -> StagehandResult<StageOutput> {
        let metadata = read_metadata(engine, unit, &self.path).await?;
        Ok(StageOutput::with_metadata(metadata))
    }
}

fn decode_error(path: &str, reason: impl std::fmt::Display) -> StagehandError {
    StagehandError::HandoffDecode {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Decode the first entry of a tar archive as a JSON metadata object.
pub fn decode_metadata_archive(archive: &[u8], path: &str) -> StagehandResult<Metadata> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = archive.entries().map_err(|e| decode_error(path, e))?;
    let mut entry = match entries.next() {
        Some(entry) => entry.map_err(|e| decode_error(path, e))?,
        None => return Err(decode_error(path, "archive has no entries")),
    };

    let mut contents = String::new();
    entry
        .read_to_string(&mut contents)
        .map_err(|e| decode_error(path, e))?;

    serde_json::from_str(&contents).map_err(|e| decode_error(path, e))
}

/// A tar archive holding one regular file.
pub fn single_file_archive(name: &str, contents: &[u8]) -> StagehandResult<Bytes> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, contents)
        .map_err(|e| StagehandError::Internal(format!("failed to archive {}: {}", name, e)))?;
    let data = builder
        .into_inner()
        .map_err(|e| StagehandError::Internal(format!("failed to archive {}: {}", name, e)))?;
    Ok(Bytes::from(data))
}

/// Copy `path` out of `unit` and decode it as metadata.
///
/// A file the unit never wrote, or one whose copy breaks off, is reported
/// as a decode failure naming `path`.
pub async fn read_metadata(
    engine: &dyn Engine,
    unit: &UnitId,
    path: &str,
) -> StagehandResult<Metadata> {
    let mut chunks = engine
        .copy_from(unit, path)
        .await
        .map_err(|e| decode_error(path, e))?;
    let mut archive = Vec::new();
    while let Some(chunk) = chunks.next().await {
        archive.extend_from_slice(&chunk.map_err(|e| decode_error(path, e))?);
    }
    tracing::debug!(unit_id = %unit.short(), path, bytes = archive.len(), "Copied metadata out");
    decode_metadata_archive(&archive, path)
}

/// Place one file at the root of a volume.
///
/// Uses a helper unit that is created with the volume bound at `/build`,
/// never started, and removed afterwards.
pub async fn write_to_volume(
    engine: &dyn Engine,
    volume: &VolumeId,
    image: &str,
    name: &str,
    contents: &[u8],
) -> StagehandResult<()> {
    let archive = single_file_archive(name, contents)?;
    let spec = LaunchSpec::new(image, names::HANDOFF)
        .bind(VolumeBinding::volume(volume, mounts::BUILD_DIR));

    let unit = engine.create_unit(&spec, false).await?;
    let result = engine.copy_to(&unit, mounts::BUILD_DIR, archive).await;
    let cleanup = engine.remove(&unit).await.err().into_iter().collect();
    if result.is_ok() {
        tracing::debug!(volume = %volume.short(), name, "Wrote file to volume");
    }
    combine(result, cleanup)
}
