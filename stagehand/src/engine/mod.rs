//! Engine client abstraction.
//!
//! The orchestration core talks to the container engine only through the
//! [`Engine`] trait. The production implementation ([`DockerEngine`]) wraps the
//! Docker API; tests drive the same code paths against a scripted in-memory
//! engine.
//!
//! ## Pairing invariant
//!
//! Every successful [`Engine::create_unit`] must be matched by exactly one
//! [`Engine::remove`] on every exit path. Callers enforce this, the engine
//! itself keeps no bookkeeping.

mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerEngine;

use crate::stage::LaunchSpec;
use crate::stream::{Sink, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use stagehand_shared::StagehandResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to an engine, injected into every component that needs one.
pub type SharedEngine = Arc<dyn Engine>;

/// Tar archive bytes streamed out of a unit.
pub type ByteStream = BoxStream<'static, StagehandResult<Bytes>>;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First 12 characters, for log lines.
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(12) {
                    Some((end, _)) => &self.0[..end],
                    None => &self.0,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

engine_id!(
    /// Engine-assigned identifier of a unit (container).
    UnitId
);
engine_id!(
    /// Engine-assigned identifier of a volume.
    VolumeId
);
engine_id!(
    /// Engine-assigned identifier of an exec session inside a unit.
    ExecId
);

/// Exit status observed after a unit (or exec session) finished streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    pub exit_code: i64,
    /// Must be false once the output stream has closed.
    pub running: bool,
}

/// A command executed inside an already running unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
}

impl ExecSpec {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Container/volume primitives against a remote engine.
///
/// All operations fail with `StagehandError::Engine` carrying the underlying
/// API or transport failure.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create (but do not start) a unit from a launch spec.
    ///
    /// The unit name is the launch spec's name prefix plus a random suffix.
    async fn create_unit(&self, spec: &LaunchSpec, attach_stdin: bool) -> StagehandResult<UnitId>;

    /// Attach to a created unit's stdio. Must be called before [`Engine::start`]
    /// so no early output is lost.
    async fn attach(&self, unit: &UnitId, stdin: bool) -> StagehandResult<Transport>;

    async fn start(&self, unit: &UnitId) -> StagehandResult<()>;

    async fn inspect(&self, unit: &UnitId) -> StagehandResult<ExitResult>;

    /// Stop a running unit, killing it once `timeout` has elapsed.
    async fn stop(&self, unit: &UnitId, timeout: Duration) -> StagehandResult<()>;

    /// Remove a unit, running or not.
    async fn remove(&self, unit: &UnitId) -> StagehandResult<()>;

    /// Whether an image is present locally.
    ///
    /// Returns `Ok(false)` only when the engine reports the image as missing;
    /// any other lookup failure is an error, never "absent".
    async fn image_exists(&self, image: &str) -> StagehandResult<bool>;

    /// Pull an image, writing progress lines to `progress`.
    async fn pull(&self, image: &str, progress: &mut Sink) -> StagehandResult<()>;

    /// Repository digests of a local image (may be empty for local builds).
    async fn image_digests(&self, image: &str) -> StagehandResult<Vec<String>>;

    async fn create_volume(&self) -> StagehandResult<VolumeId>;

    async fn remove_volume(&self, volume: &VolumeId) -> StagehandResult<()>;

    /// Tar archive of `path` inside the unit.
    async fn copy_from(&self, unit: &UnitId, path: &str) -> StagehandResult<ByteStream>;

    /// Extract a tar archive into directory `dir` inside the unit.
    async fn copy_to(&self, unit: &UnitId, dir: &str, archive: Bytes) -> StagehandResult<()>;

    async fn create_exec(&self, unit: &UnitId, spec: &ExecSpec) -> StagehandResult<ExecId>;

    /// Start an exec session and attach to its output in one step.
    async fn start_exec(&self, exec: &ExecId) -> StagehandResult<Transport>;

    async fn inspect_exec(&self, exec: &ExecId) -> StagehandResult<ExitResult>;

    /// Pull `image` only if it is not already present.
    async fn ensure_image(&self, image: &str, progress: &mut Sink) -> StagehandResult<()> {
        if self.image_exists(image).await? {
            tracing::debug!(image, "Image present locally");
            return Ok(());
        }
        tracing::info!(image, "Pulling image");
        self.pull(image, progress).await
    }
}

/// Random unit name for a prefix.
pub(crate) fn unit_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::stream::SharedBuffer;
    use stagehand_shared::StagehandError;

    #[test]
    fn test_short_id() {
        let id = UnitId::new("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(UnitId::new("abc").short(), "abc");
        assert_eq!(id.to_string(), "0123456789abcdef0123");
    }

    #[test]
    fn test_unit_name_has_prefix_and_suffix() {
        let a = unit_name("stagehand-release");
        let b = unit_name("stagehand-release");
        assert!(a.starts_with("stagehand-release-"));
        assert_eq!(a.len(), "stagehand-release-".len() + 12);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_ensure_image_skips_pull_when_present() {
        let engine = FakeEngine::new();
        let buffer = SharedBuffer::new();
        let mut progress = buffer.sink();

        engine.ensure_image("present:1", &mut progress).await.unwrap();
        assert!(engine.pulled().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_image_pulls_missing_image() {
        let engine = FakeEngine::new();
        engine.mark_missing("missing:1");
        let buffer = SharedBuffer::new();
        let mut progress = buffer.sink();

        engine.ensure_image("missing:1", &mut progress).await.unwrap();
        assert_eq!(engine.pulled(), vec!["missing:1".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_image_does_not_treat_lookup_failure_as_absent() {
        let engine = FakeEngine::new();
        engine.fail_image_lookup("daemon unavailable");
        let buffer = SharedBuffer::new();
        let mut progress = buffer.sink();

        let err = engine.ensure_image("any:1", &mut progress).await.unwrap_err();
        assert!(matches!(err, StagehandError::Engine(ref m) if m.contains("daemon unavailable")));
        assert!(engine.pulled().is_empty());
    }
}
