//! Running one pipeline stage in an ephemeral unit.
//!
//! A stage is described by an immutable [`LaunchSpec`]. Its stdio is carried
//! separately in [`StageIo`] because the input stream is consumed by the run.
//! [`StageRunner`] owns the create → attach → start → inspect → remove cycle;
//! [`ProvisionUnit`] keeps one unit alive across several exec sessions.

mod exec;
mod runner;

pub use exec::{ProvisionUnit, exec_in_unit};
pub use runner::{BeforeRemove, StageReport, StageRunner};

use crate::engine::VolumeId;
use crate::stream::{OutputSinks, Sink, Source};
use stagehand_shared::constants::DEFAULT_SUCCESS_EXIT_CODE;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything needed to create a stage's unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    /// Unit names are this prefix plus a random suffix. Also names the stage
    /// in failure messages.
    pub name_prefix: String,
    pub working_dir: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub bindings: Vec<VolumeBinding>,
    pub init: bool,
    pub success_exit_code: i64,
}

impl LaunchSpec {
    pub fn new(image: impl Into<String>, name_prefix: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name_prefix: name_prefix.into(),
            working_dir: None,
            entrypoint: None,
            command: Vec::new(),
            env: BTreeMap::new(),
            bindings: Vec::new(),
            init: false,
            success_exit_code: DEFAULT_SUCCESS_EXIT_CODE,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Append a binding. Bindings keep their insertion order.
    pub fn bind(mut self, binding: VolumeBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Run an init process as PID 1 so stop signals are forwarded.
    pub fn init(mut self) -> Self {
        self.init = true;
        self
    }

    pub fn success_exit_code(mut self, code: i64) -> Self {
        self.success_exit_code = code;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindSource {
    HostPath(PathBuf),
    Volume(VolumeId),
}

/// One mount of a host directory or engine volume into a unit.
///
/// ```ignore
/// VolumeBinding::host("/src/app", "/code").read_only();   // "/src/app:/code:ro"
/// VolumeBinding::volume(&volume, "/build");              // "<id>:/build"
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub source: BindSource,
    pub target: String,
    pub read_only: bool,
}

impl VolumeBinding {
    pub fn host(path: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: BindSource::HostPath(path.into()),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(volume: &VolumeId, target: impl Into<String>) -> Self {
        Self {
            source: BindSource::Volume(volume.clone()),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Engine bind string: `source:target[:ro]`.
    pub fn to_bind(&self) -> String {
        let source = match &self.source {
            BindSource::HostPath(path) => path.display().to_string(),
            BindSource::Volume(id) => id.to_string(),
        };
        if self.read_only {
            format!("{}:{}:ro", source, self.target)
        } else {
            format!("{}:{}", source, self.target)
        }
    }
}

/// Stdio for one stage run.
pub struct StageIo {
    pub input: Option<Source>,
    pub stdout: Sink,
    pub stderr: Sink,
}

impl StageIo {
    pub fn new(stdout: Sink, stderr: Sink) -> Self {
        Self {
            input: None,
            stdout,
            stderr,
        }
    }

    pub fn from_sinks(sinks: &dyn OutputSinks) -> Self {
        Self::new(sinks.stdout(), sinks.stderr())
    }

    pub fn with_input(mut self, input: Source) -> Self {
        self.input = Some(input);
        self
    }
}

/// `KEY=VALUE` entries in key order.
pub fn env_entries(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}
