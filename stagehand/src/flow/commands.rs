//! Provisioning command lines.
//!
//! Every plan/apply/destroy command is a fixed verb and flags followed by up
//! to three optional var-files, always in this order:
//!
//! 1. release metadata, when a version is known
//! 2. `config/common.json`, when it exists in the code tree
//! 3. `config/<env>.json`, when it exists in the code tree
//!
//! A missing file is skipped, never an error.

use crate::engine::ExecSpec;
use stagehand_shared::constants::{handoff, mounts, provision};
use std::collections::BTreeMap;
use std::path::Path;

/// Container-side paths of the var-files present for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarFiles {
    paths: Vec<String>,
}

impl VarFiles {
    /// Look for the optional var-files on the host side of the code mount.
    pub fn discover(code_dir: &Path, env_name: &str, version: Option<&str>) -> Self {
        let mut paths = Vec::new();

        if version.is_some_and(|v| !v.is_empty()) {
            paths.push(format!(
                "{}{}",
                mounts::BUILD_DIR,
                handoff::RELEASE_METADATA_PATH
            ));
        }

        let config_dir = code_dir.join(provision::CONFIG_DIR);
        let env_file = format!("{}.json", env_name);
        for name in [provision::COMMON_CONFIG_FILE, env_file.as_str()] {
            if config_dir.join(name).is_file() {
                paths.push(format!(
                    "{}/{}/{}",
                    mounts::CODE_DIR,
                    provision::CONFIG_DIR,
                    name
                ));
            } else {
                tracing::debug!(file = name, "Var-file not present, skipping");
            }
        }

        Self { paths }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// One provisioning tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionCommand {
    args: Vec<String>,
}

impl ProvisionCommand {
    /// `terraform` followed by the verb and its fixed flags.
    pub fn new(base: &[&str]) -> Self {
        let mut args = Vec::with_capacity(base.len() + 1);
        args.push(provision::TOOL.to_string());
        args.extend(base.iter().map(|s| s.to_string()));
        Self { args }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_var_files(mut self, var_files: &VarFiles) -> Self {
        self.args.extend(
            var_files
                .paths()
                .iter()
                .map(|path| format!("-var-file={}", path)),
        );
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The verb, e.g. `plan`.
    pub fn verb(&self) -> &str {
        self.args.get(1).map(String::as_str).unwrap_or_default()
    }

    pub fn to_exec(&self, env: &BTreeMap<String, String>, working_dir: &str) -> ExecSpec {
        ExecSpec {
            command: self.args.clone(),
            env: env.clone(),
            working_dir: Some(working_dir.to_string()),
        }
    }
}

impl std::fmt::Display for ProvisionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

pub fn init_command(backend_config: &BTreeMap<String, String>) -> ProvisionCommand {
    backend_config.iter().fold(
        ProvisionCommand::new(&["init", "-input=false"]),
        |command, (key, value)| command.arg(format!("-backend-config={}={}", key, value)),
    )
}

pub fn workspace_list_command() -> ProvisionCommand {
    ProvisionCommand::new(&["workspace", "list"])
}

pub fn workspace_select_command(name: &str) -> ProvisionCommand {
    ProvisionCommand::new(&["workspace", "select", name])
}

pub fn workspace_new_command(name: &str) -> ProvisionCommand {
    ProvisionCommand::new(&["workspace", "new", name])
}

/// Plan and follow-up command for a provisioning run.
///
/// Deploy saves the plan to the shared volume and applies exactly that plan,
/// so the apply takes no var-files. Destroy plans and destroys with the same
/// var-files.
pub fn provision_commands(
    mode: ProvisionMode,
    var_files: &VarFiles,
) -> (ProvisionCommand, ProvisionCommand) {
    match mode {
        ProvisionMode::Deploy => (
            ProvisionCommand::new(&["plan", "-input=false"])
                .arg(format!("-out={}", provision::PLAN_FILE))
                .with_var_files(var_files),
            ProvisionCommand::new(&["apply", "-input=false", provision::PLAN_FILE]),
        ),
        ProvisionMode::Destroy => (
            ProvisionCommand::new(&["plan", "-destroy", "-input=false"]).with_var_files(var_files),
            ProvisionCommand::new(&["destroy", "-auto-approve", "-input=false"])
                .with_var_files(var_files),
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    Deploy,
    Destroy,
}
