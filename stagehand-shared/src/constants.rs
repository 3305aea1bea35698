//! Protocol constants.
//!
//! Centralized location for the container-side paths, unit name prefixes and
//! provisioning-tool conventions that every stage relies on.

/// Fixed container-side mount points.
pub mod mounts {
    /// Shared volume mount point. Every stage that touches pipeline state
    /// binds the shared volume here.
    pub const BUILD_DIR: &str = "/build";

    /// Source tree mount point (always read-only).
    pub const CODE_DIR: &str = "/code";
}

/// Files exchanged through the volume handoff.
pub mod handoff {
    /// Metadata file written by the release unit inside its own filesystem.
    pub const RELEASE_METADATA_PATH: &str = "/release-metadata.json";

    /// Name of the persisted release metadata inside the shared volume.
    pub const RELEASE_METADATA_FILE: &str = "release-metadata.json";

    /// Key wrapping the release metadata when persisted as a var-file.
    pub const RELEASE_METADATA_KEY: &str = "release";

    /// Backend override written into the staged infra directory.
    pub const BACKEND_OVERRIDE_FILE: &str = "backend_override.tf";

    /// Provider lock file carried over from the source tree when present.
    pub const TERRAFORM_LOCK_FILE: &str = ".terraform.lock.hcl";
}

/// Unit name prefixes (a random suffix is appended per unit).
pub mod names {
    pub const CONFIG: &str = "stagehand-config";
    pub const RELEASE: &str = "stagehand-release";
    pub const TERRAFORM: &str = "stagehand-terraform";
    pub const HANDOFF: &str = "stagehand-handoff";
}

/// Provisioning tool conventions.
pub mod provision {
    /// Binary invoked inside the provisioning unit.
    pub const TOOL: &str = "terraform";

    /// Host-side directory (relative to the code root) holding var-files.
    pub const CONFIG_DIR: &str = "config";

    /// Common var-file name inside `CONFIG_DIR`.
    pub const COMMON_CONFIG_FILE: &str = "common.json";

    /// Host-side directory (relative to the code root) holding the infra code.
    pub const INFRA_DIR: &str = "infra";

    /// Container-side copy of the infra code; provisioning commands run here.
    pub const WORK_DIR: &str = "/build/infra";

    /// Keeps the provisioning unit alive between exec sessions.
    pub const IDLE_ENTRYPOINT: &[&str] = &["/bin/sleep", "86400"];

    /// Saved plan file used between `plan` and `apply`.
    pub const PLAN_FILE: &str = "/build/plan";

    /// Grace period given to the provisioning unit on stop.
    pub const STOP_TIMEOUT_SECS: u64 = 10;
}

/// Exit status most units declare as success.
pub const DEFAULT_SUCCESS_EXIT_CODE: i64 = 0;
