//! Project manifest (`stagehand.json` at the code root).
//!
//! ```json
//! {
//!   "team": "platform",
//!   "config":    { "image": "registry/config-aws:1", "params": { "account_prefix": "ops" } },
//!   "release":   { "image": "registry/release-lambda:3" },
//!   "terraform": { "image": "hashicorp/terraform:1.9" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stagehand_shared::{StagehandError, StagehandResult};
use std::path::Path;

pub const MANIFEST_FILE: &str = "stagehand.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub team: String,
    pub config: ConfigSection,
    pub release: ImageSection,
    pub terraform: ImageSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSection {
    pub image: String,
    /// Passed verbatim to the config unit as `Config`.
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSection {
    pub image: String,
}

impl Manifest {
    pub fn load(code_dir: &Path) -> StagehandResult<Self> {
        let path = code_dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            StagehandError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
            .map_err(|e| StagehandError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let manifest: Manifest = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), String> {
        if self.team.trim().is_empty() {
            return Err("team must not be empty".into());
        }
        for (section, image) in [
            ("config", &self.config.image),
            ("release", &self.release.image),
            ("terraform", &self.terraform.image),
        ] {
            if image.trim().is_empty() {
                return Err(format!("{}.image must not be empty", section));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "team": "platform",
        "config": { "image": "config:1", "params": { "account_prefix": "ops", "default_region": "eu-west-1" } },
        "release": { "image": "release:1" },
        "terraform": { "image": "terraform:1.9" }
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.team, "platform");
        assert_eq!(manifest.config.image, "config:1");
        assert_eq!(
            manifest.config.params.get("default_region"),
            Some(&Value::String("eu-west-1".into()))
        );
        assert_eq!(manifest.terraform.image, "terraform:1.9");
    }

    #[test]
    fn test_params_default_to_empty() {
        let manifest = Manifest::parse(
            r#"{"team":"t","config":{"image":"c"},"release":{"image":"r"},"terraform":{"image":"tf"}}"#,
        )
        .unwrap();
        assert!(manifest.config.params.is_empty());
    }

    #[test]
    fn test_empty_image_rejected() {
        let err = Manifest::parse(
            r#"{"team":"t","config":{"image":"c"},"release":{"image":" "},"terraform":{"image":"tf"}}"#,
        )
        .unwrap_err();
        assert_eq!(err, "release.image must not be empty");
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, StagehandError::Config(ref m) if m.contains(MANIFEST_FILE)));

        std::fs::write(dir.path().join(MANIFEST_FILE), SAMPLE).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap().team, "platform");
    }
}
