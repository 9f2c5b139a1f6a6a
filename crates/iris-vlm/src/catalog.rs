//! Model catalog: the launchable profiles and which one is active.

use std::path::{Path, PathBuf};

use serde::Serialize;

use iris_types::{IrisError, ModelProfileConfig, VlmConfig};

/// One entry in the `/models` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    /// Whether the weights exist on disk.
    pub present: bool,
    pub is_active: bool,
}

/// The set of configured model profiles plus the active selection.
pub struct ModelCatalog {
    root: PathBuf,
    profiles: std::collections::BTreeMap<String, ModelProfileConfig>,
    active: String,
}

impl ModelCatalog {
    /// Build from configuration. `root` anchors relative weight paths.
    pub fn new(config: &VlmConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            profiles: config.profiles.clone(),
            active: config.active_model.clone(),
        }
    }

    /// The active profile id.
    pub fn active(&self) -> &str {
        &self.active
    }

    /// The active profile's full configuration.
    pub fn active_profile(&self) -> Option<&ModelProfileConfig> {
        self.profiles.get(&self.active)
    }

    /// Resolve a profile path against the root directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// List every profile with presence and active flags.
    pub fn list(&self) -> Vec<ModelInfo> {
        self.profiles
            .iter()
            .map(|(id, profile)| ModelInfo {
                id: id.clone(),
                name: profile.display_name.clone(),
                present: self.resolve(&profile.model_file).exists(),
                is_active: *id == self.active,
            })
            .collect()
    }

    /// Validate and apply a new active selection.
    ///
    /// Refuses unknown ids, profiles marked unavailable, and profiles whose
    /// weights are missing from disk.
    pub fn set_active(&mut self, model_id: &str) -> Result<(), IrisError> {
        let profile = self
            .profiles
            .get(model_id)
            .ok_or_else(|| IrisError::Config(format!("unknown model profile {model_id:?}")))?;
        if !profile.available {
            return Err(IrisError::Config(format!(
                "model {model_id:?} is not available"
            )));
        }
        if !self.resolve(&profile.model_file).exists() {
            return Err(IrisError::Config(format!(
                "model file for {model_id:?} not found on disk"
            )));
        }
        self.active = model_id.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config_with(tmp: &Path, present: bool) -> VlmConfig {
        let model_file = tmp.join("model.gguf");
        if present {
            std::fs::write(&model_file, b"weights").unwrap();
        }
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "test-model".to_string(),
            ModelProfileConfig {
                display_name: "Test Model".into(),
                model_file: PathBuf::from("model.gguf"),
                mmproj_file: PathBuf::from("mmproj.gguf"),
                context_size: 4096,
                gpu_layers: 20,
                available: true,
            },
        );
        profiles.insert(
            "unavailable".to_string(),
            ModelProfileConfig {
                display_name: "Coming Soon".into(),
                model_file: PathBuf::from("nope.gguf"),
                mmproj_file: PathBuf::from("nope-mmproj.gguf"),
                context_size: 4096,
                gpu_layers: 20,
                available: false,
            },
        );
        VlmConfig {
            active_model: "test-model".into(),
            profiles,
            ..VlmConfig::default()
        }
    }

    #[test]
    fn list_reports_presence_and_active() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = ModelCatalog::new(&config_with(tmp.path(), true), tmp.path());
        let models = catalog.list();
        assert_eq!(models.len(), 2);

        let active = models.iter().find(|m| m.id == "test-model").unwrap();
        assert!(active.present);
        assert!(active.is_active);

        let other = models.iter().find(|m| m.id == "unavailable").unwrap();
        assert!(!other.present);
        assert!(!other.is_active);
    }

    #[test]
    fn set_active_rejects_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let mut catalog = ModelCatalog::new(&config_with(tmp.path(), true), tmp.path());
        assert!(catalog.set_active("ghost").is_err());
        assert_eq!(catalog.active(), "test-model");
    }

    #[test]
    fn set_active_rejects_unavailable_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut catalog = ModelCatalog::new(&config_with(tmp.path(), false), tmp.path());
        assert!(catalog.set_active("unavailable").is_err());
        // Weights missing on disk.
        assert!(catalog.set_active("test-model").is_err());
    }

    #[test]
    fn absolute_paths_bypass_root() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = ModelCatalog::new(&config_with(tmp.path(), true), tmp.path());
        let abs = PathBuf::from("/opt/models/x.gguf");
        assert_eq!(catalog.resolve(&abs), abs);
    }
}
