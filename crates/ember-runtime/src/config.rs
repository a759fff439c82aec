//! Engine configuration.
//!
//! [`EngineConfig`] is built in code or loaded from JSON and merged into the
//! engine's ini settings when it starts.
//!
//! ```json
//! {
//!   "engine_binary_path": "/usr/lib/ember/libember.so",
//!   "ini_overrides": { "precision": "17", "max_execution_steps": "100000" },
//!   "include_paths": ["./scripts", "./vendor"],
//!   "convert": { "cycles": "reject", "sequences": true }
//! }
//! ```

use crate::error::{EmberError, EmberResult};
use ember_core::ConvertOptions;
use ember_interp::IniSettings;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options applied when an engine starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Location of the native runtime. Checked to exist when set.
    pub engine_binary_path: Option<PathBuf>,

    /// Ini settings, applied in order over the defaults.
    pub ini_overrides: IndexMap<String, String>,

    /// Directories searched by `include`/`require`, in order.
    pub include_paths: Vec<PathBuf>,

    /// Conversion options used by contexts of this engine.
    pub convert: ConvertOptions,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> EmberResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> EmberResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Set the native runtime location.
    pub fn engine_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_binary_path = Some(path.into());
        self
    }

    /// Add an ini override. A later value for the same key replaces the
    /// earlier one in place.
    pub fn ini(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ini_overrides.insert(key.into(), value.into());
        self
    }

    /// Append an include directory.
    pub fn include_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_paths.push(path.into());
        self
    }

    pub fn convert_options(mut self, options: ConvertOptions) -> Self {
        self.convert = options;
        self
    }

    /// Check the configuration without starting anything.
    pub fn validate(&self) -> EmberResult<()> {
        if let Some(path) = &self.engine_binary_path {
            if !path.exists() {
                return Err(EmberError::Config(format!(
                    "engine binary not found at {}",
                    path.display()
                )));
            }
        }
        if self.convert.max_depth == 0 {
            return Err(EmberError::Config("convert.max_depth must be at least 1".into()));
        }
        self.ini_settings().map(|_| ())
    }

    /// Default ini settings with the overrides applied.
    pub fn ini_settings(&self) -> EmberResult<IniSettings> {
        let mut ini = IniSettings::default();
        ini.apply(
            self.ini_overrides
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        )
        .map_err(|e| EmberError::Config(e.to_string()))?;
        Ok(ini)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::CyclePolicy;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.engine_binary_path.is_none());
        assert!(config.ini_overrides.is_empty());
        assert!(config.include_paths.is_empty());
        assert_eq!(config.convert, ConvertOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = EngineConfig::new()
            .ini("precision", "17")
            .ini("display_errors", "1")
            .ini("precision", "10")
            .include_path("lib")
            .include_path("vendor");

        let keys: Vec<_> = config.ini_overrides.keys().map(String::as_str).collect();
        assert_eq!(keys, ["precision", "display_errors"]);
        assert_eq!(config.include_paths, [PathBuf::from("lib"), PathBuf::from("vendor")]);

        let ini = config.ini_settings().unwrap();
        assert_eq!(ini.precision, 10);
        assert!(ini.display_errors);
    }

    #[test]
    fn test_from_json_str() {
        let config = EngineConfig::from_json_str(
            r#"{
                "ini_overrides": { "max_execution_steps": "500", "app.name": "demo" },
                "include_paths": ["scripts"],
                "convert": { "cycles": "reject" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.convert.cycles, CyclePolicy::Reject);
        assert_eq!(config.convert.max_depth, 512);

        let ini = config.ini_settings().unwrap();
        assert_eq!(ini.max_execution_steps, 500);
        assert_eq!(ini.get("app.name").as_deref(), Some("demo"));
    }

    #[test]
    fn test_invalid_ini_value() {
        let config = EngineConfig::new().ini("max_call_depth", "lots");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EmberError::Config(_)));
    }

    #[test]
    fn test_missing_binary_path() {
        let config = EngineConfig::new().engine_binary_path("/definitely/not/here/libember.so");
        assert!(matches!(config.validate(), Err(EmberError::Config(_))));

        let file = tempfile::NamedTempFile::new().unwrap();
        let config = EngineConfig::new().engine_binary_path(file.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.json");
        std::fs::write(&path, r#"{ "ini_overrides": { "precision": "5" } }"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.ini_settings().unwrap().precision, 5);

        let missing = EngineConfig::from_json_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(EmberError::Io(_))));
    }
}
