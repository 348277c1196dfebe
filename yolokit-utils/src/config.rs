use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Detection thresholds applied when filtering and suppressing candidates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionSettings {
    /// Minimum confidence for a candidate to survive decoding.
    pub conf_threshold: f32,
    /// IoU above which a lower-confidence box of the same class is suppressed.
    pub iou_threshold: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            iou_threshold: 0.45,
        }
    }
}

/// Persistent application settings consumed by the CLI front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Optional override for the ONNX model path.
    pub model_path: Option<String>,
    pub detection: DetectionSettings,
    /// Optional class-name override replacing the built-in vocabulary.
    pub class_names: Option<Vec<String>>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            detection: DetectionSettings::default(),
            class_names: None,
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))
    }

    /// Serialize settings to disk in pretty-printed JSON.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let settings = AppSettings::default();
        settings.save_to_path(file.path()).expect("save");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.detection, settings.detection);
        assert_eq!(loaded.model_path, settings.model_path);
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{ "detection": { "conf_threshold": 0.5 } }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.detection.conf_threshold, 0.5);
        assert_eq!(
            loaded.detection.iou_threshold,
            DetectionSettings::default().iou_threshold
        );
        assert!(loaded.class_names.is_none());
    }
}
