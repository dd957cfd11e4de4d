//! Classification artifacts loaded at startup.
//!
//! The artifacts directory holds a `manifest.json` describing the classifier
//! model, its preprocessing and the class table:
//!
//! ```json
//! {
//!     "model": "classifier.onnx",
//!     "input_size": [224, 224],
//!     "classes": [
//!         {"label": "Plastic", "details": "Recyclable", "video1": "...", "video2": "..."}
//!     ]
//! }
//! ```
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use common::protocol::Classification;
use serde::Deserialize;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Channel means of MobileNet/ImageNet style classifiers.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Entry of the class table. Its position is the classifier output index.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClassInfo {
    pub label: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub video1: String,
    #[serde(default)]
    pub video2: String,
}

impl ClassInfo {
    pub fn to_classification(&self) -> Classification {
        Classification::new(&self.label, &self.details, &self.video1, &self.video2)
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    model: PathBuf,
    #[serde(default = "default_input_size")]
    input_size: [u32; 2],
    #[serde(default = "default_mean")]
    mean: [f32; 3],
    #[serde(default = "default_std")]
    std: [f32; 3],
    classes: Vec<ClassInfo>,
}

fn default_input_size() -> [u32; 2] {
    [224, 224]
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN
}

fn default_std() -> [f32; 3] {
    IMAGENET_STD
}

/// Everything needed to build the classifier.
#[derive(Clone, Debug)]
pub struct Artifacts {
    pub model_path: PathBuf,
    /// Width and height of the model input.
    pub input_size: (u32, u32),
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub classes: Vec<ClassInfo>,
}

impl Artifacts {
    /// Load the manifest from an artifacts directory.
    ///
    /// The model path is resolved relative to the directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;

        if manifest.classes.is_empty() {
            bail!("manifest {} has no classes", manifest_path.display());
        }
        let [width, height] = manifest.input_size;
        if width == 0 || height == 0 {
            bail!("manifest {} has an empty input size", manifest_path.display());
        }
        if manifest.std.iter().any(|s| *s == 0.0) {
            bail!("manifest {} has a zero std", manifest_path.display());
        }

        log::info!(
            "Loaded {} classes from {}",
            manifest.classes.len(),
            manifest_path.display()
        );

        Ok(Self {
            model_path: dir.join(manifest.model),
            input_size: (width, height),
            mean: manifest.mean,
            std: manifest.std,
            classes: manifest.classes,
        })
    }
}

/// Read class names of the detection model, one per line.
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read class names {}", path.display()))?;

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    fn artifacts_dir(name: &str, manifest: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "waste_server-artifacts-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        dir
    }

    #[test]
    fn test_load_manifest_with_defaults() -> Result<()> {
        let dir = artifacts_dir(
            "defaults",
            r#"{
                "model": "classifier.onnx",
                "classes": [
                    {"label": "Organic", "details": "Compost it", "video1": "v1", "video2": "v2"},
                    {"label": "Metal"}
                ]
            }"#,
        );

        let artifacts = Artifacts::load(&dir)?;

        assert_eq!(artifacts.model_path, dir.join("classifier.onnx"));
        assert_eq!(artifacts.input_size, (224, 224));
        assert_eq!(artifacts.mean, IMAGENET_MEAN);
        assert_eq!(artifacts.classes.len(), 2);
        assert_eq!(
            artifacts.classes[0].to_classification(),
            Classification::new("Organic", "Compost it", "v1", "v2")
        );
        assert_eq!(artifacts.classes[1].details, "");

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_reject_manifest_without_classes() {
        let dir = artifacts_dir("empty", r#"{"model": "m.onnx", "classes": []}"#);

        assert!(Artifacts::load(&dir).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_manifest_is_an_error() {
        let dir = std::env::temp_dir().join("waste_server-artifacts-does-not-exist");

        let err = Artifacts::load(&dir).unwrap_err();
        assert!(err.to_string().contains(MANIFEST_FILE));
    }

    #[test]
    fn test_load_class_names_skips_blank_lines() -> Result<()> {
        let dir = artifacts_dir("names", "{}");
        let path = dir.join("classes.txt");
        std::fs::write(&path, "bottle\n\n  can \ncardboard\n")?;

        assert_eq!(load_class_names(&path)?, ["bottle", "can", "cardboard"]);

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
