//! Services shared by all request handlers.
//!
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    artifacts::{load_class_names, Artifacts},
    camera::{CameraSource, V4l2Camera},
    config::{DetectorConfig, ServerConfig},
    nn::{Classifier, FrameAnnotator, PassThrough, WasteClassifier, YoloDetector},
    overlay::load_font,
    upload::UploadStore,
    utils::resolve_model,
};

/// Handler state, built once at startup and passed to handlers as an
/// `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadStore>,
    pub classifier: Arc<dyn Classifier>,
    pub camera: Arc<dyn CameraSource>,
    pub annotator: Arc<dyn FrameAnnotator>,
    pub jpeg_quality: i32,
}

impl AppState {
    /// Load all models and prepare the uploads directory.
    ///
    /// Fails if the classifier cannot be loaded. A broken detection model is
    /// tolerated only if it is configured as optional.
    pub async fn load(config: &ServerConfig) -> Result<Self> {
        let uploads = UploadStore::new(&config.uploads_dir, config.cleanup).with_context(|| {
            format!(
                "failed to create uploads directory {}",
                config.uploads_dir.display()
            )
        })?;

        let artifacts = Artifacts::load(&config.artifacts_dir)?;
        let classifier = WasteClassifier::new(&artifacts)?;

        let annotator: Arc<dyn FrameAnnotator> = match load_detector(&config.detector).await {
            Ok(detector) => Arc::new(detector),
            Err(e) if config.detector.optional => {
                log::warn!("Unable to load detection model, live video is not annotated: {e:#}");
                Arc::new(PassThrough)
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            uploads: Arc::new(uploads),
            classifier: Arc::new(classifier),
            camera: Arc::new(V4l2Camera::new(&config.camera)),
            annotator,
            jpeg_quality: config.camera.jpeg_quality,
        })
    }
}

async fn load_detector(config: &DetectorConfig) -> Result<YoloDetector> {
    let model_path = resolve_model(&config.model, config.model_url.as_deref()).await?;

    let labels = match &config.classes {
        Some(path) => load_class_names(path)?,
        None => Vec::new(),
    };

    let detector = YoloDetector::new(
        &model_path,
        config.input_size,
        config.min_confidence,
        config.max_iou,
    )?
    .with_labels(labels);

    match &config.font {
        Some(path) => Ok(detector.with_font(load_font(path)?)),
        None => Ok(detector),
    }
}
