//! Waste classification server binary.
//!
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::TimestampPrecision;
use waste_server::{
    config::{parse_resolution, CameraConfig, CleanupPolicy, DetectorConfig, ServerConfig},
    endpoints::router,
    meter::spawn_meter_logger,
    state::AppState,
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "127.0.0.1:5000")]
    server_address: String,

    /// Scratch directory for uploaded images
    #[clap(long, default_value = "uploads")]
    uploads_dir: PathBuf,

    /// Directory with the classifier manifest.json and model
    #[clap(long, default_value = "artifacts")]
    artifacts_dir: PathBuf,

    /// Maximum accepted upload size in MiB
    #[clap(long, default_value_t = 16)]
    max_upload_mb: usize,

    /// Attempts to delete an upload after classification
    #[clap(long, default_value_t = 5)]
    cleanup_attempts: u32,

    /// Delay before retrying a failed delete, doubled per attempt
    #[clap(long, default_value_t = 100)]
    cleanup_backoff_ms: u64,

    /// ONNX detection model used to annotate live video
    #[clap(long, default_value = "weights/detection.onnx")]
    detector_model: PathBuf,

    /// URL to download the detection model from if it does not exist
    #[clap(long)]
    detector_url: Option<String>,

    /// Class names of the detection model, one per line
    #[clap(long)]
    detector_classes: Option<PathBuf>,

    /// Square input size of the detection model
    #[clap(long, default_value_t = 640)]
    detector_input_size: u32,

    /// Minimum confidence of shown detections
    #[clap(long, default_value_t = 0.4)]
    min_confidence: f32,

    /// Maximum overlap of detections of the same class
    #[clap(long, default_value_t = 0.5)]
    max_iou: f32,

    /// Serve un-annotated live video if the detection model fails to load
    #[clap(long)]
    allow_missing_detector: bool,

    /// TTF font to label detections with
    #[clap(long)]
    font: Option<PathBuf>,

    /// Video device of the webcam
    #[clap(long, default_value = "/dev/video0")]
    camera_device: String,

    /// Capture resolution like 1280x720, the maximum supported if omitted
    #[clap(long, value_parser = parse_resolution)]
    resolution: Option<(u32, u32)>,

    /// Capture frames per second, the maximum supported if omitted
    #[clap(long, value_parser = clap::value_parser!(u32).range(1..))]
    frame_rate: Option<u32>,

    /// JPEG quality of streamed frames
    #[clap(long, default_value_t = 85, value_parser = clap::value_parser!(i32).range(1..=100))]
    jpeg_quality: i32,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let address: SocketAddr = self
            .server_address
            .parse()
            .with_context(|| format!("invalid server address {}", self.server_address))?;
        let max_upload_bytes = self
            .max_upload_mb
            .checked_mul(1024 * 1024)
            .with_context(|| {
                format!("upload limit of {} MiB is too large", self.max_upload_mb)
            })?;

        Ok(ServerConfig {
            address,
            uploads_dir: self.uploads_dir,
            artifacts_dir: self.artifacts_dir,
            max_upload_bytes,
            cleanup: CleanupPolicy {
                attempts: self.cleanup_attempts,
                initial_backoff: Duration::from_millis(self.cleanup_backoff_ms),
            },
            camera: CameraConfig {
                device: self.camera_device,
                resolution: self.resolution,
                frame_rate: self.frame_rate,
                jpeg_quality: self.jpeg_quality,
            },
            detector: DetectorConfig {
                model: self.detector_model,
                model_url: self.detector_url,
                classes: self.detector_classes,
                input_size: self.detector_input_size,
                min_confidence: self.min_confidence,
                max_iou: self.max_iou,
                font: self.font,
                optional: self.allow_missing_detector,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    // Load models and prepare scratch space before accepting requests
    let state = AppState::load(&config)
        .await
        .context("failed to initialize services")?;

    spawn_meter_logger();

    let app = router(state, config.max_upload_bytes);

    log::info!("Serving on http://{}", config.address);
    axum::Server::bind(&config.address)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
