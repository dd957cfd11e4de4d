//! Runtime configuration of the server.
//!
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// How scratch files of uploads are removed after classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Number of removal attempts, at least one is always made.
    pub attempts: u32,
    /// Delay before the second attempt, doubled for every following one.
    pub initial_backoff: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Capture device settings.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: String,
    /// Falls back to the maximum supported resolution.
    pub resolution: Option<(u32, u32)>,
    /// Frames per second, falls back to the maximum supported rate.
    pub frame_rate: Option<u32>,
    pub jpeg_quality: i32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            resolution: None,
            frame_rate: None,
            jpeg_quality: 85,
        }
    }
}

/// Detection model used to annotate live frames.
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub model: PathBuf,
    /// Downloaded into the cache directory if `model` does not exist.
    pub model_url: Option<String>,
    /// Class names, one per line.
    pub classes: Option<PathBuf>,
    pub input_size: u32,
    pub min_confidence: f32,
    pub max_iou: f32,
    /// TTF font used to label boxes. Boxes are drawn unlabeled without it.
    pub font: Option<PathBuf>,
    /// Keep serving un-annotated frames if the model cannot be loaded.
    pub optional: bool,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub uploads_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub cleanup: CleanupPolicy,
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
}

/// Parse a resolution given as `<width>x<height>`.
pub fn parse_resolution(s: &str) -> Result<(u32, u32), String> {
    let (width, height) = s
        .split_once(|c| c == 'x' || c == 'X')
        .ok_or_else(|| format!("expected <width>x<height>, got {s:?}"))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|e| format!("invalid width {width:?}: {e}"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|e| format!("invalid height {height:?}: {e}"))?;

    if width == 0 || height == 0 {
        return Err(format!("resolution must not be empty, got {s:?}"));
    }

    Ok((width, height))
}
