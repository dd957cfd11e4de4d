//! Capture devices for the live video stream.
//!
use image::RgbImage;
use rscam::{Camera, Config};
use simple_error::simple_error;

use crate::{config::CameraConfig, Error};

/// Opens a fresh handle on a capture device for every live video connection.
pub trait CameraSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, Error>;
}

/// An opened capture device. Dropping it releases the device.
pub trait FrameSource {
    /// Capture the next frame, `None` once the device stops delivering.
    fn capture(&mut self) -> Option<RgbImage>;
}

/// V4L2 camera delivering MJPG frames.
pub struct V4l2Camera {
    device: String,
    resolution: Option<(u32, u32)>,
    frame_rate: Option<u32>,
}

impl V4l2Camera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            device: config.device.clone(),
            resolution: config.resolution,
            frame_rate: config.frame_rate,
        }
    }
}

impl CameraSource for V4l2Camera {
    fn open(&self) -> Result<Box<dyn FrameSource>, Error> {
        let frame_interval = self.frame_rate.map(|fps| (1, fps));
        let cam = start_camera(&self.device, "MJPG", self.resolution, frame_interval)?;

        Ok(Box::new(V4l2Frames {
            cam,
            device: self.device.clone(),
        }))
    }
}

struct V4l2Frames {
    cam: Camera,
    device: String,
}

impl FrameSource for V4l2Frames {
    fn capture(&mut self) -> Option<RgbImage> {
        let frame = match self.cam.capture() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Error capturing frame from {}: {e}", self.device);
                return None;
            }
        };

        match turbojpeg::decompress_image(&frame[..]) {
            Ok(image) => Some(image),
            Err(e) => {
                log::error!("Error decoding frame from {}: {e}", self.device);
                None
            }
        }
    }
}

impl Drop for V4l2Frames {
    fn drop(&mut self) {
        log::info!("Releasing camera {}", self.device);
    }
}

/// Open and start a video device on a Linux machine.
///
/// Resolution and frame interval default to the maximum the device supports
/// for the given format.
fn start_camera(
    device_name: &str,
    format: &str,
    resolution: Option<(u32, u32)>,
    frame_interval: Option<(u32, u32)>,
) -> Result<Camera, Error> {
    let mut cam = Camera::new(device_name)?;
    log_supported_formats(&cam, format);
    let format = format.as_bytes();

    let resolution = resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, format))?;

    let interval = frame_interval
        .map(Ok)
        .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

    cam.start(&Config {
        interval,
        resolution,
        format,
        ..Default::default()
    })?;

    log::info!(
        "Using camera {} at {}x{}, interval {}/{}",
        device_name,
        resolution.0,
        resolution.1,
        interval.0,
        interval.1
    );

    Ok(cam)
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => max_by_pixels(&resolutions),
        rscam::ResolutionInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(intervals) => shortest_interval(&intervals),
        rscam::IntervalInfo::Stepwise {
            min,
            max: _,
            step: _,
        } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

/// Resolution with the highest number of pixels.
fn max_by_pixels(resolutions: &[(u32, u32)]) -> Option<(u32, u32)> {
    resolutions
        .iter()
        .max_by_key(|(width, height)| u64::from(*width) * u64::from(*height))
        .copied()
}

/// Frame interval `(numerator, denominator)` in seconds with the highest rate.
fn shortest_interval(intervals: &[(u32, u32)]) -> Option<(u32, u32)> {
    intervals
        .iter()
        .filter(|(numerator, denominator)| *numerator > 0 && *denominator > 0)
        .max_by(|a, b| {
            let rate_a = a.1 as f64 / a.0 as f64;
            let rate_b = b.1 as f64 / b.0 as f64;
            rate_a.total_cmp(&rate_b)
        })
        .copied()
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(Result::ok).collect();
    log::debug!("Supported formats: {formats:?}, using format {format:?}");
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_max_resolution_by_pixel_count() {
        let resolutions = [(640, 480), (1280, 720), (1024, 768)];

        assert_eq!(max_by_pixels(&resolutions), Some((1280, 720)));
        assert_eq!(max_by_pixels(&[]), None);
    }

    #[test]
    fn test_shortest_interval() {
        let intervals = [(1, 15), (1, 30), (2, 25), (0, 60)];

        assert_eq!(shortest_interval(&intervals), Some((1, 30)));
        assert_eq!(shortest_interval(&[]), None);
    }

    #[test]
    fn test_missing_device_fails_to_open() {
        let camera = V4l2Camera::new(&CameraConfig {
            device: "/dev/waste_server-no-such-camera".into(),
            ..Default::default()
        });

        assert!(camera.open().is_err());
    }
}
