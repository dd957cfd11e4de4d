//! Waste classification web service.
//!
//! Uploaded images are classified by an ONNX classifier and a webcam feed is
//! streamed back as MJPEG with detection overlays.
use bytes::Bytes;

pub mod artifacts;
pub mod camera;
pub mod config;
pub mod endpoints;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod state;
pub mod stream;
pub mod upload;
pub mod utils;

/// Error type.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Content type of the live video response.
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Header preceding every JPEG in the live video stream.
pub const FRAME_PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Wrap an encoded JPEG into one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(&[FRAME_PART_HEADER, data, "\r\n".as_bytes()].concat())
}
