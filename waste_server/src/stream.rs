//! Live video frame stream.
//!
//! Every connection gets its own producer on the blocking pool which owns the
//! capture device. Frames are handed to the HTTP body through a small bounded
//! channel, so the producer runs at the pace of the client. Once the client
//! goes away the channel closes, the producer stops and the device is released.
use std::sync::Arc;

use bytes::Bytes;
use image::RgbImage;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{as_jpeg_stream_item, camera::CameraSource, nn::FrameAnnotator};

/// Encoded frames buffered per connection.
const FRAME_BUFFER: usize = 2;

/// Why a frame loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEnd {
    OpenFailed,
    CaptureFailed,
    EncodeFailed,
    Disconnected,
}

/// Start producing annotated frames as `multipart/x-mixed-replace` parts.
///
/// The returned stream ends when the device cannot be opened or stops
/// delivering frames, or when a frame cannot be encoded.
pub fn spawn_frame_stream(
    camera: Arc<dyn CameraSource>,
    annotator: Arc<dyn FrameAnnotator>,
    jpeg_quality: i32,
) -> ReceiverStream<Bytes> {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);

    tokio::task::spawn_blocking(move || {
        let end = run_frame_loop(camera.as_ref(), annotator.as_ref(), jpeg_quality, &tx);
        log::info!("Frame stream ended: {end:?}");
    });

    ReceiverStream::new(rx)
}

/// Capture, annotate, encode and send frames until something fails.
///
/// Must run outside of the async runtime since sending blocks.
pub fn run_frame_loop(
    camera: &dyn CameraSource,
    annotator: &dyn FrameAnnotator,
    jpeg_quality: i32,
    tx: &mpsc::Sender<Bytes>,
) -> StreamEnd {
    let mut source = match camera.open() {
        Ok(source) => source,
        Err(e) => {
            log::error!("Could not open camera: {e}");
            return StreamEnd::OpenFailed;
        }
    };

    loop {
        let mut frame = match source.capture() {
            Some(frame) => frame,
            None => return StreamEnd::CaptureFailed,
        };

        annotator.annotate(&mut frame);

        let jpeg = match encode_jpeg(&frame, jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                log::warn!("Error encoding frame: {e}");
                return StreamEnd::EncodeFailed;
            }
        };

        if tx.blocking_send(as_jpeg_stream_item(&jpeg)).is_err() {
            log::debug!("Live video client disconnected");
            return StreamEnd::Disconnected;
        }
    }
}

fn encode_jpeg(frame: &RgbImage, quality: i32) -> Result<Vec<u8>, turbojpeg::Error> {
    let buf = turbojpeg::compress_image(frame, quality, turbojpeg::Subsamp::Sub2x2)?;
    Ok(buf.to_vec())
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    use image::Rgb;
    use simple_error::simple_error;

    use super::*;
    use crate::{camera::FrameSource, nn::PassThrough, Error, FRAME_PART_HEADER};

    struct FakeCamera {
        frames: usize,
        fail_open: bool,
        released: Arc<AtomicBool>,
    }

    struct FakeFrames {
        remaining: usize,
        released: Arc<AtomicBool>,
    }

    impl CameraSource for FakeCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>, Error> {
            if self.fail_open {
                return Err(simple_error!("device busy").into());
            }
            Ok(Box::new(FakeFrames {
                remaining: self.frames,
                released: self.released.clone(),
            }))
        }
    }

    impl FrameSource for FakeFrames {
        fn capture(&mut self) -> Option<RgbImage> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(RgbImage::from_pixel(32, 24, Rgb([40, 120, 40])))
        }
    }

    impl Drop for FakeFrames {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn fake_camera(frames: usize, fail_open: bool) -> (FakeCamera, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let camera = FakeCamera {
            frames,
            fail_open,
            released: released.clone(),
        };
        (camera, released)
    }

    #[derive(Default)]
    struct CountingAnnotator {
        calls: AtomicUsize,
        last_size: Mutex<Option<(u32, u32)>>,
    }

    impl FrameAnnotator for CountingAnnotator {
        fn annotate(&self, frame: &mut RgbImage) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_size.lock().unwrap() = Some(frame.dimensions());
        }
    }

    #[test]
    fn test_frames_until_capture_fails() {
        let (camera, released) = fake_camera(3, false);
        let annotator = CountingAnnotator::default();
        let (tx, mut rx) = mpsc::channel(8);

        let end = run_frame_loop(&camera, &annotator, 80, &tx);

        assert_eq!(end, StreamEnd::CaptureFailed);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(annotator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*annotator.last_size.lock().unwrap(), Some((32, 24)));

        let mut chunks = 0;
        while let Ok(chunk) = rx.try_recv() {
            assert!(chunk.starts_with(FRAME_PART_HEADER));
            // JPEG start and end of image markers around the payload
            let payload = &chunk[FRAME_PART_HEADER.len()..chunk.len() - 2];
            assert_eq!(&payload[..2], &[0xff_u8, 0xd8]);
            assert_eq!(&payload[payload.len() - 2..], &[0xff_u8, 0xd9]);
            chunks += 1;
        }
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_open_failure_ends_without_frames() {
        let (camera, _released) = fake_camera(3, true);
        let (tx, mut rx) = mpsc::channel(8);

        let end = run_frame_loop(&camera, &PassThrough, 80, &tx);

        assert_eq!(end, StreamEnd::OpenFailed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_releases_device() {
        let (camera, released) = fake_camera(usize::MAX, false);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let end = run_frame_loop(&camera, &PassThrough, 80, &tx);

        assert_eq!(end, StreamEnd::Disconnected);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_spawned_stream_yields_parts() {
        use futures::StreamExt;

        let (camera, released) = fake_camera(2, false);

        let chunks: Vec<Bytes> = spawn_frame_stream(Arc::new(camera), Arc::new(PassThrough), 80)
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.starts_with(FRAME_PART_HEADER)));
        assert!(released.load(Ordering::SeqCst));
    }
}
