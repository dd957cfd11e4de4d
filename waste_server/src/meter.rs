use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    classified_uploads: AtomicU64,
    failed_uploads: AtomicU64,
    streamed_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            classified_uploads: AtomicU64::new(0),
            failed_uploads: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_classified(&self) {
        self.classified_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_failed(&self) {
        self.failed_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_frame(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_classified(&self) -> u64 {
        self.classified_uploads.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_failed(&self) -> u64 {
        self.failed_uploads.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_frames(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(10));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let classified = METER.get_reset_classified();
            let failed = METER.get_reset_failed();
            let frames = METER.get_reset_frames();
            let elapsed = start.elapsed().as_secs_f32();
            let fps = frames as f32 / elapsed;

            if classified > 0 || failed > 0 {
                log::info!("Classified uploads: {classified} ok, {failed} failed");
            }
            if frames > 0 {
                log::info!("Streamed frames per second: {fps:.2}")
            }
        }
    })
}
