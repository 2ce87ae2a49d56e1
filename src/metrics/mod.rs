mod types;

pub use types::{DistanceDisplay, MeasurementSample, CALCULATING_LABEL};

use chrono::Utc;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::time::Instant;

use crate::protocol::InboundMessage;

/// Frames handed to the channel since the last rate sample. Shared between
/// the frame pump (which records) and the session (which samples).
#[derive(Debug, Clone, Default)]
pub struct FrameCounter {
    count: Arc<AtomicU64>,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }
}

/// Derives frame rate and interprets detection results.
pub struct MetricsAggregator {
    counter: FrameCounter,
    last_sample: Instant,
    fps: u32,
}

impl MetricsAggregator {
    pub fn new(now: Instant) -> Self {
        Self {
            counter: FrameCounter::new(),
            last_sample: now,
            fps: 0,
        }
    }

    pub fn counter(&self) -> FrameCounter {
        self.counter.clone()
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Take a rate sample: frames since the previous sample divided by the
    /// elapsed seconds, rounded. The counter is reset every time, so an idle
    /// pump reads 0 after one sample.
    pub fn sample_fps(&mut self, now: Instant) -> u32 {
        let frames = self.counter.take();
        let elapsed = now.saturating_duration_since(self.last_sample).as_secs_f64();
        self.last_sample = now;
        self.fps = if elapsed > 0.0 {
            (frames as f64 / elapsed).round() as u32
        } else {
            0
        };
        self.fps
    }

    /// Turn a result into the new live sample. A message without a `faces`
    /// field produces nothing and the caller keeps its current sample; an
    /// explicitly empty list is a detection gap and reads as calculating.
    pub fn interpret(&self, message: &InboundMessage) -> Option<MeasurementSample> {
        message.faces.as_ref()?;
        let face = message.primary_face().cloned().unwrap_or_default();
        Some(MeasurementSample {
            distance: DistanceDisplay::from_reading(face.distance),
            face,
            received_at: Utc::now(),
        })
    }
}
