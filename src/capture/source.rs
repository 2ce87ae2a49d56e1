use std::{
    io::Cursor,
    path::Path,
    sync::Mutex,
};

use anyhow::{Context, Result};
use image::{codecs::jpeg::JpegEncoder, DynamicImage};

use crate::protocol::EncodedImage;

/// Produces a still snapshot of the current camera feed on demand.
///
/// Implementations must not block: when no frame is ready they return
/// `None` and the caller skips its turn.
pub trait FrameSource: Send + Sync + 'static {
    fn snapshot(&self) -> Option<EncodedImage>;
}

/// Single-slot holder for the freshest frame. A capture thread overwrites
/// it; readers always get the latest frame and nothing queues up.
#[derive(Default)]
pub struct LatestFrameSlot {
    slot: Mutex<Option<EncodedImage>>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame. An empty frame means the camera has nothing
    /// to show and clears the slot.
    pub fn publish(&self, frame: EncodedImage) {
        let next = (!frame.is_empty()).then_some(frame);
        match self.slot.lock() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Encode raw JPEG bytes and publish them.
    pub fn publish_jpeg(&self, jpeg: &[u8]) {
        self.publish(EncodedImage::from_jpeg_bytes(jpeg));
    }

    pub fn clear(&self) {
        match self.slot.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

impl FrameSource for LatestFrameSlot {
    fn snapshot(&self) -> Option<EncodedImage> {
        match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Serves one image file as every snapshot. Handy for headless runs where
/// no camera is attached.
pub struct StillImageSource {
    frame: EncodedImage,
}

impl StillImageSource {
    pub fn load(path: &Path, quality: u8) -> Result<Self> {
        let decoded = image::open(path)
            .with_context(|| format!("failed to open snapshot image {}", path.display()))?;
        Self::from_image(&decoded, quality)
    }

    pub fn from_image(image: &DynamicImage, quality: u8) -> Result<Self> {
        let jpeg = encode_jpeg(image, quality)?;
        Ok(Self {
            frame: EncodedImage::from_jpeg_bytes(&jpeg),
        })
    }
}

impl FrameSource for StillImageSource {
    fn snapshot(&self) -> Option<EncodedImage> {
        Some(self.frame.clone())
    }
}

/// JPEG-encode an image at `quality` (1-100).
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .context("failed to encode snapshot as JPEG")?;
    Ok(buffer.into_inner())
}
