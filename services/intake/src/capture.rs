//! Still capture from the live camera feed.
//!
//! The capturer never owns the camera. It samples whatever frame the decoding
//! device is currently rendering and encodes exactly that frame as a JPEG.

use crate::config::CaptureConfig;
use bytes::Bytes;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors while turning a frame into a still image.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Frame has no pixels ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("Frame buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A decoded frame from the live feed, tightly packed RGB24.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Frame sequence number
    pub sequence: u64,
    /// Timestamp when frame was received from the camera
    pub captured_at: Instant,
}

/// Source of the frame currently displayed by the camera.
pub trait VideoFeed: Send + Sync {
    fn current_frame(&self) -> Option<RawFrame>;
}

/// Shared slot holding the most recent frame of the feed.
#[derive(Debug, Clone, Default)]
pub struct LatestFrame {
    slot: Arc<RwLock<Option<RawFrame>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: RawFrame) {
        *self.slot.write() = Some(frame);
    }

    /// Forget the last frame, e.g. when the camera stops.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}

impl VideoFeed for LatestFrame {
    fn current_frame(&self) -> Option<RawFrame> {
        self.slot.read().clone()
    }
}

/// A freshly captured still, owned by one submission attempt.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub data: Bytes,
    pub file_name: String,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Grabs one still from the live feed.
pub struct FrameCapturer {
    feed: Arc<dyn VideoFeed>,
    quality: u8,
}

impl FrameCapturer {
    pub fn new(feed: Arc<dyn VideoFeed>, config: &CaptureConfig) -> Self {
        Self {
            feed,
            quality: config.jpeg_quality,
        }
    }

    /// Capture the currently displayed frame.
    ///
    /// `None` means no usable frame right now (camera not ready, buffer
    /// mismatch or encoder failure); the caller proceeds without a photo.
    pub async fn capture(&self) -> Option<CapturedImage> {
        let Some(frame) = self.feed.current_frame() else {
            warn!("No live frame available for capture");
            return None;
        };

        let quality = self.quality;
        match tokio::task::spawn_blocking(move || encode_frame(&frame, quality)).await {
            Ok(Ok(image)) => {
                debug!(
                    file_name = %image.file_name,
                    size_bytes = image.data.len(),
                    width = image.width,
                    height = image.height,
                    "Frame captured"
                );
                Some(image)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to encode captured frame");
                None
            }
            Err(e) => {
                error!(error = %e, "Capture worker failed");
                None
            }
        }
    }
}

/// Render one frame into a raster of the same size and encode it as JPEG.
fn encode_frame(frame: &RawFrame, quality: u8) -> Result<CapturedImage, CaptureError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(CaptureError::EmptyFrame {
            width: frame.width,
            height: frame.height,
        });
    }

    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.data.len() != expected {
        return Err(CaptureError::BufferSize {
            expected,
            actual: frame.data.len(),
        });
    }

    let raster = RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec()).ok_or(
        CaptureError::BufferSize {
            expected,
            actual: frame.data.len(),
        },
    )?;

    let mut encoded = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut encoded, quality).encode_image(&raster)?;

    Ok(CapturedImage {
        data: Bytes::from(encoded),
        file_name: format!("capture-{}.jpg", Utc::now().timestamp_millis()),
        mime_type: "image/jpeg",
        width: frame.width,
        height: frame.height,
    })
}
