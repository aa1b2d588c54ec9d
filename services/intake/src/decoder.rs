//! Decoding device capability.
//!
//! The controller depends only on [`BarcodeDecoder`]; the camera-backed
//! implementation lives in `camera`, and tests drive the workflow with
//! scripted decode events.

use crate::config::ScannerConfig;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a decoding device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Decoder initialization failed: {0}")]
    Init(String),

    #[error("Camera start failed: {0}")]
    StartFailed(String),

    #[error("Decoder already running")]
    AlreadyRunning,

    #[error("Decoder stop failed: {0}")]
    StopFailed(String),
}

/// Output of the decoding device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// The decoder believes it read a barcode. It may repeat the same text
    /// many times while aimed at one code.
    Decoded(String),
    /// A frame could not be decoded or the device reported a problem.
    Failed(String),
}

/// Camera constraints and scan region requested from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    /// Camera device path; the rear-facing camera on the intake station
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Fixed-size scan box, centred in the frame
    pub scan_box_width: u32,
    pub scan_box_height: u32,
    pub event_buffer: usize,
}

impl From<&ScannerConfig> for ScanSettings {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            device: config.device.clone(),
            width: config.width,
            height: config.height,
            fps: config.fps,
            scan_box_width: config.scan_box_width,
            scan_box_height: config.scan_box_height,
            event_buffer: config.event_buffer,
        }
    }
}

impl ScanSettings {
    /// Pixels to crop on each side (left, right, top, bottom) so that only
    /// the scan box remains.
    pub fn scan_box_crop(&self) -> (u32, u32, u32, u32) {
        let box_w = self.scan_box_width.min(self.width);
        let box_h = self.scan_box_height.min(self.height);

        let horizontal = self.width - box_w;
        let vertical = self.height - box_h;

        let left = horizontal / 2;
        let top = vertical / 2;
        (left, horizontal - left, top, vertical - top)
    }
}

/// A device that samples a live camera feed and emits decoded text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BarcodeDecoder: Send + Sync {
    /// Start the camera and decoder, returning the stream of decode events.
    async fn start(&self, settings: &ScanSettings)
        -> Result<mpsc::Receiver<DecodeEvent>, DeviceError>;

    /// Stop the camera and decoder.
    async fn stop(&self) -> Result<(), DeviceError>;

    fn is_scanning(&self) -> bool;
}
