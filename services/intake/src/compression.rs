//! Upload-size compression for captured stills.
//!
//! Bounds an image to a longest-edge ceiling, then trades JPEG quality and
//! finally resolution until it fits the byte ceiling or the iteration budget
//! runs out. The last attempt is returned even if it is still above the
//! ceiling.

use crate::capture::CapturedImage;
use crate::config::CompressionConfig;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors while compressing an image.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Compression worker failed: {0}")]
    Worker(String),
}

/// Result of compression, ready for upload.
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub data: Bytes,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    /// JPEG quality of the final encode; `None` when the input was kept as is
    pub quality: Option<u8>,
}

/// Compresses images toward the configured size and dimension ceilings.
#[derive(Debug, Clone)]
pub struct ImageCompressor {
    config: CompressionConfig,
}

impl ImageCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress a captured still on the blocking pool.
    pub async fn compress(
        &self,
        image: CapturedImage,
    ) -> Result<CompressedImage, CompressionError> {
        let compressor = self.clone();
        tokio::task::spawn_blocking(move || compressor.compress_bytes(&image.data))
            .await
            .map_err(|e| CompressionError::Worker(e.to_string()))?
    }

    /// Compress an encoded image synchronously.
    pub fn compress_bytes(&self, data: &[u8]) -> Result<CompressedImage, CompressionError> {
        let mut img = image::load_from_memory(data).map_err(CompressionError::Decode)?;
        let (width, height) = img.dimensions();
        let max_dim = self.config.max_dimension;

        if width.max(height) <= max_dim && data.len() <= self.config.max_size_bytes {
            debug!(width, height, size_bytes = data.len(), "Image already within limits");
            return Ok(CompressedImage {
                data: Bytes::copy_from_slice(data),
                mime_type: "image/jpeg",
                width,
                height,
                quality: None,
            });
        }

        if width.max(height) > max_dim {
            // resize() keeps the aspect ratio inside the bounding box
            img = img.resize(max_dim, max_dim, FilterType::Triangle);
        }

        let mut quality = self.config.initial_quality;
        let mut encoded = encode_jpeg(&img, quality)?;
        let mut iterations = 1;

        while encoded.len() > self.config.max_size_bytes && iterations < self.config.max_iterations
        {
            if quality > self.config.min_quality {
                quality = quality
                    .saturating_sub(self.config.quality_step.max(1))
                    .max(self.config.min_quality);
            } else {
                let (w, h) = img.dimensions();
                let (nw, nh) = ((w * 9 / 10).max(1), (h * 9 / 10).max(1));
                if (nw, nh) == (w, h) {
                    break;
                }
                img = img.resize_exact(nw, nh, FilterType::Triangle);
            }

            encoded = encode_jpeg(&img, quality)?;
            iterations += 1;
        }

        let (out_w, out_h) = img.dimensions();
        if encoded.len() > self.config.max_size_bytes {
            warn!(
                size_bytes = encoded.len(),
                max_size_bytes = self.config.max_size_bytes,
                iterations,
                "Image still above size ceiling after compression"
            );
        } else {
            debug!(
                original_bytes = data.len(),
                size_bytes = encoded.len(),
                width = out_w,
                height = out_h,
                quality,
                iterations,
                "Image compressed"
            );
        }

        Ok(CompressedImage {
            data: Bytes::from(encoded),
            mime_type: "image/jpeg",
            width: out_w,
            height: out_h,
            quality: Some(quality),
        })
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, CompressionError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(CompressionError::Encode)?;
    Ok(out)
}
