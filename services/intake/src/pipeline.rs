//! Submission pipeline: capture, compress, upload, insert.
//!
//! The pipeline is split at the capture boundary so the controller can
//! re-check the session between taking the photo and touching the store:
//!
//! ```text
//! validate_draft ──► capture ──(session check)──► commit
//!                                                  ├─ compress
//!                                                  ├─ upload
//!                                                  └─ insert   (commit point)
//! ```
//!
//! Steps never run concurrently. A failure aborts the remaining steps; an
//! image that was uploaded but never referenced by a row is left in place.

use crate::capture::{CapturedImage, FrameCapturer};
use crate::compression::{CompressionError, ImageCompressor};
use crate::notify::{NotificationLevel, Notifier};
use crate::session::ProductDraft;
use crate::store::{image_object_key, NewProduct, ProductStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Reasons a submission did not persist a product.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid product: {0}")]
    InvalidDraft(String),

    #[error("Image compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Image upload failed: {0}")]
    Upload(#[source] StoreError),

    #[error("Product insert failed: {source}")]
    Insert {
        #[source]
        source: StoreError,
        /// Rejected by the unique constraint on the barcode
        duplicate: bool,
    },

    #[error("Submission abandoned because the session was reset")]
    Abandoned,
}

impl SubmitError {
    /// Short operator-facing message.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidDraft(reason) => reason.clone(),
            Self::Compression(_) => "Could not process the photo".to_string(),
            Self::Upload(_) => "Could not upload the photo".to_string(),
            Self::Insert {
                duplicate: true, ..
            } => "Barcode already exists".to_string(),
            Self::Insert { .. } => "Could not save the product".to_string(),
            Self::Abandoned => "Submission cancelled".to_string(),
        }
    }
}

/// A draft that passed submit-time validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedProduct {
    pub barcode: String,
    pub name: String,
    pub price: f64,
}

/// What a successful submission persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub barcode: String,
    pub image_url: Option<String>,
}

/// Re-assert the form rules: every field present, price a finite number ≥ 0.
pub fn validate_draft(draft: &ProductDraft) -> Result<ValidatedProduct, SubmitError> {
    let barcode = draft.barcode().trim();
    let name = draft.name.trim();
    let price = draft.price.trim();

    if barcode.is_empty() || name.is_empty() || price.is_empty() {
        return Err(SubmitError::InvalidDraft(
            "Barcode, product name and price are required".to_string(),
        ));
    }

    let price: f64 = price
        .parse()
        .map_err(|_| SubmitError::InvalidDraft(format!("Price is not a number: {price}")))?;
    if !price.is_finite() || price < 0.0 {
        return Err(SubmitError::InvalidDraft(
            "Price must be zero or more".to_string(),
        ));
    }

    Ok(ValidatedProduct {
        // The barcode is the verified key; only surrounding form noise is trimmed
        barcode: draft.barcode().to_string(),
        name: name.to_string(),
        price,
    })
}

/// Runs the ordered submission steps against the injected collaborators.
pub struct SubmissionPipeline {
    capturer: FrameCapturer,
    compressor: ImageCompressor,
    store: Arc<dyn ProductStore>,
    notifier: Arc<dyn Notifier>,
}

impl SubmissionPipeline {
    pub fn new(
        capturer: FrameCapturer,
        compressor: ImageCompressor,
        store: Arc<dyn ProductStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            capturer,
            compressor,
            store,
            notifier,
        }
    }

    /// Step 1. A missing photo is a warning, not a failure.
    pub async fn capture(&self) -> Option<CapturedImage> {
        let image = self.capturer.capture().await;
        if image.is_none() {
            self.notifier.notify(
                NotificationLevel::Warning,
                "No photo captured, saving product without image",
            );
        }
        image
    }

    /// Steps 2-4. The insert is the commit point.
    #[instrument(
        skip(self, product, image),
        fields(barcode = %product.barcode, has_image = image.is_some())
    )]
    pub async fn commit(
        &self,
        product: ValidatedProduct,
        image: Option<CapturedImage>,
    ) -> Result<SubmitReceipt, SubmitError> {
        let image_url = match image {
            Some(image) => Some(self.upload(&product.barcode, image).await?),
            None => None,
        };

        let row = NewProduct {
            barcode: product.barcode.clone(),
            name: product.name,
            price: product.price,
            image_url: image_url.clone(),
        };

        self.store.insert_product(&row).await.map_err(|e| {
            let duplicate = matches!(e, StoreError::Conflict(_));
            SubmitError::Insert {
                source: e,
                duplicate,
            }
        })?;

        info!(barcode = %row.barcode, image_url = ?image_url, "Product submitted");

        Ok(SubmitReceipt {
            barcode: row.barcode,
            image_url,
        })
    }

    async fn upload(&self, barcode: &str, image: CapturedImage) -> Result<String, SubmitError> {
        let compressed = self.compressor.compress(image).await?;
        let key = image_object_key(barcode, Utc::now().timestamp_millis());
        let size = compressed.data.len();

        let start = Instant::now();
        let url = self
            .store
            .upload_image(&key, compressed.data, compressed.mime_type)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Image upload failed");
                SubmitError::Upload(e)
            })?;

        metrics::histogram!("intake.upload.duration_seconds")
            .record(start.elapsed().as_secs_f64());
        metrics::counter!("intake.bytes.uploaded").increment(size as u64);

        Ok(url)
    }
}
