//! Barcode uniqueness check.

use crate::store::{ProductStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Outcome of a successful existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No product with this barcode exists yet.
    New,
    /// The barcode is already registered.
    Duplicate,
}

/// The existence query could not be answered. Never means "not found".
#[derive(Debug, Error)]
#[error("Barcode verification failed: {0}")]
pub struct VerificationError(#[from] pub StoreError);

/// Classifies decoded barcodes against the products table.
pub struct BarcodeVerifier {
    store: Arc<dyn ProductStore>,
}

impl BarcodeVerifier {
    pub fn new(store: Arc<dyn ProductStore>) -> Self {
        Self { store }
    }

    /// One count query keyed on exact string equality.
    #[instrument(skip(self))]
    pub async fn verify(&self, barcode: &str) -> Result<Verdict, VerificationError> {
        let count = self.store.count_by_barcode(barcode).await?;
        let verdict = if count > 0 {
            Verdict::Duplicate
        } else {
            Verdict::New
        };

        debug!(count, verdict = ?verdict, "Barcode verified");
        Ok(verdict)
    }
}
