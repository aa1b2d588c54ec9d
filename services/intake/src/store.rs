//! Persistence and object-storage capability consumed by the workflow.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("Request failed: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("Store returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The response could not be interpreted.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Row inserted into the products table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    pub barcode: String,
    pub name: String,
    pub price: f64,
    pub image_url: Option<String>,
}

/// The three operations the workflow needs from the data service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Number of products whose barcode equals `barcode` exactly.
    async fn count_by_barcode(&self, barcode: &str) -> Result<u64, StoreError>;

    /// Upload an object under `key` and return its public URL.
    async fn upload_image(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StoreError>;

    /// Insert one product row.
    async fn insert_product(&self, product: &NewProduct) -> Result<(), StoreError>;
}

/// Object key for a product photo.
///
/// Format: `public/{barcode}-{unix_millis}`. The timestamp keeps repeated
/// attempts on the same barcode from colliding.
pub fn image_object_key(barcode: &str, timestamp_millis: i64) -> String {
    format!(
        "public/{barcode}-{timestamp}",
        barcode = sanitize_path_component(barcode),
        timestamp = timestamp_millis
    )
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
