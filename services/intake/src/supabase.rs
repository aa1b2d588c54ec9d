//! Supabase-backed [`ProductStore`].
//!
//! Talks to the PostgREST (`/rest/v1`) and Storage (`/storage/v1`) HTTP APIs
//! of a Supabase project with the project's anonymous key.

use crate::config::SupabaseConfig;
use crate::store::{NewProduct, ProductStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, info, instrument};

/// HTTP client for one Supabase project.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    products_table: String,
    image_bucket: String,
}

impl SupabaseStore {
    /// Create a store client. Every request carries the access key.
    pub fn new(config: &SupabaseConfig) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.anon_key)
            .map_err(|e| StoreError::Transport(format!("invalid access key: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.anon_key))
            .map_err(|e| StoreError::Transport(format!("invalid access key: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let store = Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            products_table: config.products_table.clone(),
            image_bucket: config.image_bucket.clone(),
        };

        info!(
            url = %store.base_url,
            table = %store.products_table,
            bucket = %store.image_bucket,
            "Supabase store initialized"
        );

        Ok(store)
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.products_table)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.image_bucket, key
        )
    }

    /// Public URL of an object in the image bucket.
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.image_bucket, key
        )
    }

    /// Map non-2xx responses to [`StoreError`], keeping the body for
    /// debugging.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());

        if status == StatusCode::CONFLICT {
            return Err(StoreError::Conflict(body));
        }
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

/// Total from a PostgREST `Content-Range` header, e.g. `0-0/1` or `*/0`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[async_trait]
impl ProductStore for SupabaseStore {
    #[instrument(skip(self))]
    async fn count_by_barcode(&self, barcode: &str) -> Result<u64, StoreError> {
        let filter = format!("eq.{barcode}");

        let response = self
            .client
            .head(self.table_url())
            .query(&[("select", "barcode"), ("barcode", filter.as_str())])
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(transport)?;

        let response = Self::ensure_success(response).await?;

        let range = response
            .headers()
            .get(CONTENT_RANGE)
            .ok_or_else(|| StoreError::MalformedResponse("missing Content-Range".to_string()))?
            .to_str()
            .map_err(|e| StoreError::MalformedResponse(e.to_string()))?;

        let count = parse_content_range_total(range).ok_or_else(|| {
            StoreError::MalformedResponse(format!("unexpected Content-Range: {range}"))
        })?;

        debug!(count, "Barcode existence checked");
        Ok(count)
    }

    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload_image(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let response = self
            .client
            .post(self.object_url(key))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(data)
            .send()
            .await
            .map_err(transport)?;

        Self::ensure_success(response).await?;

        let url = self.public_url(key);
        info!(key = %key, url = %url, "Image uploaded");
        Ok(url)
    }

    #[instrument(skip(self, product), fields(barcode = %product.barcode))]
    async fn insert_product(&self, product: &NewProduct) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.table_url())
            .header("Prefer", "return=minimal")
            .json(&[product])
            .send()
            .await
            .map_err(transport)?;

        Self::ensure_success(response).await?;

        info!(barcode = %product.barcode, "Product inserted");
        Ok(())
    }
}
