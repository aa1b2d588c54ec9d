//! Hand-written fakes for workflow tests.

use crate::capture::{LatestFrame, RawFrame, VideoFeed};
use crate::decoder::{BarcodeDecoder, DecodeEvent, DeviceError, ScanSettings};
use crate::notify::{NotificationLevel, Notifier};
use crate::store::{NewProduct, ProductStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

pub fn test_frame(width: u32, height: u32) -> RawFrame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x * 3 % 256) as u8, (y * 5 % 256) as u8, 64]);
        }
    }
    RawFrame {
        data: Bytes::from(data),
        width,
        height,
        sequence: 1,
        captured_at: Instant::now(),
    }
}

/// Keeps every notification in order.
#[derive(Default)]
pub struct RecordingNotifier {
    entries: Mutex<Vec<(NotificationLevel, String)>>,
}

impl RecordingNotifier {
    pub fn entries(&self) -> Vec<(NotificationLevel, String)> {
        self.entries.lock().clone()
    }

    pub fn count(&self, level: NotificationLevel) -> usize {
        self.entries.lock().iter().filter(|(l, _)| *l == level).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        self.entries.lock().push((level, message.to_string()));
    }
}

/// Products table and bucket in memory, with a unique barcode constraint.
#[derive(Default)]
pub struct InMemoryStore {
    products: Mutex<Vec<NewProduct>>,
    uploads: Mutex<Vec<String>>,
    count_calls: AtomicUsize,
    count_gate: Mutex<Option<Arc<Notify>>>,
    pub fail_count: AtomicBool,
    pub fail_upload: AtomicBool,
    pub fail_insert: AtomicBool,
}

impl InMemoryStore {
    pub fn with_barcodes(barcodes: &[&str]) -> Self {
        let store = Self::default();
        store.products.lock().extend(barcodes.iter().map(|b| NewProduct {
            barcode: b.to_string(),
            name: "existing".to_string(),
            price: 1.0,
            image_url: None,
        }));
        store
    }

    pub fn products(&self) -> Vec<NewProduct> {
        self.products.lock().clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().clone()
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    /// Hold the next count query until the returned gate is notified.
    pub fn hold_next_count(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.count_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ProductStore for InMemoryStore {
    async fn count_by_barcode(&self, barcode: &str) -> Result<u64, StoreError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.count_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_count.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("connection refused".to_string()));
        }
        let count = self
            .products
            .lock()
            .iter()
            .filter(|p| p.barcode == barcode)
            .count();
        Ok(count as u64)
    }

    async fn upload_image(
        &self,
        key: &str,
        _data: Bytes,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 500,
                body: "storage unavailable".to_string(),
            });
        }
        self.uploads.lock().push(key.to_string());
        Ok(format!("https://store.test/storage/v1/object/public/product_images/{key}"))
    }

    async fn insert_product(&self, product: &NewProduct) -> Result<(), StoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 500,
                body: "insert failed".to_string(),
            });
        }
        let mut products = self.products.lock();
        if products.iter().any(|p| p.barcode == product.barcode) {
            return Err(StoreError::Conflict("duplicate key value".to_string()));
        }
        products.push(product.clone());
        Ok(())
    }
}

/// Decoder whose events are pushed by the test.
#[derive(Default)]
pub struct ScriptedDecoder {
    pub fail_start: bool,
    pub fail_stop: bool,
    running: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    sender: Mutex<Option<mpsc::Sender<DecodeEvent>>>,
}

impl ScriptedDecoder {
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub async fn emit(&self, event: DecodeEvent) {
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Close the event stream.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

#[async_trait]
impl BarcodeDecoder for ScriptedDecoder {
    async fn start(
        &self,
        settings: &ScanSettings,
    ) -> Result<mpsc::Receiver<DecodeEvent>, DeviceError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(DeviceError::StartFailed("camera permission denied".to_string()));
        }
        let (tx, rx) = mpsc::channel(settings.event_buffer.max(1));
        *self.sender.lock() = Some(tx);
        self.running.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(DeviceError::StopFailed("device busy".to_string()));
        }
        self.running.store(false, Ordering::SeqCst);
        self.close();
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Live feed that runs a one-shot hook the next time a frame is sampled.
#[derive(Default)]
pub struct HookFeed {
    pub frames: LatestFrame,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl HookFeed {
    pub fn on_next_sample(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl VideoFeed for HookFeed {
    fn current_frame(&self) -> Option<RawFrame> {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.frames.current_frame()
    }
}
