//! Scan session controller.
//!
//! Owns the decoding device lifecycle and the single [`ScanSession`]. Decode
//! events, operator actions and collaborator results all funnel through
//! here and become [`SessionEvent`]s. The session lock is only ever held for
//! a transition, never across an `.await`; the session status is what keeps
//! verification and submission single-flight.

use crate::decoder::{BarcodeDecoder, DecodeEvent, DeviceError, ScanSettings};
use crate::notify::{NotificationLevel, Notifier};
use crate::pipeline::{
    validate_draft, SubmissionPipeline, SubmitError, SubmitReceipt, ValidatedProduct,
};
use crate::session::{FormState, ScanSession, SessionError, SessionEvent, SessionStatus};
use crate::verifier::{BarcodeVerifier, Verdict};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Errors returned to operator actions.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// What happened to a single decode event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Dropped: empty text or the session was not scanning
    Ignored,
    New,
    Duplicate,
    /// The existence check failed; scanning resumed
    Unverified,
}

/// Everything the operator client renders.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub active_barcode: Option<String>,
    pub scanning: bool,
    pub form: FormState,
}

pub struct ScanController {
    decoder: Arc<dyn BarcodeDecoder>,
    verifier: BarcodeVerifier,
    pipeline: SubmissionPipeline,
    notifier: Arc<dyn Notifier>,
    session: Mutex<ScanSession>,
    settings: ScanSettings,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl ScanController {
    pub fn new(
        decoder: Arc<dyn BarcodeDecoder>,
        verifier: BarcodeVerifier,
        pipeline: SubmissionPipeline,
        notifier: Arc<dyn Notifier>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            decoder,
            verifier,
            pipeline,
            notifier,
            session: Mutex::new(ScanSession::new()),
            settings,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    /// Start the decoding device.
    ///
    /// Only the first call does anything; later calls return `Ok(None)`. A
    /// failed start is reported once and leaves the session idle.
    #[instrument(skip(self), fields(device = %self.settings.device))]
    pub async fn start(&self) -> Result<Option<mpsc::Receiver<DecodeEvent>>, DeviceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Decoder already started");
            return Ok(None);
        }

        match self.decoder.start(&self.settings).await {
            Ok(events) => {
                if let Err(e) = self.session.lock().apply(SessionEvent::DeviceStarted) {
                    warn!(error = %e, "Session was not idle when the decoder started");
                }
                info!("Scanning started");
                Ok(Some(events))
            }
            Err(e) => {
                error!(error = %e, "Failed to start decoder");
                self.notifier.notify(
                    NotificationLevel::Error,
                    &format!("Failed to start the camera: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Drain decode events until the device closes the stream.
    ///
    /// Events queued while a barcode was being checked are discarded, so a
    /// held symbol is verified once. A stream that closes without
    /// [`shutdown`](Self::shutdown) is reported to the operator.
    pub async fn run(&self, mut events: mpsc::Receiver<DecodeEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DecodeEvent::Decoded(text) => {
                    if self.on_decode(&text).await != DecodeOutcome::Ignored {
                        let mut discarded = 0usize;
                        while events.try_recv().is_ok() {
                            discarded += 1;
                        }
                        if discarded > 0 {
                            debug!(discarded, "Dropped decode events queued during check");
                        }
                    }
                }
                DecodeEvent::Failed(reason) => {
                    debug!(reason = %reason, "Decode failure ignored");
                }
            }
        }

        if self.stopping.load(Ordering::SeqCst) {
            info!("Decode event stream closed");
            return;
        }
        metrics::counter!("intake.device.lost").increment(1);
        error!("Decode event stream closed unexpectedly");
        self.notifier.notify(
            NotificationLevel::Error,
            "The camera stopped unexpectedly. Restart the station to resume scanning",
        );
    }

    /// Handle one decoded barcode.
    pub async fn on_decode(&self, text: &str) -> DecodeOutcome {
        if text.trim().is_empty() {
            return DecodeOutcome::Ignored;
        }

        {
            let mut session = self.session.lock();
            if session.status() != SessionStatus::Scanning {
                return DecodeOutcome::Ignored;
            }
            if session
                .apply(SessionEvent::DecodeAccepted(text.to_string()))
                .is_err()
            {
                return DecodeOutcome::Ignored;
            }
        }

        info!(barcode = %text, "Barcode decoded, checking");
        let result = self.verifier.verify(text).await;

        let (event, outcome) = match &result {
            Ok(Verdict::New) => (SessionEvent::VerifiedNew, DecodeOutcome::New),
            Ok(Verdict::Duplicate) => (SessionEvent::VerifiedDuplicate, DecodeOutcome::Duplicate),
            Err(_) => (SessionEvent::VerificationFailed, DecodeOutcome::Unverified),
        };
        if let Err(e) = self.session.lock().apply(event) {
            warn!(barcode = %text, error = %e, "Verification result dropped");
            return DecodeOutcome::Ignored;
        }

        match result {
            Ok(Verdict::New) => {
                metrics::counter!("intake.scans.accepted").increment(1);
                self.notifier.notify(
                    NotificationLevel::Success,
                    &format!("Barcode {text} scanned. Enter the product name and price"),
                );
            }
            Ok(Verdict::Duplicate) => {
                metrics::counter!("intake.scans.duplicate").increment(1);
                info!(barcode = %text, "Duplicate barcode rejected");
                self.notifier.notify(
                    NotificationLevel::Error,
                    &format!("Barcode {text} already exists"),
                );
            }
            Err(e) => {
                metrics::counter!("intake.scans.unverified").increment(1);
                error!(barcode = %text, error = %e, "Barcode verification failed");
                self.notifier.notify(
                    NotificationLevel::Error,
                    "Could not check the barcode, please scan again",
                );
            }
        }

        outcome
    }

    /// Replace the editable draft fields.
    pub fn update_draft(&self, name: String, price: String) -> Result<FormState, ControllerError> {
        let mut session = self.session.lock();
        session.apply(SessionEvent::DraftEdited { name, price })?;
        Ok(session.form_state())
    }

    /// Validate the draft, capture a photo and persist the product.
    ///
    /// Every outcome other than a refused transition ends in exactly one
    /// notification.
    pub async fn submit(&self) -> Result<SubmitReceipt, ControllerError> {
        let prepared = Self::prepare_submit(&mut self.session.lock());
        let (product, cycle) = match prepared {
            Ok(prepared) => prepared,
            Err(ControllerError::Submit(e)) => {
                self.notifier.notify(NotificationLevel::Error, &e.user_message());
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };

        let image = self.pipeline.capture().await;

        {
            let mut session = self.session.lock();
            let resumed = session.cycle() == cycle
                && session.apply(SessionEvent::FrameCaptured).is_ok();
            if !resumed {
                drop(session);
                info!(barcode = %product.barcode, "Submission abandoned after reset");
                self.notifier.notify(
                    NotificationLevel::Info,
                    &SubmitError::Abandoned.user_message(),
                );
                return Err(SubmitError::Abandoned.into());
            }
        }

        let name = product.name.clone();
        let result = self.pipeline.commit(product, image).await;

        let event = if result.is_ok() {
            SessionEvent::SubmitSucceeded
        } else {
            SessionEvent::SubmitFailed
        };
        if let Err(e) = self.session.lock().apply(event) {
            warn!(error = %e, "Submission result applied to a moved session");
        }

        match result {
            Ok(receipt) => {
                metrics::counter!("intake.submissions.succeeded").increment(1);
                self.notifier.notify(
                    NotificationLevel::Success,
                    &format!("{name} saved. Ready for the next barcode"),
                );
                Ok(receipt)
            }
            Err(e) => {
                metrics::counter!("intake.submissions.failed").increment(1);
                error!(error = %e, "Submission failed");
                self.notifier.notify(NotificationLevel::Error, &e.user_message());
                Err(e.into())
            }
        }
    }

    fn prepare_submit(
        session: &mut ScanSession,
    ) -> Result<(ValidatedProduct, u64), ControllerError> {
        let status = session.status();
        let draft = session
            .draft()
            .filter(|_| status == SessionStatus::AwaitingInput)
            .ok_or(SessionError::IllegalTransition {
                status,
                action: "submit",
            })?;

        let product = validate_draft(draft)?;
        session.apply(SessionEvent::SubmitRequested)?;
        Ok((product, session.cycle()))
    }

    /// Abandon the current draft and resume scanning. No-op while scanning.
    pub fn reset(&self) -> Result<SessionStatus, ControllerError> {
        let mut session = self.session.lock();
        let before = session.status();
        let status = session.apply(SessionEvent::Reset)?;
        if before != status {
            info!(from = %before, "Session reset");
        }
        Ok(status)
    }

    pub fn status(&self) -> SessionStatus {
        self.session.lock().status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.lock();
        SessionSnapshot {
            status: session.status(),
            active_barcode: session.active_barcode().map(str::to_string),
            scanning: self.decoder.is_scanning(),
            form: session.form_state(),
        }
    }

    /// Stop the device if it is running. Errors are logged, not returned.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if !self.decoder.is_scanning() {
            return;
        }
        match self.decoder.stop().await {
            Ok(()) => info!("Decoder stopped"),
            Err(e) => warn!(error = %e, "Failed to stop decoder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameCapturer;
    use crate::compression::ImageCompressor;
    use crate::config::{CaptureConfig, CompressionConfig, ScannerConfig};
    use crate::testing::{
        test_frame, HookFeed, InMemoryStore, RecordingNotifier, ScriptedDecoder,
    };

    struct Harness {
        controller: Arc<ScanController>,
        decoder: Arc<ScriptedDecoder>,
        store: Arc<InMemoryStore>,
        notifier: Arc<RecordingNotifier>,
        feed: Arc<HookFeed>,
    }

    fn harness_with(decoder: ScriptedDecoder, store: InMemoryStore) -> Harness {
        let decoder = Arc::new(decoder);
        let store = Arc::new(store);
        let notifier = Arc::new(RecordingNotifier::default());
        let feed = Arc::new(HookFeed::default());
        feed.frames.publish(test_frame(64, 48));

        let pipeline = SubmissionPipeline::new(
            FrameCapturer::new(feed.clone(), &CaptureConfig::default()),
            ImageCompressor::new(CompressionConfig::default()),
            store.clone(),
            notifier.clone(),
        );
        let controller = Arc::new(ScanController::new(
            decoder.clone(),
            BarcodeVerifier::new(store.clone()),
            pipeline,
            notifier.clone(),
            ScanSettings::from(&ScannerConfig::default()),
        ));

        Harness {
            controller,
            decoder,
            store,
            notifier,
            feed,
        }
    }

    async fn started(store: InMemoryStore) -> Harness {
        let h = harness_with(ScriptedDecoder::default(), store);
        h.controller.start().await.unwrap();
        assert_eq!(h.controller.status(), SessionStatus::Scanning);
        h
    }

    async fn awaiting(store: InMemoryStore, code: &str) -> Harness {
        let h = started(store).await;
        assert_eq!(h.controller.on_decode(code).await, DecodeOutcome::New);
        h
    }

    fn fill(h: &Harness, name: &str, price: &str) {
        h.controller
            .update_draft(name.to_string(), price.to_string())
            .unwrap();
    }

    #[tokio::test]
    async fn test_happy_path() {
        let h = started(InMemoryStore::default()).await;

        assert_eq!(
            h.controller.on_decode("8901030895565").await,
            DecodeOutcome::New
        );
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::AwaitingInput);
        assert_eq!(snapshot.active_barcode.as_deref(), Some("8901030895565"));
        assert!(!snapshot.form.disabled);

        fill(&h, "Coca-Cola", "10000");
        let receipt = h.controller.submit().await.unwrap();

        let products = h.store.products();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].barcode, "8901030895565");
        assert_eq!(products[0].name, "Coca-Cola");
        assert_eq!(products[0].price, 10000.0);
        assert_eq!(products[0].image_url, receipt.image_url);

        let uploads = h.store.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].starts_with("public/8901030895565-"));

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Scanning);
        assert_eq!(snapshot.active_barcode, None);
        assert!(snapshot.form.disabled);
        assert_eq!(h.notifier.count(NotificationLevel::Success), 2);
        assert_eq!(h.notifier.count(NotificationLevel::Error), 0);
    }

    #[tokio::test]
    async fn test_duplicate_barcode_rejected() {
        let h = started(InMemoryStore::with_barcodes(&["123"])).await;

        assert_eq!(h.controller.on_decode("123").await, DecodeOutcome::Duplicate);

        assert_eq!(h.controller.status(), SessionStatus::Scanning);
        assert!(h.controller.snapshot().active_barcode.is_none());
        assert_eq!(h.store.products().len(), 1);
        let entries = h.notifier.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, NotificationLevel::Error);
        assert!(entries[0].1.contains("already exists"));
    }

    #[tokio::test]
    async fn test_decodes_ignored_until_reset() {
        let h = awaiting(InMemoryStore::default(), "111").await;
        let calls = h.store.count_calls();

        assert_eq!(h.controller.on_decode("222").await, DecodeOutcome::Ignored);
        assert_eq!(h.controller.on_decode("111").await, DecodeOutcome::Ignored);
        assert_eq!(h.store.count_calls(), calls);
        assert_eq!(h.controller.snapshot().active_barcode.as_deref(), Some("111"));

        h.controller.reset().unwrap();
        assert_eq!(h.controller.on_decode("222").await, DecodeOutcome::New);
    }

    #[tokio::test]
    async fn test_empty_decode_ignored() {
        let h = started(InMemoryStore::default()).await;
        assert_eq!(h.controller.on_decode("   ").await, DecodeOutcome::Ignored);
        assert_eq!(h.store.count_calls(), 0);
    }

    #[tokio::test]
    async fn test_verification_failure_resumes_scanning() {
        let store = InMemoryStore::default();
        store.fail_count.store(true, Ordering::SeqCst);
        let h = started(store).await;

        assert_eq!(h.controller.on_decode("123").await, DecodeOutcome::Unverified);
        assert_eq!(h.controller.status(), SessionStatus::Scanning);
        assert_eq!(h.notifier.count(NotificationLevel::Error), 1);
    }

    #[tokio::test]
    async fn test_submit_without_photo() {
        let h = awaiting(InMemoryStore::default(), "555").await;
        h.feed.frames.clear();
        fill(&h, "Tea", "5");

        let receipt = h.controller.submit().await.unwrap();

        assert_eq!(receipt.image_url, None);
        assert!(h.store.uploads().is_empty());
        assert_eq!(h.store.products()[0].image_url, None);
        assert_eq!(h.notifier.count(NotificationLevel::Warning), 1);
        assert_eq!(h.controller.status(), SessionStatus::Scanning);
    }

    #[tokio::test]
    async fn test_insert_failure_keeps_draft() {
        let h = awaiting(InMemoryStore::default(), "777").await;
        fill(&h, "Milk", "12.5");
        h.store.fail_insert.store(true, Ordering::SeqCst);

        let result = h.controller.submit().await;

        assert!(matches!(
            result,
            Err(ControllerError::Submit(SubmitError::Insert { duplicate: false, .. }))
        ));
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, SessionStatus::AwaitingInput);
        assert_eq!(snapshot.form.product_name, "Milk");
        assert_eq!(snapshot.form.price, "12.5");
        assert_eq!(h.notifier.count(NotificationLevel::Error), 1);

        // The operator retries without rescanning
        h.store.fail_insert.store(false, Ordering::SeqCst);
        h.controller.submit().await.unwrap();
        assert_eq!(h.store.products().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_failure_skips_insert() {
        let h = awaiting(InMemoryStore::default(), "888").await;
        fill(&h, "Bread", "3");
        h.store.fail_upload.store(true, Ordering::SeqCst);

        let result = h.controller.submit().await;

        assert!(matches!(
            result,
            Err(ControllerError::Submit(SubmitError::Upload(_)))
        ));
        assert!(h.store.products().is_empty());
        assert_eq!(h.controller.status(), SessionStatus::AwaitingInput);
    }

    #[tokio::test]
    async fn test_invalid_draft_stays_awaiting_input() {
        let h = awaiting(InMemoryStore::default(), "999").await;
        fill(&h, "Soap", "-4");

        let result = h.controller.submit().await;

        assert!(matches!(
            result,
            Err(ControllerError::Submit(SubmitError::InvalidDraft(_)))
        ));
        assert_eq!(h.controller.status(), SessionStatus::AwaitingInput);
        assert!(h.store.products().is_empty());
        assert_eq!(h.notifier.count(NotificationLevel::Error), 1);
    }

    #[tokio::test]
    async fn test_submit_refused_while_scanning() {
        let h = started(InMemoryStore::default()).await;
        let result = h.controller.submit().await;
        assert!(matches!(result, Err(ControllerError::Session(_))));
        assert!(h.notifier.entries().is_empty());
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let h = awaiting(InMemoryStore::default(), "321").await;
        fill(&h, "Rice", "20");

        let status = tokio_test::assert_ok!(h.controller.reset());
        assert_eq!(status, SessionStatus::Scanning);
        let once = h.controller.snapshot();
        let status = tokio_test::assert_ok!(h.controller.reset());
        assert_eq!(status, SessionStatus::Scanning);
        let twice = h.controller.snapshot();

        assert_eq!(once.form, twice.form);
        assert_eq!(twice.active_barcode, None);
        assert_eq!(twice.form.product_name, "");
    }

    #[tokio::test]
    async fn test_reset_during_capture_abandons_submission() {
        let h = awaiting(InMemoryStore::default(), "4242").await;
        fill(&h, "Salt", "2");

        let controller = Arc::downgrade(&h.controller);
        h.feed.on_next_sample(move || {
            if let Some(controller) = controller.upgrade() {
                assert_eq!(controller.status(), SessionStatus::Capturing);
                controller.reset().unwrap();
            }
        });

        let result = h.controller.submit().await;

        assert!(matches!(
            result,
            Err(ControllerError::Submit(SubmitError::Abandoned))
        ));
        assert!(h.store.uploads().is_empty());
        assert!(h.store.products().is_empty());
        assert_eq!(h.controller.status(), SessionStatus::Scanning);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = harness_with(ScriptedDecoder::default(), InMemoryStore::default());

        assert!(h.controller.start().await.unwrap().is_some());
        assert!(h.controller.start().await.unwrap().is_none());
        assert_eq!(h.decoder.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_stays_idle() {
        let h = harness_with(ScriptedDecoder::failing_start(), InMemoryStore::default());

        tokio_test::assert_err!(h.controller.start().await);
        assert_eq!(h.controller.status(), SessionStatus::Idle);
        assert_eq!(h.notifier.count(NotificationLevel::Error), 1);

        // No retry
        assert!(h.controller.start().await.unwrap().is_none());
        assert_eq!(h.decoder.start_calls(), 1);
        assert_eq!(h.controller.on_decode("123").await, DecodeOutcome::Ignored);
        tokio_test::assert_err!(h.controller.reset());
    }

    #[tokio::test]
    async fn test_run_drains_events() {
        let h = harness_with(ScriptedDecoder::default(), InMemoryStore::default());
        let events = h.controller.start().await.unwrap().unwrap();

        let controller = h.controller.clone();
        let runner = tokio::spawn(async move { controller.run(events).await });

        h.decoder
            .emit(DecodeEvent::Failed("no symbol".to_string()))
            .await;
        h.decoder
            .emit(DecodeEvent::Decoded("8901030895565".to_string()))
            .await;
        h.decoder
            .emit(DecodeEvent::Decoded("8901030895565".to_string()))
            .await;
        h.decoder.close();
        runner.await.unwrap();

        assert_eq!(h.controller.status(), SessionStatus::AwaitingInput);
        assert_eq!(h.store.count_calls(), 1);
    }

    #[tokio::test]
    async fn test_held_duplicate_checked_once() {
        let store = InMemoryStore::with_barcodes(&["123"]);
        let gate = store.hold_next_count();
        let h = harness_with(ScriptedDecoder::default(), store);
        let events = h.controller.start().await.unwrap().unwrap();

        let controller = h.controller.clone();
        let runner = tokio::spawn(async move { controller.run(events).await });

        h.decoder.emit(DecodeEvent::Decoded("123".to_string())).await;
        while h.controller.status() != SessionStatus::Checking {
            tokio::task::yield_now().await;
        }
        for _ in 0..3 {
            h.decoder.emit(DecodeEvent::Decoded("123".to_string())).await;
        }
        gate.notify_one();
        h.decoder.close();
        runner.await.unwrap();

        assert_eq!(h.store.count_calls(), 1);
        let duplicates = h
            .notifier
            .entries()
            .iter()
            .filter(|(_, message)| message.contains("already exists"))
            .count();
        assert_eq!(duplicates, 1);
        assert_eq!(h.controller.status(), SessionStatus::Scanning);
    }

    #[tokio::test]
    async fn test_stream_closed_without_shutdown_notifies() {
        let h = harness_with(ScriptedDecoder::default(), InMemoryStore::default());
        let events = h.controller.start().await.unwrap().unwrap();

        let controller = h.controller.clone();
        let runner = tokio::spawn(async move { controller.run(events).await });
        h.decoder.close();
        runner.await.unwrap();

        let entries = h.notifier.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, NotificationLevel::Error);
        assert!(entries[0].1.contains("camera stopped"));
    }

    #[tokio::test]
    async fn test_stream_closed_by_shutdown_is_quiet() {
        let h = harness_with(ScriptedDecoder::default(), InMemoryStore::default());
        let events = h.controller.start().await.unwrap().unwrap();

        let controller = h.controller.clone();
        let runner = tokio::spawn(async move { controller.run(events).await });
        h.controller.shutdown().await;
        runner.await.unwrap();

        assert!(h.notifier.entries().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_decoder() {
        let h = started(InMemoryStore::default()).await;
        h.controller.shutdown().await;
        assert_eq!(h.decoder.stop_calls(), 1);

        // Already stopped
        h.controller.shutdown().await;
        assert_eq!(h.decoder.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_swallows_stop_error() {
        let h = harness_with(ScriptedDecoder::failing_stop(), InMemoryStore::default());
        h.controller.start().await.unwrap();

        h.controller.shutdown().await;
        assert_eq!(h.decoder.stop_calls(), 1);
    }
}
