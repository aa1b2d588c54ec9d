//! Camera-backed barcode decoder.
//!
//! Drives a V4L2 camera through a GStreamer pipeline. The feed is split in
//! two: one branch is cropped to the scan box and handed to the `zbar`
//! element, the other keeps the most recent full frame in a [`LatestFrame`]
//! slot for still capture.
//!
//! ```text
//! v4l2src ─► convert/scale/rate ─► tee ─┬─► videocrop ─► zbar ─► fakesink
//!                                       └─► appsink ─► LatestFrame
//! ```
//!
//! `zbar` reports symbols as `barcode` element messages on the bus; a
//! blocking watcher turns them into [`DecodeEvent`]s.

use crate::capture::{LatestFrame, RawFrame};
use crate::config::ScannerConfig;
use crate::decoder::{BarcodeDecoder, DecodeEvent, DeviceError, ScanSettings};
use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// GStreamer camera with a `zbar` decoder restricted to the scan box.
pub struct CameraScanner {
    frames: LatestFrame,
    start_timeout: Duration,
    pipeline: Mutex<Option<gst::Pipeline>>,
    running: Arc<AtomicBool>,
    frame_sequence: Arc<AtomicU64>,
}

impl CameraScanner {
    /// Create a scanner that publishes frames into `frames`.
    pub fn new(frames: LatestFrame, config: &ScannerConfig) -> Result<Self, DeviceError> {
        gst::init().map_err(|e| DeviceError::Init(e.to_string()))?;

        Ok(Self {
            frames,
            start_timeout: config.start_timeout(),
            pipeline: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            frame_sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    fn create_pipeline(&self, settings: &ScanSettings) -> Result<gst::Pipeline, DeviceError> {
        let description = pipeline_description(settings);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| DeviceError::StartFailed(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| DeviceError::StartFailed("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| DeviceError::StartFailed("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| DeviceError::StartFailed("Could not cast to AppSink".to_string()))?;

        self.configure_appsink(&appsink);
        Ok(pipeline)
    }

    /// Publish every rendered frame into the shared slot.
    fn configure_appsink(&self, appsink: &gst_app::AppSink) {
        let frames = self.frames.clone();
        let sequence = self.frame_sequence.clone();
        let running = self.running.clone();

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    if !running.load(Ordering::SeqCst) {
                        return Err(gst::FlowError::Eos);
                    }

                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info =
                        gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;

                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let stride = info.stride()[0].max(0) as usize;

                    match pack_rgb_rows(map.as_slice(), info.width(), info.height(), stride) {
                        Some(data) => frames.publish(RawFrame {
                            data,
                            width: info.width(),
                            height: info.height(),
                            sequence: sequence.fetch_add(1, Ordering::SeqCst),
                            captured_at: Instant::now(),
                        }),
                        None => debug!(
                            width = info.width(),
                            height = info.height(),
                            size = map.size(),
                            "Frame buffer shorter than expected, skipped"
                        ),
                    }

                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    /// Forward bus messages until the pipeline stops or the receiver is gone.
    fn spawn_bus_watch(&self, pipeline: &gst::Pipeline, events: mpsc::Sender<DecodeEvent>) {
        let Some(bus) = pipeline.bus() else {
            warn!("Pipeline has no bus, decode events unavailable");
            return;
        };
        let running = self.running.clone();

        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) && !events.is_closed() {
                let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                    continue;
                };

                match msg.view() {
                    gst::MessageView::Element(element) => {
                        let Some(s) = element.structure() else {
                            continue;
                        };
                        if !s.has_name("barcode") {
                            continue;
                        }
                        match s.get::<String>("symbol") {
                            Ok(symbol) => {
                                let symbology = s.get::<String>("type").unwrap_or_default();
                                debug!(symbol = %symbol, symbology = %symbology, "Symbol decoded");
                                forward(&events, DecodeEvent::Decoded(symbol));
                            }
                            Err(e) => {
                                forward(&events, DecodeEvent::Failed(e.to_string()));
                            }
                        }
                    }
                    gst::MessageView::Warning(w) => {
                        warn!(warning = %w.error(), "GStreamer warning");
                        forward(&events, DecodeEvent::Failed(w.error().to_string()));
                    }
                    gst::MessageView::Error(err) => {
                        error!(
                            error = %err.error(),
                            debug = ?err.debug(),
                            "GStreamer pipeline error"
                        );
                        forward(&events, DecodeEvent::Failed(err.error().to_string()));
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    gst::MessageView::Eos(_) => {
                        info!("Camera stream ended");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }
            }
            debug!("Bus watcher exiting");
        });
    }
}

/// Events are samples of a continuous feed; a full queue drops them.
fn forward(events: &mpsc::Sender<DecodeEvent>, event: DecodeEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        debug!(event = ?event, "Decode event dropped due to backpressure");
    }
}

/// Pipeline description for the given camera settings.
fn pipeline_description(settings: &ScanSettings) -> String {
    let (left, right, top, bottom) = settings.scan_box_crop();

    format!(
        "v4l2src device={device} \
         ! videoconvert ! videoscale ! videorate \
         ! video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 \
         ! tee name=t \
         t. ! queue leaky=downstream max-size-buffers=2 \
         ! videocrop left={left} right={right} top={top} bottom={bottom} \
         ! videoconvert ! zbar message=true ! fakesink sync=false \
         t. ! queue leaky=downstream max-size-buffers=2 \
         ! appsink name=sink emit-signals=true sync=false max-buffers=1 drop=true",
        device = settings.device,
        width = settings.width,
        height = settings.height,
        fps = settings.fps,
    )
}

/// Copy a possibly row-padded RGB buffer into tightly packed rows.
fn pack_rgb_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Option<Bytes> {
    let row = width as usize * 3;
    let rows = height as usize;
    if stride < row {
        return None;
    }

    if stride == row {
        return data.get(..row * rows).map(Bytes::copy_from_slice);
    }

    let mut packed = Vec::with_capacity(row * rows);
    for y in 0..rows {
        let start = y * stride;
        packed.extend_from_slice(data.get(start..start + row)?);
    }
    Some(Bytes::from(packed))
}

#[async_trait]
impl BarcodeDecoder for CameraScanner {
    #[instrument(skip(self, settings), fields(device = %settings.device))]
    async fn start(
        &self,
        settings: &ScanSettings,
    ) -> Result<mpsc::Receiver<DecodeEvent>, DeviceError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(DeviceError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(settings.event_buffer.max(1));
        let pipeline = self.create_pipeline(settings)?;
        self.running.store(true, Ordering::SeqCst);

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            self.running.store(false, Ordering::SeqCst);
            let _ = pipeline.set_state(gst::State::Null);
            return Err(DeviceError::StartFailed(e.to_string()));
        }

        let timeout = gst::ClockTime::from_mseconds(self.start_timeout.as_millis() as u64);
        let waiting = pipeline.clone();
        let waited = tokio::task::spawn_blocking(move || waiting.state(timeout)).await;
        let failure = match waited {
            Ok((Ok(_), _state, _pending)) => None,
            Ok((Err(_), _state, _pending)) => {
                Some("Timeout waiting for camera to start".to_string())
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            self.running.store(false, Ordering::SeqCst);
            let _ = pipeline.set_state(gst::State::Null);
            return Err(DeviceError::StartFailed(reason));
        }

        self.spawn_bus_watch(&pipeline, tx);
        *self.pipeline.lock() = Some(pipeline);

        info!(
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            "Camera started"
        );
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        info!("Stopping camera");
        self.running.store(false, Ordering::SeqCst);
        self.frames.clear();

        let pipeline = self.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| DeviceError::StopFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CameraScanner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pipeline) = self.pipeline.get_mut().take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}
