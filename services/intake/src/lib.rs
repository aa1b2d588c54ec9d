//! Sscan Intake Service
//!
//! Single-station product intake: scan a barcode, make sure it has never been
//! registered, collect a name and price from the operator, photograph the
//! product from the live camera feed and persist the record.
//!
//! ## Features
//!
//! - **Camera Scanning**: GStreamer V4L2 pipeline with a `zbar` decoder
//!   restricted to a centred scan box
//! - **Uniqueness Check**: one exact-match count query per accepted barcode
//! - **Synchronised Photo Capture**: the still is taken from the live feed at
//!   submit time, then compressed to an upload budget
//! - **Supabase Persistence**: object upload and row insert over the
//!   PostgREST and Storage HTTP APIs
//! - **Operator API**: session snapshot, draft editing, submit, reset and
//!   auto-dismissing notifications
//!
//! ## Architecture
//!
//! ```text
//!  Camera (V4L2)                              Supabase
//! ┌──────────────┐                           ┌──────────────┐
//! │ Camera       │── frames ──▶ LatestFrame  │ products     │
//! │ Scanner      │                  │        │ product_     │
//! └──────────────┘                  │        │   images     │
//!        │ decode events            │        └──────────────┘
//!        ▼                          │               ▲
//! ┌──────────────┐           ┌──────────────┐       │
//! │ Scan         │──────────▶│ Submission   │───────┤
//! │ Controller   │  submit   │ Pipeline     │       │
//! └──────────────┘           └──────────────┘       │
//!    │       ▲                                      │
//!    │       │               ┌──────────────┐       │
//!    │       └───────────────│ Barcode      │───────┘
//!    │                       │ Verifier     │
//!    ▼                       └──────────────┘
//! ┌──────────────┐
//! │ Operator     │
//! │ API          │
//! └──────────────┘
//! ```

pub mod api;
pub mod camera;
pub mod capture;
pub mod compression;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod notify;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod supabase;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;

pub use api::AppState;
pub use camera::CameraScanner;
pub use capture::{CapturedImage, FrameCapturer, LatestFrame};
pub use compression::ImageCompressor;
pub use config::Config;
pub use controller::{ControllerError, DecodeOutcome, ScanController, SessionSnapshot};
pub use decoder::{BarcodeDecoder, DecodeEvent, DeviceError, ScanSettings};
pub use notify::{NotificationBoard, NotificationLevel, Notifier};
pub use pipeline::{SubmissionPipeline, SubmitError, SubmitReceipt};
pub use session::{FormState, ProductDraft, ScanSession, SessionStatus};
pub use store::{NewProduct, ProductStore, StoreError};
pub use supabase::SupabaseStore;
pub use verifier::{BarcodeVerifier, Verdict, VerificationError};
