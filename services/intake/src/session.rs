//! Scan session state machine.
//!
//! The whole workflow is one tagged state. States that own an active barcode
//! carry the [`ProductDraft`] inside the variant, so "active barcode set" and
//! "form unlocked" cannot disagree. Every mutation goes through
//! [`ScanSession::apply`].

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Externally visible session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Decoding device not started yet
    Idle,
    /// Waiting for a decode event
    Scanning,
    /// Existence check in flight
    Checking,
    /// Barcode verified, form unlocked
    AwaitingInput,
    /// Still frame being taken from the camera
    Capturing,
    /// Compression, upload and insert in flight
    Submitting,
}

impl SessionStatus {
    /// Whether a collaborator call is in flight in this status.
    pub fn is_loading(self) -> bool {
        matches!(self, Self::Checking | Self::Capturing | Self::Submitting)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Checking => "checking",
            Self::AwaitingInput => "awaiting_input",
            Self::Capturing => "capturing",
            Self::Submitting => "submitting",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-progress form values for the active barcode.
///
/// The barcode is fixed when the draft is created; only name and price are
/// editable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductDraft {
    barcode: String,
    pub name: String,
    pub price: String,
}

impl ProductDraft {
    pub fn new(barcode: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            name: String::new(),
            price: String::new(),
        }
    }

    pub fn barcode(&self) -> &str {
        &self.barcode
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Idle,
    Scanning,
    Checking { candidate: String },
    AwaitingInput { draft: ProductDraft },
    Capturing { draft: ProductDraft },
    Submitting { draft: ProductDraft },
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DeviceStarted,
    DecodeAccepted(String),
    VerifiedNew,
    VerifiedDuplicate,
    VerificationFailed,
    DraftEdited { name: String, price: String },
    SubmitRequested,
    FrameCaptured,
    SubmitSucceeded,
    SubmitFailed,
    Reset,
}

impl SessionEvent {
    fn action(&self) -> &'static str {
        match self {
            Self::DeviceStarted => "start scanning",
            Self::DecodeAccepted(_) => "accept a barcode",
            Self::VerifiedNew | Self::VerifiedDuplicate | Self::VerificationFailed => {
                "record a verification result"
            }
            Self::DraftEdited { .. } => "edit the draft",
            Self::SubmitRequested => "submit",
            Self::FrameCaptured => "finish capturing",
            Self::SubmitSucceeded | Self::SubmitFailed => "record a submission result",
            Self::Reset => "reset",
        }
    }
}

/// Rejected transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Cannot {action} while {status}")]
    IllegalTransition {
        status: SessionStatus,
        action: &'static str,
    },
}

/// The single scan session of the service.
#[derive(Debug, Clone)]
pub struct ScanSession {
    state: SessionState,
    /// Incremented every time a draft is created or abandoned
    cycle: u64,
}

impl ScanSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            cycle: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Scanning => SessionStatus::Scanning,
            SessionState::Checking { .. } => SessionStatus::Checking,
            SessionState::AwaitingInput { .. } => SessionStatus::AwaitingInput,
            SessionState::Capturing { .. } => SessionStatus::Capturing,
            SessionState::Submitting { .. } => SessionStatus::Submitting,
        }
    }

    /// Current draft, present exactly when a barcode is active.
    pub fn draft(&self) -> Option<&ProductDraft> {
        match &self.state {
            SessionState::AwaitingInput { draft }
            | SessionState::Capturing { draft }
            | SessionState::Submitting { draft } => Some(draft),
            _ => None,
        }
    }

    pub fn active_barcode(&self) -> Option<&str> {
        self.draft().map(ProductDraft::barcode)
    }

    /// Identifies the current scan cycle; a stale flow compares it before
    /// applying its result.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Apply an event, returning the new status.
    ///
    /// On error the session is left untouched.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionStatus, SessionError> {
        let next = self.next_state(&event)?;

        let keeps_draft = matches!(
            next,
            SessionState::AwaitingInput { .. }
                | SessionState::Capturing { .. }
                | SessionState::Submitting { .. }
        );
        let leaves_cycle = self.draft().is_some() && !keeps_draft;
        let starts_cycle = matches!(event, SessionEvent::VerifiedNew);
        if leaves_cycle || starts_cycle {
            self.cycle += 1;
        }

        self.state = next;
        Ok(self.status())
    }

    fn next_state(&self, event: &SessionEvent) -> Result<SessionState, SessionError> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (&self.state, event) {
            (S::Idle, E::DeviceStarted) => S::Scanning,

            (S::Scanning, E::DecodeAccepted(code)) => S::Checking {
                candidate: code.clone(),
            },

            (S::Checking { candidate }, E::VerifiedNew) => S::AwaitingInput {
                draft: ProductDraft::new(candidate.clone()),
            },
            (S::Checking { .. }, E::VerifiedDuplicate | E::VerificationFailed) => S::Scanning,

            (S::AwaitingInput { draft }, E::DraftEdited { name, price }) => S::AwaitingInput {
                draft: ProductDraft {
                    barcode: draft.barcode.clone(),
                    name: name.clone(),
                    price: price.clone(),
                },
            },

            (S::AwaitingInput { draft }, E::SubmitRequested) => S::Capturing {
                draft: draft.clone(),
            },
            (S::Capturing { draft }, E::FrameCaptured) => S::Submitting {
                draft: draft.clone(),
            },
            (S::Submitting { .. }, E::SubmitSucceeded) => S::Scanning,
            (S::Capturing { draft } | S::Submitting { draft }, E::SubmitFailed) => {
                S::AwaitingInput {
                    draft: draft.clone(),
                }
            }

            (S::Scanning | S::AwaitingInput { .. } | S::Capturing { .. }, E::Reset) => S::Scanning,

            _ => {
                return Err(SessionError::IllegalTransition {
                    status: self.status(),
                    action: event.action(),
                })
            }
        };

        Ok(next)
    }

    /// Presentational view of the form.
    pub fn form_state(&self) -> FormState {
        let status = self.status();
        let draft = self.draft();

        FormState {
            barcode: draft.map(|d| d.barcode.clone()),
            product_name: draft.map(|d| d.name.clone()).unwrap_or_default(),
            price: draft.map(|d| d.price.clone()).unwrap_or_default(),
            disabled: status != SessionStatus::AwaitingInput,
            loading: status.is_loading(),
            loading_message: loading_message(status),
        }
    }
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Form fields and enablement flags as the client renders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormState {
    pub barcode: Option<String>,
    pub product_name: String,
    pub price: String,
    /// Mirrors `status != AwaitingInput`
    pub disabled: bool,
    pub loading: bool,
    pub loading_message: Option<&'static str>,
}

fn loading_message(status: SessionStatus) -> Option<&'static str> {
    match status {
        SessionStatus::Checking => Some("Checking barcode..."),
        SessionStatus::Capturing => Some("Capturing photo..."),
        SessionStatus::Submitting => Some("Uploading photo and saving product..."),
        _ => None,
    }
}
