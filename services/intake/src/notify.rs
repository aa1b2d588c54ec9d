//! Operator notifications.
//!
//! Notifications are fire-and-forget: callers never wait on them and get
//! nothing back. The board keeps each one for a fixed display duration so the
//! client can poll and render them as toasts.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// A single user-visible signal.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub level: NotificationLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Sink for user-visible signals.
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotificationLevel, message: &str);
}

/// In-memory notification board with auto-dismissal.
pub struct NotificationBoard {
    entries: Mutex<VecDeque<Notification>>,
    display_for: chrono::Duration,
    capacity: usize,
}

impl NotificationBoard {
    pub fn new(display_for: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            display_for: chrono::Duration::from_std(display_for)
                .unwrap_or_else(|_| chrono::Duration::seconds(4)),
            capacity: capacity.max(1),
        }
    }

    /// Notifications that have not expired yet, oldest first.
    pub fn active(&self) -> Vec<Notification> {
        self.active_at(Utc::now())
    }

    fn active_at(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut entries = self.entries.lock();
        entries.retain(|n| n.expires_at > now);
        entries.iter().cloned().collect()
    }

    fn push_at(&self, level: NotificationLevel, message: &str, now: DateTime<Utc>) {
        let notification = Notification {
            id: Uuid::new_v4(),
            level,
            message: message.to_string(),
            created_at: now,
            expires_at: now + self.display_for,
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(notification);
    }
}

impl Notifier for NotificationBoard {
    fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Error => error!(text = %message, "Operator notified"),
            NotificationLevel::Warning => warn!(text = %message, "Operator notified"),
            NotificationLevel::Success | NotificationLevel::Info => {
                info!(level = ?level, text = %message, "Operator notified")
            }
        }

        self.push_at(level, message, Utc::now());
    }
}
