//! Progress tracking and user notifications.
//!
//! The tracker is an id-keyed map of `{description, status, progress}`
//! entries; observers subscribe to a version counter and re-read the
//! snapshot on change. The notifier carries transient user-facing messages;
//! the CLI logs them, tests capture them.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressStatus {
    Running,
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    pub description: String,
    pub status: ProgressStatus,
    /// 0–100 where known.
    pub progress: Option<u8>,
}

#[derive(Clone)]
pub struct ProgressTracker {
    entries: Arc<RwLock<HashMap<String, ProgressEntry>>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        let (tx, _) = watch::channel(0);
        ProgressTracker {
            entries: Default::default(),
            version: Arc::new(tx),
        }
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    pub fn begin(&self, id: impl Into<String>, description: impl Into<String>) {
        self.entries.write().insert(
            id.into(),
            ProgressEntry {
                description: description.into(),
                status: ProgressStatus::Running,
                progress: Some(0),
            },
        );
        self.bump();
    }

    pub fn update(&self, id: &str, percent: u8) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.progress = Some(percent.min(100));
        }
        self.bump();
    }

    pub fn describe(&self, id: &str, description: impl Into<String>) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.description = description.into();
        }
        self.bump();
    }

    pub fn complete(&self, id: &str) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.status = ProgressStatus::Done;
            entry.progress = Some(100);
        }
        self.bump();
    }

    pub fn fail(&self, id: &str, message: impl Into<String>) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.status = ProgressStatus::Error(message.into());
        }
        self.bump();
    }

    pub fn remove(&self, id: &str) {
        self.entries.write().remove(id);
        self.bump();
    }

    pub fn snapshot(&self) -> HashMap<String, ProgressEntry> {
        self.entries.read().clone()
    }

    /// Change notifications; the value is a monotonic version counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

/// Transient user-facing notifications. No silent data loss: any dropped
/// volume surfaces through this trait.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Routes notifications to the log.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::info!(target: "hondana::notify", "{message}");
    }
}

/// Captures notifications for assertions.
#[derive(Default)]
pub struct CollectingNotifier {
    pub messages: parking_lot::Mutex<Vec<String>>,
}

impl Notifier for CollectingNotifier {
    fn notify(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}
