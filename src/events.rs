use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{DownloadTask, TaskId};

/// Capacity of the observer channel. Slow observers see `Lagged` and should
/// re-read the task list.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Severity of a user-facing notice (the UI renders these as toasts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Core -> UI events. Observers subscribe once and switch on `event`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DownloaderEvent {
    TaskAdded { task: DownloadTask },
    TaskUpdated { task: DownloadTask },
    TaskRemoved { id: TaskId },
    /// Many tasks changed at once (bulk add, clear, stop-all coercion).
    TasksReset { tasks: Vec<DownloadTask> },

    Log { line: String },
    Notice { level: NoticeLevel, message: String },

    QueueToggled { active: bool },
}

impl DownloaderEvent {
    /// True for events that change the persisted task list.
    pub fn touches_tasks(&self) -> bool {
        matches!(
            self,
            DownloaderEvent::TaskAdded { .. }
                | DownloaderEvent::TaskUpdated { .. }
                | DownloaderEvent::TaskRemoved { .. }
                | DownloaderEvent::TasksReset { .. }
        )
    }
}

/// Sending half shared by every component that reports to observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloaderEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloaderEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no observers is not an error.
    pub fn emit(&self, event: DownloaderEvent) {
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(DownloaderEvent::Notice {
            level,
            message: message.into(),
        });
    }
}
