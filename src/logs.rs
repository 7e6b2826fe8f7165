//! Diagnostic log ring
//!
//! Every external-process output line and engine decision lands here for the
//! UI's log view. Developer diagnostics still go through the `log` facade.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::events::{DownloaderEvent, EventBus};

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

const PROGRESS_TAG: &str = "[download]";

/// Bounded ring buffer of user-visible log lines. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    events: EventBus,
}

impl LogBuffer {
    pub fn new(capacity: usize, events: EventBus) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            events,
        }
    }

    /// Append a line, evicting the oldest past capacity. A progress line
    /// directly following another progress line replaces it.
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut lines = self.lock();
            let replaces_progress = is_progress_line(&line)
                && lines.back().map(|l| is_progress_line(l)).unwrap_or(false);
            if replaces_progress {
                lines.pop_back();
            }
            lines.push_back(line.clone());
            while lines.len() > self.capacity {
                lines.pop_front();
            }
        }
        self.events.emit(DownloaderEvent::Log { line });
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_progress_line(line: &str) -> bool {
    line.contains(PROGRESS_TAG) && line.contains('%')
}
