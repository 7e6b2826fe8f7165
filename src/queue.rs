//! Task Queue Manager
//!
//! Starts waiting tasks one at a time, in queue order, whenever the queue is
//! active and nothing is downloading. Also owns the per-task lifecycle
//! operations that need to stop a process first (pause, remove, clear) and
//! the global stop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cleanup::cleanup_task_files;
use crate::engine::DownloadEngine;
use crate::error::{DownloaderError, Result};
use crate::events::{DownloaderEvent, EventBus};
use crate::logs::LogBuffer;
use crate::models::{DownloadTask, TaskId, TaskStatus};
use crate::process::{ProcessKey, ProcessSupervisor};
use crate::tasks::TaskStore;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Wait after stopping a task before touching its files.
    pub removal_grace: Duration,
    /// Same, when clearing the whole list.
    pub clear_grace: Duration,
    /// Whether the idle loop starts waiting tasks.
    pub active: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            removal_grace: Duration::from_millis(800),
            clear_grace: Duration::from_millis(1000),
            active: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueManager {
    config: QueueConfig,
    active: Arc<AtomicBool>,
    engine: DownloadEngine,
    supervisor: ProcessSupervisor,
    tasks: TaskStore,
    logs: LogBuffer,
    events: EventBus,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        engine: DownloadEngine,
        supervisor: ProcessSupervisor,
        tasks: TaskStore,
        logs: LogBuffer,
        events: EventBus,
    ) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(config.active)),
            config,
            engine,
            supervisor,
            tasks,
            logs,
            events,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        let was = self.active.swap(active, Ordering::SeqCst);
        if was != active {
            log::info!("Queue {}", if active { "enabled" } else { "disabled" });
            self.events.emit(DownloaderEvent::QueueToggled { active });
            // Re-evaluate right away instead of waiting for a task change.
            self.tasks.changed().notify_one();
        }
    }

    /// Start the next waiting task if the queue is active and idle. Returns
    /// the id of the task that was started.
    ///
    /// Safe to call from anywhere: claiming is atomic in the store, so two
    /// concurrent calls never start two tasks.
    pub fn tick(&self) -> Option<TaskId> {
        if !self.is_active() {
            return None;
        }
        let task = self.tasks.claim_next_waiting()?;
        self.logs
            .push(format!("Queue Manager: Starting next task: {}", task.title));

        let id = task.id;
        // Registered before spawning so a pause in between still reaches it.
        let run = self.engine.register_run(id);
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.execute_run(task, run).await {
                log::error!("Queued download {} failed: {}", id, e);
            }
        });
        Some(id)
    }

    /// Run the idle-dequeue loop until the returned handle is aborted.
    pub fn spawn_loop(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let changed = self.tasks.changed();
        tokio::spawn(async move {
            loop {
                queue.tick();
                changed.notified().await;
            }
        })
    }

    /// Stop a downloading task (its run records it as paused), or park a
    /// waiting one.
    pub async fn pause_task(&self, id: TaskId) -> Result<()> {
        let task = self.tasks.get(id).ok_or(DownloaderError::TaskNotFound(id))?;
        match task.status {
            TaskStatus::Downloading => {
                let cancelled = self.engine.cancel_run(id);
                let killed = self.supervisor.kill_one(ProcessKey::Task(id)).await;
                if !cancelled && !killed {
                    // Marked downloading with nothing behind it.
                    self.tasks.update(id, |t| t.paused());
                }
            }
            TaskStatus::Waiting | TaskStatus::Analyzing => {
                self.tasks.update(id, |t| t.paused());
            }
            _ => {}
        }
        Ok(())
    }

    /// Put a paused or failed task back in line.
    pub fn resume_task(&self, id: TaskId) -> Result<()> {
        let task = self.tasks.get(id).ok_or(DownloaderError::TaskNotFound(id))?;
        if !task.status.is_resumable() {
            return Err(DownloaderError::InvalidInput(format!(
                "task {} is {} and cannot be resumed",
                id,
                task.status.as_str()
            )));
        }
        self.tasks.update(id, |t| t.with_status(TaskStatus::Waiting));
        Ok(())
    }

    /// Remove a task. A running task is killed first and given a moment to
    /// release its files. Leftover temp files are cleaned when the task never
    /// completed or when `delete_files` is set.
    pub async fn remove_task(&self, id: TaskId, delete_files: bool) -> Result<()> {
        let task = self.tasks.get(id).ok_or(DownloaderError::TaskNotFound(id))?;

        if task.status.is_transient() {
            let killed = match task.status {
                TaskStatus::Downloading => {
                    let cancelled = self.engine.cancel_run(id);
                    let killed = self.supervisor.kill_one(ProcessKey::Task(id)).await;
                    cancelled || killed
                }
                _ => {
                    let a = self.supervisor.kill_one(ProcessKey::Analysis).await;
                    let m = self.supervisor.kill_one(ProcessKey::Metadata).await;
                    a || m
                }
            };
            if killed {
                tokio::time::sleep(self.config.removal_grace).await;
            }
        }

        if delete_files || task.status != TaskStatus::Completed {
            cleanup_task_files(&self.task_dir(&task), &task, &self.logs).await;
        }

        self.tasks.remove(id);
        Ok(())
    }

    /// Drop completed tasks, or everything when `only_completed` is false. In
    /// the latter case active work is stopped first and unfinished tasks'
    /// files are cleaned up.
    pub async fn clear_tasks(&self, only_completed: bool) -> usize {
        if only_completed {
            return self
                .tasks
                .retain(|t| t.status != TaskStatus::Completed)
                .len();
        }

        if self.tasks.snapshot().iter().any(|t| t.status.is_transient()) {
            self.stop_all().await;
            tokio::time::sleep(self.config.clear_grace).await;
        }

        let removed = self.tasks.clear();
        for task in removed.iter().filter(|t| t.status != TaskStatus::Completed) {
            cleanup_task_files(&self.task_dir(task), task, &self.logs).await;
        }
        removed.len()
    }

    /// Global stop: cancel the shared token, kill every tracked process,
    /// sweep the OS for stragglers and park every live task.
    pub async fn stop_all(&self) -> usize {
        self.logs.push("Stopping all downloads...");
        // Park first so the idle loop cannot pick a waiting task mid-stop.
        self.tasks.coerce_interrupted();
        self.engine.request_stop();
        let killed = self.supervisor.kill_all().await;
        self.tasks.coerce_interrupted();
        log::info!("Stop requested, {} tracked processes signalled", killed);
        killed
    }

    fn task_dir(&self, task: &DownloadTask) -> PathBuf {
        task.options
            .download_path
            .clone()
            .unwrap_or_else(|| self.engine.base_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DownloadConfig, RunOutcome};
    use crate::models::{DownloadService, NewTask};
    use crate::process::SupervisorConfig;

    fn queue(active: bool) -> QueueManager {
        queue_with_fetcher(active, PathBuf::from("/definitely/not/wget"))
    }

    fn queue_with_fetcher(active: bool, fetcher_path: PathBuf) -> QueueManager {
        let events = EventBus::new();
        let supervisor = ProcessSupervisor::new(SupervisorConfig { os_sweep: false });
        let tasks = TaskStore::new(events.clone());
        let logs = LogBuffer::new(100, events.clone());
        let config = DownloadConfig {
            extractor_path: PathBuf::from("/definitely/not/yt-dlp"),
            fetcher_path,
            ffmpeg_path: None,
            clients: vec![],
            user_agent: "UA".into(),
            merge_format: "mp4".into(),
            js_runtime: None,
            extra_args: vec![],
        };
        let engine = DownloadEngine::new(
            config,
            supervisor.clone(),
            tasks.clone(),
            logs.clone(),
            events.clone(),
            std::env::temp_dir(),
        );
        QueueManager::new(
            QueueConfig {
                removal_grace: Duration::from_millis(10),
                clear_grace: Duration::from_millis(10),
                active,
            },
            engine,
            supervisor,
            tasks,
            logs,
            events,
        )
    }

    fn new_task(url: &str) -> NewTask {
        NewTask {
            url: url.to_string(),
            service: DownloadService::Fetcher,
            options: Default::default(),
            title: url.to_string(),
            thumbnail: None,
        }
    }

    #[tokio::test]
    async fn inactive_queue_starts_nothing() {
        let q = queue(false);
        q.tasks.add(new_task("a"));
        assert!(q.tick().is_none());
        assert_eq!(q.tasks.snapshot()[0].status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn resume_only_from_paused_or_failed() {
        let q = queue(false);
        let t = q.tasks.add(new_task("a"));
        assert!(q.resume_task(t.id).is_err());

        q.pause_task(t.id).await.unwrap();
        assert_eq!(q.tasks.get(t.id).unwrap().status, TaskStatus::Paused);

        q.resume_task(t.id).unwrap();
        assert_eq!(q.tasks.get(t.id).unwrap().status, TaskStatus::Waiting);

        assert!(matches!(
            q.resume_task(uuid::Uuid::new_v4()),
            Err(DownloaderError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn clear_completed_only_keeps_the_rest() {
        let q = queue(false);
        let a = q.tasks.add(new_task("a"));
        q.tasks.add(new_task("b"));
        q.tasks.update(a.id, |t| t.completed());

        assert_eq!(q.clear_tasks(true).await, 1);
        let left = q.tasks.snapshot();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "b");
        assert_eq!(left[0].queue_order, 1);

        assert_eq!(q.clear_tasks(false).await, 1);
        assert!(q.tasks.is_empty());
    }

    #[tokio::test]
    async fn stop_all_parks_live_tasks() {
        let q = queue(false);
        let a = q.tasks.add(new_task("a"));
        let b = q.tasks.add(new_task("b"));
        q.tasks.update(b.id, |t| t.completed());

        q.stop_all().await;
        assert_eq!(q.tasks.get(a.id).unwrap().status, TaskStatus::Paused);
        assert_eq!(q.tasks.get(b.id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn spawn_failure_marks_the_queued_task_failed() {
        let q = queue(true);
        let t = q.tasks.add(new_task("https://example.com/file.zip"));
        let handle = q.spawn_loop();

        let mut status = TaskStatus::Waiting;
        for _ in 0..100 {
            status = q.tasks.get(t.id).unwrap().status;
            if status == TaskStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert_eq!(status, TaskStatus::Failed);
    }

    #[cfg(unix)]
    async fn wait_for_status(q: &QueueManager, id: TaskId, status: TaskStatus) -> bool {
        for _ in 0..200 {
            if q.tasks.get(id).map(|t| t.status) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pausing_before_spawn_keeps_one_download_at_a_time() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-wget");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let q = queue_with_fetcher(true, script);
        let a = q.tasks.add(new_task("https://example.com/a.zip"));
        let b = q.tasks.add(new_task("https://example.com/b.zip"));

        // The run is claimed but has not been polled yet.
        assert_eq!(q.tick(), Some(a.id));
        q.pause_task(a.id).await.unwrap();

        assert!(wait_for_status(&q, a.id, TaskStatus::Paused).await);
        assert!(!q.engine.is_running(a.id));
        assert_eq!(q.tick(), Some(b.id));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(q.supervisor.tracked_keys().await, vec![ProcessKey::Task(b.id)]);
        assert_eq!(q.tasks.get(a.id).unwrap().status, TaskStatus::Paused);

        q.stop_all().await;
        for _ in 0..200 {
            if q.supervisor.tracked_keys().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(q.supervisor.tracked_keys().await.is_empty());
    }

    #[tokio::test]
    async fn removing_a_claimed_task_cancels_its_run() {
        let q = queue(false);
        let dir = tempfile::tempdir().unwrap();
        let mut new = new_task("https://example.com/file.zip");
        new.options.download_path = Some(dir.path().to_path_buf());
        let t = q.tasks.add(new);
        let claimed = q.tasks.claim(t.id).unwrap();
        let run = q.engine.register_run(claimed.id);

        q.remove_task(t.id, false).await.unwrap();
        assert!(q.tasks.get(t.id).is_none());

        let outcome = q.engine.execute_run(claimed, run).await.unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        assert!(!q.engine.is_running(t.id));
    }
}
