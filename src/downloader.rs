//! Orchestration Facade
//!
//! The one object a UI talks to. It owns the shared pieces (task store,
//! process supervisor, log buffer, event bus, settings database), wires the
//! resolver, engine and queue together, and keeps the persisted task list in
//! step with the live one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::classifier::{classify, LinkClass};
use crate::db::{self, Db};
use crate::engine::{BatchReport, DownloadConfig, DownloadEngine, RunOutcome};
use crate::error::{DownloaderError, Result};
use crate::events::{DownloaderEvent, EventBus};
use crate::logs::{LogBuffer, DEFAULT_LOG_CAPACITY};
use crate::metadata::{MetadataResolver, ResolverConfig};
use crate::models::{
    DownloadOptions, DownloadService, DownloadTask, LinkAnalysis, MediaMetadata, NewTask,
    SearchResult, TaskId, TaskStatus,
};
use crate::process::{ProcessKey, ProcessSupervisor, SupervisorConfig};
use crate::queue::{QueueConfig, QueueManager};
use crate::settings::SettingsManager;
use crate::tasks::{MoveDirection, TaskStore};
use crate::tools::{Tool, ToolInfo, ToolLocator};
use crate::url_utils::{
    expand_playlist_id, extract_urls, is_quality_rich_host, requested_entry, youtube_embed_url,
};

/// Everything needed to build a [`Downloader`].
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub download: DownloadConfig,
    pub resolver: ResolverConfig,
    pub queue: QueueConfig,
    pub supervisor: SupervisorConfig,
    pub log_capacity: usize,
    /// Overrides the persisted base download directory.
    pub base_dir: Option<PathBuf>,
    /// Used by `tool_status` for tools without a configured path.
    pub locator: ToolLocator,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let tools_dir = db::app_data_dir().ok().map(|d| d.join("tools"));
        Self::discover(ToolLocator::new(tools_dir))
    }
}

impl DownloaderConfig {
    /// Defaults with every tool path looked up through `locator`.
    pub fn discover(locator: ToolLocator) -> Self {
        Self {
            download: DownloadConfig::discover(&locator),
            resolver: ResolverConfig::discover(&locator),
            queue: QueueConfig::default(),
            supervisor: SupervisorConfig::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            base_dir: None,
            locator,
        }
    }
}

pub struct Downloader {
    db: Arc<Mutex<Db>>,
    events: EventBus,
    logs: LogBuffer,
    tasks: TaskStore,
    supervisor: ProcessSupervisor,
    resolver: MetadataResolver,
    engine: DownloadEngine,
    queue: QueueManager,
    locator: ToolLocator,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Downloader {
    /// Open the per-user settings database and start the core.
    pub async fn open(config: DownloaderConfig) -> Result<Self> {
        let db = Db::open_default()?;
        log::info!("Settings database at {:?}", db.path());
        Self::with_db(config, db).await
    }

    /// Start the core on an already opened database: restore tasks and
    /// preferences, then spawn the queue loop and the persistence loop.
    pub async fn with_db(config: DownloaderConfig, db: Db) -> Result<Self> {
        let (saved_tasks, saved_base, queue_active) = {
            let settings = SettingsManager::new(db.conn());
            (
                settings.load_tasks()?,
                settings.base_path()?,
                settings.queue_active()?,
            )
        };

        let base_dir = config.base_dir.clone().unwrap_or(saved_base);
        if let Err(e) = std::fs::create_dir_all(&base_dir) {
            log::warn!("Could not create download dir {}: {}", base_dir.display(), e);
        }

        let events = EventBus::new();
        let logs = LogBuffer::new(config.log_capacity, events.clone());
        let restored = saved_tasks.len();
        let tasks = TaskStore::with_tasks(saved_tasks, events.clone());
        let supervisor = ProcessSupervisor::new(config.supervisor.clone());
        let resolver = MetadataResolver::new(config.resolver.clone(), supervisor.clone());
        let engine = DownloadEngine::new(
            config.download.clone(),
            supervisor.clone(),
            tasks.clone(),
            logs.clone(),
            events.clone(),
            base_dir.clone(),
        );
        let queue = QueueManager::new(
            QueueConfig {
                active: queue_active,
                ..config.queue.clone()
            },
            engine.clone(),
            supervisor.clone(),
            tasks.clone(),
            logs.clone(),
            events.clone(),
        );

        log::info!(
            "Downloader ready: {} task(s) restored, base dir {}, queue {}",
            restored,
            base_dir.display(),
            if queue_active { "active" } else { "paused" }
        );

        let db = Arc::new(Mutex::new(db));
        let persistence = spawn_persistence(db.clone(), tasks.clone(), events.subscribe());
        let queue_loop = queue.spawn_loop();

        Ok(Self {
            db,
            events,
            logs,
            tasks,
            supervisor,
            resolver,
            engine,
            queue,
            locator: config.locator,
            background: std::sync::Mutex::new(vec![persistence, queue_loop]),
        })
    }

    // ---- link analysis ----

    pub fn classify(&self, url: &str) -> LinkClass {
        classify(url)
    }

    /// Analyze a pasted link for the download dialog. Returns `None` when the
    /// extractor cannot describe it; the reason goes to the log.
    pub async fn analyze_link(&self, input: &str) -> Option<LinkAnalysis> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }

        let url = expand_playlist_id(trimmed);
        if url != trimmed {
            self.logs
                .push("Detected YouTube Playlist ID - Formatting URL...");
        }
        self.logs.push(format!("Deep analyzing link: {url}"));

        let cancel = self.engine.stop_token();
        match self
            .resolver
            .resolve_as(ProcessKey::Analysis, &url, &cancel)
            .await
        {
            Ok(meta) => Some(LinkAnalysis {
                embed_url: embed_url_for(&url, &meta),
                is_playlist: meta.is_playlist,
                direct_url: url,
                metadata: Some(meta),
            }),
            Err(e) => {
                self.logs.push(format!("Extraction failed: {e}"));
                log::warn!("Analysis of {} failed: {}", url, e);
                None
            }
        }
    }

    /// Resolve metadata without the analysis wrapper. Errors propagate.
    pub async fn media_metadata(&self, url: &str) -> Result<MediaMetadata> {
        let cancel = self.engine.stop_token();
        self.resolver.resolve(url, &cancel).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let cancel = self.engine.stop_token();
        self.resolver.search(query, &cancel).await
    }

    // ---- task list ----

    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.tasks.snapshot()
    }

    pub fn task(&self, id: TaskId) -> Option<DownloadTask> {
        self.tasks.get(id)
    }

    pub fn add_task(&self, new: NewTask) -> DownloadTask {
        self.tasks.add(new)
    }

    pub fn add_tasks_bulk(&self, items: Vec<NewTask>) -> Vec<DownloadTask> {
        self.tasks.add_bulk(items)
    }

    /// Queue every http(s) URL found in pasted text. Each one is routed to the
    /// extractor or the fetcher by the link classifier.
    pub fn add_urls(&self, text: &str, options: &DownloadOptions) -> Vec<DownloadTask> {
        let items: Vec<NewTask> = extract_urls(text)
            .into_iter()
            .map(|url| {
                let class = classify(&url);
                NewTask {
                    title: class.suggested_filename.unwrap_or_else(|| url.clone()),
                    service: class.service,
                    options: options.clone(),
                    thumbnail: None,
                    url,
                }
            })
            .collect();
        self.tasks.add_bulk(items)
    }

    /// Add a placeholder while its metadata is still being fetched. The queue
    /// skips it until [`mark_analyzed`](Self::mark_analyzed) is called.
    pub fn add_analyzing_task(&self, new: NewTask) -> DownloadTask {
        self.tasks.add_with_status(new, TaskStatus::Analyzing)
    }

    /// Fill in title and thumbnail from fresh metadata and put the task in line.
    pub fn mark_analyzed(&self, id: TaskId, meta: &MediaMetadata) -> Result<DownloadTask> {
        self.tasks
            .update(id, |mut t| {
                if !meta.title.is_empty() {
                    t.title = meta.title.clone();
                }
                if !meta.thumbnail.is_empty() {
                    t.thumbnail = Some(meta.thumbnail.clone());
                }
                if t.status == TaskStatus::Analyzing {
                    t.status = TaskStatus::Waiting;
                }
                t
            })
            .ok_or(DownloaderError::TaskNotFound(id))
    }

    pub fn reorder_task(&self, id: TaskId, direction: MoveDirection) -> bool {
        self.tasks.reorder(id, direction)
    }

    pub async fn remove_task(&self, id: TaskId, delete_files: bool) -> Result<()> {
        self.queue.remove_task(id, delete_files).await
    }

    pub async fn clear_tasks(&self, only_completed: bool) -> usize {
        self.queue.clear_tasks(only_completed).await
    }

    // ---- downloads ----

    pub async fn start_download(
        &self,
        url: &str,
        service: DownloadService,
        options: DownloadOptions,
        existing: Option<TaskId>,
    ) -> Result<RunOutcome> {
        self.engine
            .start_download(url, service, options, existing)
            .await
    }

    pub async fn start_batch_download(
        &self,
        urls: &[String],
        options: &DownloadOptions,
    ) -> BatchReport {
        self.engine.start_batch_download(urls, options).await
    }

    pub async fn start_batch_download_text(
        &self,
        text: &str,
        options: &DownloadOptions,
    ) -> BatchReport {
        self.engine.start_batch_download_text(text, options).await
    }

    /// Global stop. Returns how many tracked processes were signalled.
    pub async fn stop_download(&self) -> usize {
        self.queue.stop_all().await
    }

    pub async fn pause_task(&self, id: TaskId) -> Result<()> {
        self.queue.pause_task(id).await
    }

    pub fn resume_task(&self, id: TaskId) -> Result<()> {
        self.queue.resume_task(id)
    }

    // ---- settings ----

    pub fn base_path(&self) -> PathBuf {
        self.engine.base_dir()
    }

    /// Change the base download directory. The directory is created and the
    /// choice persisted before new downloads use it.
    pub async fn set_base_path(&self, path: &Path) -> Result<()> {
        {
            let db = self.db.lock().await;
            SettingsManager::new(db.conn()).set_base_path(path)?;
        }
        self.engine.set_base_dir(path.to_path_buf());
        self.logs
            .push(format!("Download folder set to {}", path.display()));
        Ok(())
    }

    pub fn is_queue_active(&self) -> bool {
        self.queue.is_active()
    }

    pub async fn set_queue_active(&self, active: bool) -> Result<()> {
        {
            let db = self.db.lock().await;
            SettingsManager::new(db.conn()).set_queue_active(active)?;
        }
        self.queue.set_active(active);
        Ok(())
    }

    pub async fn sort_by(&self) -> Result<Option<String>> {
        let db = self.db.lock().await;
        Ok(SettingsManager::new(db.conn()).sort_by()?)
    }

    pub async fn set_sort_by(&self, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        Ok(SettingsManager::new(db.conn()).set_sort_by(value)?)
    }

    pub async fn filter_by(&self) -> Result<Option<String>> {
        let db = self.db.lock().await;
        Ok(SettingsManager::new(db.conn()).filter_by()?)
    }

    pub async fn set_filter_by(&self, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        Ok(SettingsManager::new(db.conn()).set_filter_by(value)?)
    }

    /// Path and version of each external tool. A configured path that does
    /// not exist is reported with neither.
    pub async fn tool_status(&self) -> Vec<ToolInfo> {
        let cfg = self.engine.config();
        let configured = [
            (Tool::Extractor, Some(cfg.extractor_path.clone())),
            (Tool::Fetcher, Some(cfg.fetcher_path.clone())),
            (Tool::Ffmpeg, cfg.ffmpeg_path.clone()),
        ];

        let mut status = Vec::with_capacity(configured.len());
        for (tool, path) in configured {
            let info = match path {
                None => self.locator.info(tool).await,
                Some(p) => {
                    let path = resolve_binary(&p);
                    let version = match &path {
                        Some(p) => self.locator.version(p, tool).await.ok(),
                        None => None,
                    };
                    ToolInfo {
                        tool,
                        path,
                        version,
                    }
                }
            };
            status.push(info);
        }
        status
    }

    // ---- observation ----

    pub fn logs(&self) -> Vec<String> {
        self.logs.lines()
    }

    pub fn clear_logs(&self) {
        self.logs.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloaderEvent> {
        self.events.subscribe()
    }

    /// Stop everything, end the background loops and write the task list one
    /// last time.
    pub async fn shutdown(&self) {
        self.queue.stop_all().await;
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        save_tasks(&self.db, &self.tasks).await;
        log::info!("Downloader shut down");
    }
}

/// Embed URL for a single YouTube video: the metadata id, else the `v`
/// parameter of the input.
fn embed_url_for(url: &str, meta: &MediaMetadata) -> Option<String> {
    if meta.is_playlist || !is_quality_rich_host(url) {
        return None;
    }
    meta.id
        .clone()
        .or_else(|| meta.requested_video_id.clone())
        .or_else(|| requested_entry(url).0)
        .map(|id| youtube_embed_url(&id))
}

fn resolve_binary(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        Some(path.to_path_buf())
    } else {
        which::which(path).ok()
    }
}

/// Write the task list after every burst of task events. Progress updates
/// arrive many times a second, so queued events are drained into one write.
fn spawn_persistence(
    db: Arc<Mutex<Db>>,
    tasks: TaskStore,
    mut rx: broadcast::Receiver<DownloaderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut dirty = match rx.recv().await {
                Ok(event) => event.touches_tasks(),
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("Persistence lagged by {} events", skipped);
                    true
                }
                Err(RecvError::Closed) => break,
            };
            loop {
                match rx.try_recv() {
                    Ok(event) => dirty |= event.touches_tasks(),
                    Err(TryRecvError::Lagged(_)) => dirty = true,
                    Err(_) => break,
                }
            }
            if dirty {
                save_tasks(&db, &tasks).await;
            }
        }
    })
}

async fn save_tasks(db: &Mutex<Db>, tasks: &TaskStore) {
    let snapshot = tasks.snapshot();
    let db = db.lock().await;
    if let Err(e) = SettingsManager::new(db.conn()).save_tasks(&snapshot) {
        log::error!("Failed to persist task list: {:#}", e);
    }
}


#[cfg(all(test, unix))]
mod e2e_tests {
    use super::*;
    use crate::events::NoticeLevel;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// Stand-in for the extractor: the URL is the last argument. URLs
    /// containing `fail` exit 1, `slow` ones hang until killed.
    const FAKE_EXTRACTOR: &str = r#"#!/bin/sh
for last; do :; done
case "$last" in
  *fail*) echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2; exit 1;;
  *slow*) exec sleep 30;;
esac
echo "[download] Destination: clip.mp4"
echo "[download]  40.0% of 10.00MiB at 1.00MiB/s ETA 00:06"
sleep 0.3
echo "[download] 100% of 10.00MiB at 1.00MiB/s ETA 00:00"
exit 0
"#;

    struct Harness {
        downloader: Downloader,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        harness_with_clients(&["web"]).await
    }

    async fn harness_with_clients(clients: &[&str]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-yt-dlp");
        std::fs::write(&script, FAKE_EXTRACTOR).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut resolver = ResolverConfig::new(script.clone());
        resolver.js_runtime = None;
        let config = DownloaderConfig {
            download: DownloadConfig {
                extractor_path: script,
                fetcher_path: PathBuf::from("/definitely/not/wget"),
                ffmpeg_path: None,
                clients: clients.iter().map(|c| c.to_string()).collect(),
                user_agent: "UA".to_string(),
                merge_format: "mp4".to_string(),
                js_runtime: None,
                extra_args: vec![],
            },
            resolver,
            queue: QueueConfig {
                removal_grace: Duration::from_millis(50),
                clear_grace: Duration::from_millis(50),
                active: true,
            },
            supervisor: SupervisorConfig { os_sweep: false },
            log_capacity: 500,
            base_dir: Some(dir.path().join("downloads")),
            locator: ToolLocator::default(),
        };
        let downloader = Downloader::with_db(config, Db::open_in_memory().unwrap())
            .await
            .unwrap();
        Harness {
            downloader,
            _dir: dir,
        }
    }

    fn video(url: &str, quality: &str) -> NewTask {
        NewTask {
            url: url.to_string(),
            service: DownloadService::Extractor,
            options: DownloadOptions {
                quality: Some(quality.to_string()),
                ..Default::default()
            },
            title: url.to_string(),
            thumbnail: None,
        }
    }

    async fn wait_tracked(d: &Downloader, key: ProcessKey) -> bool {
        for _ in 0..250 {
            if d.supervisor.is_tracked(key).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn wait_for<F>(mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for _ in 0..250 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_video_runs_to_completion() {
        let h = harness().await;
        let d = &h.downloader;

        let task = d.add_task(video("https://www.youtube.com/watch?v=abc", "720p"));
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.queue_order, 1);

        assert!(
            wait_for(|| d.task(task.id).map(|t| t.status) == Some(TaskStatus::Downloading)).await
        );
        assert!(
            wait_for(|| d.task(task.id).map(|t| t.status) == Some(TaskStatus::Completed)).await
        );

        let done = d.task(task.id).unwrap();
        assert_eq!(done.progress, 100.0);
        assert!(done.speed.is_none());
        assert!(d.logs().iter().any(|l| l.contains("[TRYING] web")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_continues_past_a_failed_item() {
        let h = harness().await;
        let d = &h.downloader;
        let mut rx = d.subscribe();

        let urls = vec![
            "https://example.com/one".to_string(),
            "https://example.com/fail".to_string(),
            "https://example.com/three".to_string(),
        ];
        let report = d
            .start_batch_download(&urls, &DownloadOptions::default())
            .await;

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, vec!["https://example.com/fail".to_string()]);
        assert!(!report.stopped);
        assert!(d.logs().iter().any(|l| l == "Item 2 failed. Continuing..."));

        let mut notice = None;
        while let Ok(event) = rx.try_recv() {
            if let DownloaderEvent::Notice { level, message } = event {
                notice = Some((level, message));
            }
        }
        assert_eq!(
            notice,
            Some((NoticeLevel::Success, "Batch Download Finished".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_a_running_task_kills_its_process() {
        let h = harness().await;
        let d = &h.downloader;

        let task = d.add_task(video("https://example.com/slow", "best"));
        assert!(wait_for(|| d.task(task.id).map(|t| t.status) == Some(TaskStatus::Downloading)).await);

        let key = ProcessKey::Task(task.id);
        assert!(wait_tracked(d, key).await);

        d.remove_task(task.id, false).await.unwrap();
        assert!(d.task(task.id).is_none());

        let mut released = false;
        for _ in 0..250 {
            if !d.supervisor.is_tracked(key).await {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_task_can_be_resumed_and_settings_persist() {
        let h = harness().await;
        let d = &h.downloader;
        d.set_queue_active(false).await.unwrap();

        let task = d.add_task(video("https://example.com/fail", "best"));
        let outcome = d
            .start_download(&task.url, task.service, task.options.clone(), Some(task.id))
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { code: Some(1), .. }));
        assert_eq!(d.task(task.id).unwrap().status, TaskStatus::Failed);

        d.resume_task(task.id).unwrap();
        assert_eq!(d.task(task.id).unwrap().status, TaskStatus::Waiting);

        let db = d.db.lock().await;
        let settings = SettingsManager::new(db.conn());
        assert!(!settings.queue_active().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn analysis_failure_yields_none() {
        let h = harness().await;
        let d = &h.downloader;
        assert!(d.analyze_link("https://example.com/fail").await.is_none());
        assert!(d.analyze_link("   ").await.is_none());
        assert!(d.logs().iter().any(|l| l.starts_with("Extraction failed")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pasted_text_is_routed_by_classifier() {
        let h = harness().await;
        let d = &h.downloader;
        d.set_queue_active(false).await.unwrap();

        let added = d.add_urls(
            "grab https://cdn.example.com/files/setup.exe and https://youtu.be/abc please",
            &DownloadOptions::default(),
        );
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].service, DownloadService::Fetcher);
        assert_eq!(added[0].title, "setup.exe");
        assert_eq!(added[1].service, DownloadService::Extractor);
        let orders: Vec<u32> = d.tasks().iter().map(|t| t.queue_order).collect();
        assert_eq!(orders, vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_mid_attempt_parks_the_task_without_fallback() {
        let h = harness_with_clients(&["web", "ios"]).await;
        let d = &h.downloader;
        d.set_queue_active(false).await.unwrap();

        let task = d.add_task(video("https://example.com/slow", "best"));
        let (outcome, tracked) = tokio::join!(
            d.start_download(&task.url, task.service, task.options.clone(), Some(task.id)),
            async {
                let tracked = wait_tracked(d, ProcessKey::Task(task.id)).await;
                d.stop_download().await;
                tracked
            }
        );

        assert!(tracked);
        assert_eq!(outcome.unwrap(), RunOutcome::Stopped);
        assert_eq!(d.task(task.id).unwrap().status, TaskStatus::Paused);
        let attempts = d.logs().iter().filter(|l| l.starts_with("[TRYING]")).count();
        assert_eq!(attempts, 1);
        assert!(d.supervisor.tracked_keys().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_cuts_a_batch_short() {
        let h = harness().await;
        let d = &h.downloader;

        let urls = vec![
            "https://example.com/slow".to_string(),
            "https://example.com/one".to_string(),
        ];
        let options = DownloadOptions::default();
        let (report, tracked) = tokio::join!(
            d.start_batch_download(&urls, &options),
            async {
                let tracked = wait_tracked(d, ProcessKey::Batch).await;
                d.stop_download().await;
                tracked
            }
        );

        assert!(tracked);
        assert!(report.stopped);
        assert_eq!(report.succeeded, 0);
        assert!(report.failed.is_empty());
        assert!(!d.logs().iter().any(|l| l.contains("[2/2]")));
    }
}
