//! Download Engine
//!
//! Handles the execution of downloads with the extractor or the fetcher:
//! argument building, fallback client identities, live progress through the
//! phase aggregator, and the final status of a task (completed, paused or
//! failed). The queue decides *when* a task runs; this module decides *how*.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregateProgress, Observation, PhaseState};
use crate::error::{DownloaderError, Result};
use crate::events::{EventBus, NoticeLevel};
use crate::logs::LogBuffer;
use crate::models::{DownloadOptions, DownloadService, DownloadTask, NewTask, TaskId, TaskStatus};
use crate::process::{ProcessKey, ProcessSupervisor, Stream};
use crate::tasks::TaskStore;
use crate::tools::{Tool, ToolLocator};
use crate::url_utils::split_batch_lines;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Request profiles tried in order until one succeeds.
pub const DEFAULT_CLIENTS: &[&str] = &["web_embedded,mweb", "android,web", "ios"];

/// Stderr lines kept per attempt for the failure hint.
const STDERR_TAIL: usize = 50;

/// Configuration for download execution.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub extractor_path: PathBuf,
    pub fetcher_path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    /// Extractor client identities, tried in order.
    pub clients: Vec<String>,
    pub user_agent: String,
    pub merge_format: String,
    pub js_runtime: Option<String>,
    /// Injected into every extractor download (e.g. a proxy).
    pub extra_args: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self::discover(&ToolLocator::default())
    }
}

impl DownloadConfig {
    /// Default settings with tool paths looked up through `locator`.
    pub fn discover(locator: &ToolLocator) -> Self {
        Self {
            extractor_path: locator.resolve(Tool::Extractor),
            fetcher_path: locator.resolve(Tool::Fetcher),
            ffmpeg_path: locator.find(Tool::Ffmpeg),
            clients: DEFAULT_CLIENTS.iter().map(|c| c.to_string()).collect(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            merge_format: "mp4".to_string(),
            js_runtime: Some("node".to_string()),
            extra_args: vec![],
        }
    }
}

/// How one `run_single_download` call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// A stop was requested; no further clients were tried.
    Stopped,
    /// Every client identity failed. `code` is the last exit code.
    Failed {
        code: Option<i32>,
        hint: Option<String>,
    },
}

/// Summary of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
    /// True when a stop cut the batch short.
    pub stopped: bool,
}

/// Extractor `-f` selector for a quality choice.
///
/// The av01 exclusion only applies to the most specific tier so that a
/// height-capped download still succeeds when only av01 exists.
pub fn format_selector(quality: &str) -> String {
    match quality {
        "audio" => "bestaudio/best".to_string(),
        "best" | "" => "bestvideo+bestaudio/best".to_string(),
        other => match other.trim_end_matches('p').parse::<u32>() {
            Ok(h) => format!(
                "bestvideo[height<={h}][vcodec!*=av01]+bestaudio/bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"
            ),
            Err(_) => "bestvideo+bestaudio/best".to_string(),
        },
    }
}

/// Full extractor argument list for one attempt. The URL is always last.
pub fn build_extractor_args(
    config: &DownloadConfig,
    url: &str,
    options: &DownloadOptions,
    dir: &Path,
    client: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if let Some(runtime) = &config.js_runtime {
        args.extend(["--js-runtimes".to_string(), runtime.clone()]);
    }
    if let Some(ffmpeg) = &config.ffmpeg_path {
        args.extend([
            "--ffmpeg-location".to_string(),
            ffmpeg.to_string_lossy().to_string(),
        ]);
    }
    args.extend(["--merge-output-format".to_string(), config.merge_format.clone()]);
    if let Some(client) = client {
        args.extend([
            "--extractor-args".to_string(),
            format!("youtube:player-client={client}"),
        ]);
    }
    args.extend(
        ["--newline", "--progress", "--no-colors"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.extend([
        "-P".to_string(),
        dir.to_string_lossy().to_string(),
        "-f".to_string(),
        format_selector(options.quality_or_best()),
        "--user-agent".to_string(),
        config.user_agent.clone(),
    ]);
    args.extend(
        [
            "--no-check-certificate",
            "--prefer-free-formats",
            "--continue",
            "--no-overwrites",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    if let Some(items) = options.playlist_items.as_deref().filter(|s| !s.trim().is_empty()) {
        args.extend(["--playlist-items".to_string(), items.trim().to_string()]);
    }

    if let Some(lang) = options.wanted_subtitle_lang() {
        args.extend([
            "--write-subs".to_string(),
            "--write-auto-subs".to_string(),
            "--sub-langs".to_string(),
            lang.to_string(),
            "--convert-subs".to_string(),
            "srt".to_string(),
        ]);
        if options.embed_subtitles {
            args.push("--embed-subs".to_string());
        }
    }

    args.extend(config.extra_args.iter().cloned());
    args.push(url.to_string());
    args
}

/// Fetcher argument list. The URL is always last.
pub fn build_fetcher_args(
    config: &DownloadConfig,
    url: &str,
    options: &DownloadOptions,
    dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        "--progress=dot:giga".to_string(),
        "-P".to_string(),
        dir.to_string_lossy().to_string(),
        format!("--user-agent={}", config.user_agent),
    ];
    if let Some(referer) = options.referer.as_deref().filter(|r| !r.trim().is_empty()) {
        args.push(format!("--referer={}", referer.trim()));
    }
    if let Some(name) = options.output_filename.as_deref().filter(|n| !n.trim().is_empty()) {
        // -O ignores -P, so the directory is joined in here.
        let safe = sanitize_filename::sanitize(name.trim());
        args.extend(["-O".to_string(), dir.join(safe).to_string_lossy().to_string()]);
    }
    args.push(url.to_string());
    args
}

/// Short user-facing explanation of a failure, from the tool's stderr.
pub fn failure_hint(stderr: &str) -> Option<&'static str> {
    let lower = stderr.to_lowercase();

    if contains_any(&lower, &["sign in", "login", "cookies", "age-restricted"]) {
        Some("This content requires sign-in.")
    } else if contains_any(&lower, &["captcha", "confirm you're not a bot", "not a bot"]) {
        Some("The site requires verification.")
    } else if contains_any(&lower, &["not available in your country", "geo restrict", "geo-restrict"]) {
        Some("This content is not available in your region.")
    } else if contains_any(&lower, &["unsupported url", "no video formats"]) {
        Some("The extractor may be outdated for this site.")
    } else if contains_any(&lower, &["requested format", "format not available"]) {
        Some("The requested quality is not available.")
    } else if contains_any(&lower, &["unable to resolve host", "connection", "timed out", "network"]) {
        Some("Network error. Check your connection and retry.")
    } else {
        None
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn link_label(url: &str) -> &'static str {
    if url.contains("t.me/") {
        "Telegram Link"
    } else {
        "Direct Link"
    }
}

/// Fold an aggregate progress update into a task. Progress never regresses.
fn apply_progress(mut task: DownloadTask, p: &AggregateProgress) -> DownloadTask {
    task.progress = task.progress.max(p.percent);
    if p.total_bytes > 0 {
        task.total_bytes = p.total_bytes;
        task.downloaded_bytes = task.downloaded_bytes.max(p.downloaded_bytes);
    }
    if p.speed.is_some() {
        task.speed = p.speed.clone();
    }
    if p.eta.is_some() {
        task.eta = p.eta.clone();
    }
    if p.size.is_some() {
        task.size = p.size.clone();
    }
    task
}

/// Cancellation handle of one task run, registered from the moment the task
/// is claimed until its run has recorded an outcome.
#[derive(Debug, Clone)]
pub struct TaskRun {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RunRegistry {
    next_generation: u64,
    runs: HashMap<TaskId, TaskRun>,
}

/// Download Engine. Cheap to clone; clones share tasks, processes and the
/// stop token.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    config: Arc<DownloadConfig>,
    supervisor: ProcessSupervisor,
    tasks: TaskStore,
    logs: LogBuffer,
    events: EventBus,
    base_dir: Arc<RwLock<PathBuf>>,
    stop: Arc<Mutex<CancellationToken>>,
    runs: Arc<Mutex<RunRegistry>>,
}

impl DownloadEngine {
    pub fn new(
        config: DownloadConfig,
        supervisor: ProcessSupervisor,
        tasks: TaskStore,
        logs: LogBuffer,
        events: EventBus,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            config: Arc::new(config),
            supervisor,
            tasks,
            logs,
            events,
            base_dir: Arc::new(RwLock::new(base_dir)),
            stop: Arc::new(Mutex::new(CancellationToken::new())),
            runs: Arc::new(Mutex::new(RunRegistry::default())),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_base_dir(&self, dir: PathBuf) {
        *self.base_dir.write().unwrap_or_else(PoisonError::into_inner) = dir;
    }

    /// Token shared by every run started until the next global stop. A
    /// cancelled token is replaced so that later runs start clean.
    pub fn stop_token(&self) -> CancellationToken {
        let mut token = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Signal every run holding the current token to stop between attempts.
    pub fn request_stop(&self) {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Register a run for a freshly claimed task. Its token is a child of the
    /// stop token, so a global stop cancels it too.
    pub fn register_run(&self, id: TaskId) -> TaskRun {
        let cancel = self.stop_token().child_token();
        let mut registry = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_generation += 1;
        let run = TaskRun {
            generation: registry.next_generation,
            cancel,
        };
        registry.runs.insert(id, run.clone());
        run
    }

    fn finish_run(&self, id: TaskId, run: &TaskRun) {
        let mut registry = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.runs.get(&id).map(|r| r.generation) == Some(run.generation) {
            registry.runs.remove(&id);
        }
    }

    /// Cancel the run of one task, whether or not its process has spawned
    /// yet. Returns false when the task has no run.
    pub fn cancel_run(&self, id: TaskId) -> bool {
        let registry = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        match registry.runs.get(&id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .runs
            .contains_key(&id)
    }

    /// Run one URL to completion, trying each client identity in turn.
    ///
    /// With a task id, progress is written to that task as it arrives and the
    /// process is tracked under the task's key; without one (batch items) it is
    /// tracked under `batch`.
    pub async fn run_single_download(
        &self,
        url: &str,
        service: DownloadService,
        options: &DownloadOptions,
        task: Option<TaskId>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let dir = options
            .download_path
            .clone()
            .unwrap_or_else(|| self.base_dir());
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir).await?;
            self.logs.push(format!("Created directory: {}", dir.display()));
        }

        let clients: Vec<Option<&str>> = match service {
            DownloadService::Extractor if !self.config.clients.is_empty() => {
                self.config.clients.iter().map(|c| Some(c.as_str())).collect()
            }
            _ => vec![None],
        };
        let (tool, program) = match service {
            DownloadService::Extractor => (Tool::Extractor, &self.config.extractor_path),
            DownloadService::Fetcher => (Tool::Fetcher, &self.config.fetcher_path),
        };
        let key = task.map(ProcessKey::Task).unwrap_or(ProcessKey::Batch);
        let label = link_label(url);

        let mut last_code = None;
        let mut last_stderr: Vec<String> = Vec::new();

        for (attempt, client) in clients.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Stopped);
            }

            self.logs.push(format!(
                "[TRYING] {} for {}",
                client.unwrap_or("default"),
                label
            ));

            let args = match service {
                DownloadService::Extractor => {
                    build_extractor_args(&self.config, url, options, &dir, *client)
                }
                DownloadService::Fetcher => build_fetcher_args(&self.config, url, options, &dir),
            };
            log::info!("Starting {} attempt {} with args: {:?}", tool.as_str(), attempt + 1, args);

            let mut cmd = Command::new(program);
            cmd.args(&args);

            let mut phases = PhaseState::for_options(options, service);
            let mut stderr_tail: Vec<String> = Vec::new();

            let report = self
                .supervisor
                .run_streaming(key, tool.as_str(), cmd, cancel, None, |stream, line| {
                    let line = line.trim();
                    if line.is_empty() {
                        return;
                    }
                    match stream {
                        Stream::Stdout => self.logs.push(line),
                        Stream::Stderr => {
                            self.logs.push(format!("ERR: {line}"));
                            if stderr_tail.len() == STDERR_TAIL {
                                stderr_tail.remove(0);
                            }
                            stderr_tail.push(line.to_string());
                        }
                    }
                    // The fetcher writes its progress to stderr.
                    if stream == Stream::Stdout || service == DownloadService::Fetcher {
                        if let Observation::Progress(p) = phases.observe(line) {
                            if let Some(id) = task {
                                self.tasks.update(id, |t| apply_progress(t, &p));
                            }
                        }
                    }
                })
                .await?;

            if report.success() {
                return Ok(RunOutcome::Completed);
            }
            if report.killed || cancel.is_cancelled() {
                return Ok(RunOutcome::Stopped);
            }

            last_code = report.code;
            last_stderr = stderr_tail;
            if attempt + 1 < clients.len() {
                self.logs.push(format!(
                    "Client {} failed. Retrying next...",
                    client.unwrap_or("default")
                ));
            }
        }

        Ok(RunOutcome::Failed {
            code: last_code,
            hint: failure_hint(&last_stderr.join("\n")).map(str::to_string),
        })
    }

    /// Start a download now. Without `existing`, a waiting task is created and
    /// claimed at once; with it, that task is claimed (it must be waiting,
    /// paused or failed). Always leaves the task completed, paused or failed.
    pub async fn start_download(
        &self,
        url: &str,
        service: DownloadService,
        options: DownloadOptions,
        existing: Option<TaskId>,
    ) -> Result<RunOutcome> {
        let task = match existing {
            Some(id) => match self.tasks.claim(id) {
                Some(task) => task,
                None => {
                    return match self.tasks.get(id) {
                        None => Err(DownloaderError::TaskNotFound(id)),
                        Some(t) => Err(DownloaderError::InvalidInput(format!(
                            "task {} is {} and cannot be started",
                            id,
                            t.status.as_str()
                        ))),
                    };
                }
            },
            None => self.tasks.add_claimed(NewTask {
                url: url.to_string(),
                service,
                options,
                title: url.to_string(),
                thumbnail: None,
            }),
        };
        self.execute(task).await
    }

    /// Run a task already marked `Downloading` and record how it ended.
    pub async fn execute(&self, task: DownloadTask) -> Result<RunOutcome> {
        let run = self.register_run(task.id);
        self.execute_run(task, run).await
    }

    /// Same as [`execute`](Self::execute) with a run registered at claim time.
    pub async fn execute_run(&self, task: DownloadTask, run: TaskRun) -> Result<RunOutcome> {
        let result = self
            .run_single_download(&task.url, task.service, &task.options, Some(task.id), &run.cancel)
            .await;

        match &result {
            Ok(RunOutcome::Completed) => {
                self.tasks.update(task.id, |t| t.completed());
                self.logs.push("Process completed successfully!");
                self.events
                    .notice(NoticeLevel::Success, format!("Download Finished: {}", task.title));
            }
            Ok(RunOutcome::Stopped) => {
                self.tasks.update(task.id, |t| t.paused());
                self.logs.push("Download was manually stopped.");
            }
            Ok(RunOutcome::Failed { code, hint }) => {
                self.tasks.update(task.id, |t| t.failed());
                self.logs.push(format!("Process failed with code: {:?}", code));
                let message = match hint {
                    Some(h) => format!("Download Failed: {h}"),
                    None => "Download Failed".to_string(),
                };
                self.events.notice(NoticeLevel::Error, message);
            }
            Err(e) => {
                self.tasks.update(task.id, |t| t.failed());
                self.logs.push(format!("Download error: {e}"));
                log::error!("Download {} failed: {}", task.id, e);
                self.events
                    .notice(NoticeLevel::Error, format!("Download Failed: {e}"));
            }
        }
        self.finish_run(task.id, &run);
        result
    }

    /// Download each URL in order with the extractor. Items are not tasks.
    /// Failures are logged and skipped; a stop ends the batch early.
    pub async fn start_batch_download(
        &self,
        urls: &[String],
        options: &DownloadOptions,
    ) -> BatchReport {
        let mut report = BatchReport {
            total: urls.len(),
            ..Default::default()
        };
        if urls.is_empty() {
            return report;
        }

        let cancel = self.stop_token();
        self.logs
            .push(format!("[BATCH] Starting {} downloads...", urls.len()));

        for (i, url) in urls.iter().enumerate() {
            if cancel.is_cancelled() {
                report.stopped = true;
                break;
            }
            self.logs
                .push(format!("[{}/{}] Processing {}", i + 1, urls.len(), url));

            match self
                .run_single_download(url, DownloadService::Extractor, options, None, &cancel)
                .await
            {
                Ok(RunOutcome::Completed) => report.succeeded += 1,
                Ok(RunOutcome::Stopped) => {
                    report.stopped = true;
                    break;
                }
                Ok(RunOutcome::Failed { .. }) => {
                    self.logs.push(format!("Item {} failed. Continuing...", i + 1));
                    report.failed.push(url.clone());
                }
                Err(e) => {
                    self.logs
                        .push(format!("Item {} failed ({e}). Continuing...", i + 1));
                    report.failed.push(url.clone());
                }
            }
        }

        self.logs.push(format!(
            "[BATCH] Finished: {} succeeded, {} failed",
            report.succeeded,
            report.failed.len()
        ));
        self.events
            .notice(NoticeLevel::Success, "Batch Download Finished");
        report
    }

    /// Batch input as pasted text: one URL per line, blank lines ignored.
    pub async fn start_batch_download_text(
        &self,
        text: &str,
        options: &DownloadOptions,
    ) -> BatchReport {
        let urls = split_batch_lines(text);
        self.start_batch_download(&urls, options).await
    }
}
