use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a queued download. Generated at creation and never reused.
pub type TaskId = Uuid;

/// Which external tool handles a task.
/// - `Extractor`: yt-dlp class tool, resolves media pages into streams
/// - `Fetcher`: wget class tool, plain HTTP download with custom headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadService {
    Extractor,
    Fetcher,
}

impl DownloadService {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadService::Extractor => "extractor",
            DownloadService::Fetcher => "fetcher",
        }
    }
}

/// Lifecycle status of a task.
///
/// `analyzing -> waiting -> downloading -> {completed | failed | paused}`;
/// `failed`/`paused` go back to `waiting` through an explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Analyzing,
    Waiting,
    Downloading,
    Paused,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
        }
    }

    /// Statuses backed by a live process (or a pending analysis) that cannot
    /// survive a restart.
    pub fn is_transient(self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Analyzing)
    }

    /// Statuses a global stop coerces to `Paused`.
    pub fn is_interruptible(self) -> bool {
        matches!(
            self,
            TaskStatus::Downloading | TaskStatus::Waiting | TaskStatus::Analyzing
        )
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Failed)
    }
}

/// Per-task download options chosen in the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// `best`, `audio`, or a resolution token such as `720p`. `None` means `best`.
    pub quality: Option<String>,
    /// Extractor playlist item range, e.g. `1,3,5-7`.
    pub playlist_items: Option<String>,
    /// Fetcher only: custom output filename.
    pub output_filename: Option<String>,
    /// Fetcher only: referer header.
    pub referer: Option<String>,
    /// Subtitle language code, or `none`.
    pub subtitle_lang: Option<String>,
    pub embed_subtitles: bool,
    /// Overrides the base download directory for this task.
    pub download_path: Option<PathBuf>,
    /// Pre-fetched size estimates used by the progress aggregator.
    pub estimated_video_size: Option<u64>,
    pub estimated_audio_size: Option<u64>,
}

impl DownloadOptions {
    pub fn quality_or_best(&self) -> &str {
        self.quality.as_deref().unwrap_or("best")
    }

    pub fn is_audio_only(&self) -> bool {
        self.quality_or_best() == "audio"
    }

    /// Subtitle language to request, if any. Never set for audio-only downloads.
    pub fn wanted_subtitle_lang(&self) -> Option<&str> {
        match self.subtitle_lang.as_deref() {
            Some(lang) if !lang.is_empty() && lang != "none" && !self.is_audio_only() => {
                Some(lang)
            }
            _ => None,
        }
    }

    pub fn estimated_total(&self) -> u64 {
        self.estimated_video_size.unwrap_or(0) + self.estimated_audio_size.unwrap_or(0)
    }
}

/// A unit of work in the queue. Persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub url: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub service: DownloadService,
    pub options: DownloadOptions,
    pub status: TaskStatus,

    /// 0..=100, never regresses while downloading.
    pub progress: f64,
    pub downloaded_bytes: u64,
    /// May be an estimate refined as phases complete.
    pub total_bytes: u64,

    // Last-observed strings from the tool's own output.
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub size: Option<String>,

    /// Dense 1..N rank, defines display and dequeue order.
    pub queue_order: u32,
    pub created_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        url: S1,
        service: DownloadService,
        options: DownloadOptions,
        title: S2,
        thumbnail: Option<String>,
        queue_order: u32,
    ) -> Self {
        let total_bytes = options.estimated_total();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            title: title.into(),
            thumbnail,
            service,
            options,
            status: TaskStatus::Waiting,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes,
            speed: None,
            eta: None,
            size: None,
            queue_order,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Marks the task finished: progress pinned to 100, live fields cleared.
    pub fn completed(mut self) -> Self {
        self.status = TaskStatus::Completed;
        self.progress = 100.0;
        if self.total_bytes > 0 {
            self.downloaded_bytes = self.total_bytes;
        }
        self.speed = None;
        self.eta = None;
        self
    }

    pub fn paused(mut self) -> Self {
        self.status = TaskStatus::Paused;
        self.speed = None;
        self.eta = None;
        self
    }

    pub fn failed(mut self) -> Self {
        self.status = TaskStatus::Failed;
        self.speed = None;
        self.eta = None;
        self
    }
}

/// Input record for bulk insertion.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub url: String,
    pub service: DownloadService,
    pub options: DownloadOptions,
    pub title: String,
    pub thumbnail: Option<String>,
}

/// One item of a playlist returned during analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    pub thumbnail: String,
    /// 1-based position in the playlist.
    pub index: u32,
}

/// A selectable quality tier with its estimated combined size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityOption {
    pub value: String,
    pub label: String,
    /// 0 when unknown.
    pub estimated_size_bytes: u64,
}

impl QualityOption {
    pub fn new(value: &str, label: &str) -> Self {
        Self {
            value: value.to_string(),
            label: label.to_string(),
            estimated_size_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleKind {
    Manual,
    Auto,
    Translated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub lang: String,
    pub name: String,
    pub kind: SubtitleKind,
}

/// Result of analyzing a URL. Produced fresh per call, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub id: Option<String>,
    pub title: String,
    pub thumbnail: String,
    pub is_playlist: bool,
    /// Present iff `is_playlist`.
    pub entries: Option<Vec<PlaylistEntry>>,
    pub available_qualities: Option<Vec<QualityOption>>,
    pub available_subtitles: Option<Vec<SubtitleTrack>>,
    /// Set when the input URL pointed at one entry inside a playlist.
    pub requested_video_id: Option<String>,
    pub requested_index: Option<u32>,
}

/// One extractor search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    /// `m:ss`, or `N/A` when unknown.
    pub duration: String,
    pub webpage_url: String,
}

/// What `analyze_link` hands back to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAnalysis {
    pub direct_url: String,
    pub embed_url: Option<String>,
    pub is_playlist: bool,
    pub metadata: Option<MediaMetadata>,
}
