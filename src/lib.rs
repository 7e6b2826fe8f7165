//! Orchestration core of a desktop download manager.
//!
//! Drives a yt-dlp class extractor and a wget class fetcher as child
//! processes: link classification and metadata lookup, an ordered task
//! queue that starts one download at a time, live multi-phase progress,
//! process supervision with a global stop, and persisted state.
//!
//! The entry point is [`Downloader`]; the modules below are public so hosts
//! and tests can use the pieces on their own.

pub mod aggregator;
pub mod classifier;
pub mod cleanup;
pub mod db;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod events;
pub mod logs;
pub mod metadata;
pub mod models;
pub mod process;
pub mod progress;
pub mod queue;
pub mod settings;
pub mod tasks;
pub mod tools;
pub mod url_utils;

pub use classifier::{classify, ContentType, LinkClass};
pub use downloader::{Downloader, DownloaderConfig};
pub use engine::{BatchReport, DownloadConfig, RunOutcome};
pub use error::{DownloaderError, Result};
pub use events::{DownloaderEvent, NoticeLevel};
pub use models::{
    DownloadOptions, DownloadService, DownloadTask, LinkAnalysis, MediaMetadata, NewTask,
    PlaylistEntry, QualityOption, SearchResult, SubtitleKind, SubtitleTrack, TaskId, TaskStatus,
};
pub use tasks::MoveDirection;
pub use tools::{Tool, ToolInfo};
