//! Heuristic removal of partial downloads.
//!
//! The external tools name their temp files themselves, so a task's leftovers
//! are found by substring match against words taken from the task's title and
//! URL filename. This can miss fragments and can hit an unrelated temp file
//! that shares a word; it is best-effort and never blocks a removal.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::logs::LogBuffer;
use crate::models::DownloadTask;
use crate::progress::cached_regex;
use crate::url_utils::last_path_segment;

const TEMP_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp", ".tmp", ".unknown_video.part"];
const FRAGMENT_MARKER: &str = ".ytdl-";

static TITLE_SUFFIX_RE: OnceLock<Option<Regex>> = OnceLock::new();
static MEDIA_EXT_RE: OnceLock<Option<Regex>> = OnceLock::new();
static NON_ALNUM_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Words identifying a task's files: the first word of the cleaned title and
/// of the cleaned URL filename, when longer than three characters.
pub fn search_terms(task: &DownloadTask) -> Vec<String> {
    let mut terms = Vec::new();

    let title = strip(
        &TITLE_SUFFIX_RE,
        r"(?i)\.(mp4|mkv|webm|avi|mp3|zip|rar|exe|pdf|iso)$|\.part$|\.ytdl$|\.temp$|\.tmp$",
        &task.title,
    );
    if let Some(word) = primary_word(&title) {
        terms.push(word);
    }

    if let Some(file) = last_path_segment(&task.url) {
        let stem = strip(
            &MEDIA_EXT_RE,
            r"(?i)\.(mp4|mkv|webm|avi|mp3|zip|rar|exe|pdf|iso)$",
            &file,
        );
        if let Some(word) = primary_word(&stem) {
            terms.push(word);
        }
    }

    terms
}

pub fn is_temp_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    TEMP_SUFFIXES.iter().any(|s| lower.ends_with(s)) || lower.contains(FRAGMENT_MARKER)
}

/// True when a temp file name carries one of the terms or the task id.
pub fn matches_task(name: &str, terms: &[String], task: &DownloadTask) -> bool {
    let lower = name.to_lowercase();
    terms
        .iter()
        .any(|t| t.chars().count() > 2 && lower.contains(&t.to_lowercase()))
        || lower.contains(&task.id.to_string())
}

/// Delete the task's temp files from `dir`. Returns how many were deleted.
/// Failures are logged and never propagated.
pub async fn cleanup_task_files(dir: &Path, task: &DownloadTask, logs: &LogBuffer) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            logs.push(format!("Cleanup failed: {e}"));
            log::warn!("Could not read {}: {}", dir.display(), e);
            return 0;
        }
    };

    let terms = search_terms(task);
    logs.push(format!("Scanning for fragments of \"{}\"...", task.title));

    let mut count = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                logs.push(format!("Cleanup failed: {e}"));
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_temp_file(&name) || !matches_task(&name, &terms, task) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                logs.push(format!("Deleted: {name}"));
                count += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("could not delete {}: {}", name, e),
        }
    }

    if count > 0 {
        logs.push(format!("Cleaned up {count} file(s)."));
    } else {
        logs.push("No matching fragments found for deletion.");
    }
    count
}

fn strip(cell: &'static OnceLock<Option<Regex>>, pattern: &str, text: &str) -> String {
    match cached_regex(cell, pattern) {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

fn primary_word(text: &str) -> Option<String> {
    let spaced = match cached_regex(&NON_ALNUM_RE, r"(?i)[^a-z0-9]") {
        Some(re) => re.replace_all(text, " ").into_owned(),
        None => text.to_string(),
    };
    let cleaned = spaced.trim();
    if cleaned.len() <= 3 {
        return None;
    }
    cleaned.split(' ').next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::DownloadService;

    fn task(title: &str, url: &str) -> DownloadTask {
        DownloadTask::new(url, DownloadService::Fetcher, Default::default(), title, None, 1)
    }

    #[test]
    fn terms_come_from_title_and_url_filename() {
        let t = task("Holiday_Trip 2024.mp4", "https://cdn.example.com/files/archive-backup.zip?x=1");
        assert_eq!(search_terms(&t), vec!["Holiday", "archive"]);
    }

    #[test]
    fn short_titles_yield_no_terms() {
        let t = task("a b", "https://example.com/");
        assert!(search_terms(&t).is_empty());
    }

    #[test]
    fn temp_detection_is_case_insensitive() {
        assert!(is_temp_file("Video.MP4.PART"));
        assert!(is_temp_file("clip.f137.mp4.ytdl"));
        assert!(is_temp_file("clip.mp4.ytdl-frag12"));
        assert!(!is_temp_file("clip.mp4"));
    }

    #[tokio::test]
    async fn deletes_only_matching_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let t = task("Holiday Trip", "https://www.youtube.com/watch?v=abc");
        let by_id = format!("{}.tmp", t.id);
        for name in [
            "Holiday Trip.f137.mp4.part",
            "Holiday Trip.mp4",
            "Other.mp4.part",
            by_id.as_str(),
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let logs = LogBuffer::new(100, EventBus::new());
        let deleted = cleanup_task_files(dir.path(), &t, &logs).await;
        assert_eq!(deleted, 2);
        assert!(dir.path().join("Holiday Trip.mp4").exists());
        assert!(dir.path().join("Other.mp4.part").exists());
        assert!(!dir.path().join("Holiday Trip.f137.mp4.part").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let logs = LogBuffer::new(100, EventBus::new());
        let t = task("Holiday Trip", "https://example.com/a");
        let n = cleanup_task_files(Path::new("/definitely/not/here"), &t, &logs).await;
        assert_eq!(n, 0);
    }
}
