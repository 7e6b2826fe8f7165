//! Link Classifier
//!
//! Maps a raw URL to the tool that should handle it, using string inspection only.
//! Never fails: unknown links fall back to the extractor, which covers a long tail
//! of sites.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::DownloadService;

/// Hosts handled by the chat/messaging share rule.
const MESSAGING_HOSTS: &[&str] = &["t.me", "telegram.me"];

/// Video/social platforms the extractor is known to handle.
const PLATFORM_HOSTS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "twitter.com",
    "x.com",
    "facebook.com",
    "instagram.com",
];

/// Extensions served directly by the fetcher.
const DIRECT_FILE_EXTS: &[&str] = &[
    // video
    "mp4", "mkv", "avi", "webm", "mov",
    // audio
    "mp3", "m4a", "flac", "wav", "ogg",
    // archives and disk images
    "zip", "rar", "7z", "tar", "gz", "iso", "dmg", "pkg",
    // executables
    "exe", "msi", "apk", "deb",
    // documents
    "pdf",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Video,
    Audio,
    File,
    Playlist,
    Telegram,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkClass {
    pub service: DownloadService,
    pub is_playlist: bool,
    pub content_type: ContentType,
    pub suggested_filename: Option<String>,
}

impl LinkClass {
    fn extractor(content_type: ContentType, is_playlist: bool) -> Self {
        Self {
            service: DownloadService::Extractor,
            is_playlist,
            content_type,
            suggested_filename: None,
        }
    }
}

/// Classify a URL. First matching rule wins:
/// 1. messaging share link -> extractor / telegram
/// 2. known platform host -> extractor / playlist or video
/// 3. direct file extension -> fetcher / file
/// 4. anything else -> extractor / video
pub fn classify(url: &str) -> LinkClass {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();
    let parsed = parse_lenient(trimmed);
    let host = parsed
        .as_ref()
        .and_then(|u| u.host_str())
        .map(|h| h.to_ascii_lowercase());

    let is_messaging = match host.as_deref() {
        Some(h) => MESSAGING_HOSTS.iter().any(|m| host_matches(h, m)),
        None => lower.contains("t.me/"),
    };
    if is_messaging {
        return LinkClass::extractor(ContentType::Telegram, false);
    }

    let is_platform = match host.as_deref() {
        Some(h) => PLATFORM_HOSTS.iter().any(|p| host_matches(h, p)),
        None => PLATFORM_HOSTS.iter().any(|p| lower.contains(p)),
    };
    if is_platform {
        let is_playlist = lower.contains("list=") || lower.contains("/playlist");
        let content_type = if is_playlist {
            ContentType::Playlist
        } else {
            ContentType::Video
        };
        return LinkClass::extractor(content_type, is_playlist);
    }

    let path = match parsed.as_ref() {
        Some(u) => u.path().to_string(),
        None => trimmed.split(['?', '#']).next().unwrap_or("").to_string(),
    };
    if has_direct_file_ext(&path) {
        let filename = path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("file")
            .to_string();
        return LinkClass {
            service: DownloadService::Fetcher,
            is_playlist: false,
            content_type: ContentType::File,
            suggested_filename: Some(filename),
        };
    }

    LinkClass::extractor(ContentType::Video, false)
}

/// Parses with an `https://` prefix when the scheme is missing, so bare
/// `youtube.com/watch?v=..` still yields a host.
fn parse_lenient(s: &str) -> Option<Url> {
    Url::parse(s)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| Url::parse(&format!("https://{s}")).ok())
        .filter(|u| u.host_str().map(|h| h.contains('.')).unwrap_or(false))
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn has_direct_file_ext(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or("");
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            DIRECT_FILE_EXTS.contains(&ext.as_str())
        }
        _ => false,
    }
}
