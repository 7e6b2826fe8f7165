use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::progress::cached_regex;

/// Playlist id prefixes accepted as bare input (uploads, liked, regular lists).
const PLAYLIST_ID_PREFIXES: &[&str] = &["PL", "UU", "LL"];

static URL_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Every http(s) URL in pasted text, normalized, first occurrence wins.
///
/// Trailing punctuation picked up from prose (`),` `.` `"`) is dropped and
/// fragments are stripped, so `https://a/x#t=1` and `https://a/x` count once.
pub fn extract_urls(text: &str) -> Vec<String> {
    let Some(re) = cached_regex(&URL_RE, r"https?://[^\s<>]+") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| trim_trailing_punct(m.as_str()))
        .filter_map(normalize_http_url)
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Splits batch input into one URL per non-empty line, trimmed, order preserved.
///
/// Unlike `extract_urls` this keeps anything the user typed on a line; the
/// extractor decides whether it is usable.
pub fn split_batch_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an http(s) URL and drop its fragment. Other schemes are rejected.
pub fn normalize_http_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.set_fragment(None);

    Some(url.to_string())
}

/// Expands a bare playlist id (`PL…`, `UU…`, `LL…`, at least 10 chars) into a
/// full playlist URL. Anything else is returned trimmed and unchanged.
pub fn expand_playlist_id(input: &str) -> String {
    let s = input.trim();
    let looks_like_id = !s.starts_with("http")
        && s.len() >= 10
        && PLAYLIST_ID_PREFIXES.iter().any(|p| s.starts_with(p))
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if looks_like_id {
        format!("https://www.youtube.com/playlist?list={s}")
    } else {
        s.to_string()
    }
}

/// Entry targeted by a playlist URL: the `v` and `index` query parameters.
pub fn requested_entry(url: &str) -> (Option<String>, Option<u32>) {
    let Ok(parsed) = Url::parse(url) else {
        return (None, None);
    };

    let mut video_id = None;
    let mut index = None;
    for (k, v) in parsed.query_pairs() {
        match k.as_ref() {
            "v" if !v.is_empty() => video_id = Some(v.into_owned()),
            "index" => index = v.parse::<u32>().ok(),
            _ => {}
        }
    }
    (video_id, index)
}

/// True when the URL (or bare input) carries a playlist identifier.
pub fn has_playlist_marker(url: &str) -> bool {
    url.contains("list=") || url.starts_with("PL")
}

/// True for hosts whose extractor output lists per-resolution formats with sizes.
pub fn is_quality_rich_host(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("youtube.com") || lower.contains("youtu.be")
}

pub fn youtube_embed_url(video_id: &str) -> String {
    format!("https://www.youtube.com/embed/{video_id}")
}

pub fn youtube_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Last path segment of a URL without query, used as a filename stem source.
pub fn last_path_segment(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end_matches(|ch: char| {
        matches!(
            ch,
            ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '?' | '"' | '\''
        )
    })
}
