//! Metadata Resolver
//!
//! Runs the extractor in JSON-dump mode to turn a URL into a `MediaMetadata`
//! (playlist entries, quality tiers with size estimates, subtitle tracks), and
//! runs extractor searches.
//!
//! Notes:
//! - Nothing here downloads media.
//! - Lookups are tracked in the supervisor under synthetic keys so a global
//!   stop can kill them, and they run concurrently with downloads.
//! - A metadata timeout applies here only, never to downloads.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloaderError, Result};
use crate::models::{
    MediaMetadata, PlaylistEntry, QualityOption, SearchResult, SubtitleKind, SubtitleTrack,
};
use crate::process::{ProcessKey, ProcessSupervisor};
use crate::progress::format_bytes;
use crate::tools::{Tool, ToolLocator};
use crate::url_utils::{
    has_playlist_marker, is_quality_rich_host, requested_entry, youtube_watch_url,
};

const SEARCH_RESULT_COUNT: u32 = 10;
const MIN_LISTED_HEIGHT: u64 = 144;

/// Where to find the extractor and how to call it for lookups.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub extractor_path: PathBuf,

    /// Extra arguments injected into every lookup (e.g. a proxy).
    pub global_args: Vec<String>,

    /// Timeout for metadata and search calls (not for downloads).
    pub metadata_timeout: Duration,

    /// JavaScript runtime the extractor may use for challenge solving.
    pub js_runtime: Option<String>,
}

impl ResolverConfig {
    pub fn new(extractor_path: PathBuf) -> Self {
        Self {
            extractor_path,
            global_args: vec![],
            metadata_timeout: Duration::from_secs(30),
            js_runtime: Some("node".to_string()),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::discover(&ToolLocator::default())
    }
}

impl ResolverConfig {
    pub fn discover(locator: &ToolLocator) -> Self {
        Self::new(locator.resolve(Tool::Extractor))
    }
}

#[derive(Debug, Clone)]
pub struct MetadataResolver {
    cfg: ResolverConfig,
    supervisor: ProcessSupervisor,
}

impl MetadataResolver {
    pub fn new(cfg: ResolverConfig, supervisor: ProcessSupervisor) -> Self {
        Self { cfg, supervisor }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.cfg
    }

    /// Resolve a URL into metadata.
    ///
    /// The primary call (`--dump-single-json --flat-playlist`) must produce
    /// JSON or the whole resolve fails. For a single video on a quality-rich
    /// host a second, full-format call enumerates quality tiers; its failure
    /// only degrades to a static quality list, unless `cancel` fired.
    pub async fn resolve(&self, url: &str, cancel: &CancellationToken) -> Result<MediaMetadata> {
        self.resolve_as(ProcessKey::Metadata, url, cancel).await
    }

    /// [`resolve`](Self::resolve) with both calls tracked under `key`.
    pub async fn resolve_as(
        &self,
        key: ProcessKey,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<MediaMetadata> {
        let primary = self
            .dump_json(
                key,
                &["--dump-single-json", "--flat-playlist", "--no-download", "--no-check-certificate"],
                url,
                cancel,
            )
            .await?;

        let mut meta = parse_primary(&primary, url);

        if !meta.is_playlist && is_quality_rich_host(url) {
            match self
                .dump_json(
                    key,
                    &["--dump-single-json", "--no-download", "--no-check-certificate"],
                    url,
                    cancel,
                )
                .await
            {
                Ok(rich) => {
                    meta.available_qualities = Some(parse_qualities(&rich));
                    if let Some(subs) = parse_subtitles(&rich) {
                        meta.available_subtitles = Some(subs);
                    }
                }
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) => {
                    log::warn!("Could not fetch available qualities for {}: {}", url, e);
                    meta.available_qualities = Some(fallback_qualities());
                }
            }
        }

        Ok(meta)
    }

    /// Search the extractor's default site. Results are deduplicated by id.
    pub async fn search(&self, query: &str, cancel: &CancellationToken) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DownloaderError::InvalidInput("empty search query".into()));
        }

        let mut cmd = self.command();
        cmd.arg(format!("ytsearch{}:{}", SEARCH_RESULT_COUNT, query))
            .args(["--dump-json", "--no-download"]);

        let out = self
            .supervisor
            .run_collect(
                ProcessKey::Search,
                Tool::Extractor.as_str(),
                cmd,
                cancel,
                Some(self.cfg.metadata_timeout),
            )
            .await?;

        let mut seen = HashSet::new();
        let results: Vec<SearchResult> = out
            .stdout
            .iter()
            .filter(|l| looks_like_json_object(l))
            .filter_map(|l| parse_search_line(l))
            .filter(|r| seen.insert(r.id.clone()))
            .collect();

        if results.is_empty() && !out.report.success() {
            return Err(DownloaderError::ProcessExit {
                tool: Tool::Extractor.as_str().to_string(),
                code: out.report.code,
            });
        }
        Ok(results)
    }

    /// Run the extractor with `args` and parse its stdout as one JSON document.
    async fn dump_json(
        &self,
        key: ProcessKey,
        args: &[&str],
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut cmd = self.command();
        cmd.args(args).arg(url);

        let out = self
            .supervisor
            .run_collect(
                key,
                Tool::Extractor.as_str(),
                cmd,
                cancel,
                Some(self.cfg.metadata_timeout),
            )
            .await?;

        if out.report.killed {
            return Err(DownloaderError::Extraction(format!("lookup of {url} was stopped")));
        }

        let stdout = out.stdout.join("\n");
        if stdout.trim().is_empty() {
            let stderr = out.stderr.join("\n");
            if !stderr.is_empty() {
                log::warn!("yt-dlp stderr: {}", stderr);
            }
            return Err(DownloaderError::Extraction(
                "No metadata returned from yt-dlp".to_string(),
            ));
        }

        serde_json::from_str(&stdout)
            .map_err(|e| DownloaderError::Extraction(format!("invalid yt-dlp JSON: {e}")))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cfg.extractor_path);
        if let Some(runtime) = &self.cfg.js_runtime {
            cmd.args(["--js-runtimes", runtime.as_str()]);
        }
        cmd.args(&self.cfg.global_args);
        cmd
    }
}

fn looks_like_json_object(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{') && t.ends_with('}')
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str()).filter(|s| !s.is_empty())
}

fn first_thumbnail(v: &Value) -> Option<&str> {
    v.get("thumbnails")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| str_field(t, "url"))
}

fn format_size(format: &Value) -> u64 {
    format
        .get("filesize")
        .and_then(|x| x.as_u64())
        .filter(|s| *s > 0)
        .or_else(|| format.get("filesize_approx").and_then(|x| x.as_u64()))
        .or_else(|| {
            format
                .get("filesize_approx")
                .and_then(|x| x.as_f64())
                .map(|f| f as u64)
        })
        .unwrap_or(0)
}

/// Build metadata from the flat-playlist JSON document.
pub fn parse_primary(v: &Value, url: &str) -> MediaMetadata {
    let entries_json = v.get("entries").and_then(|e| e.as_array());

    let is_playlist = str_field(v, "_type") == Some("playlist")
        || entries_json.is_some()
        || has_playlist_marker(url);

    let title = str_field(v, "title")
        .map(str::to_string)
        .unwrap_or_else(|| (if is_playlist { "Playlist" } else { "Unknown Title" }).to_string());

    let thumbnail = str_field(v, "thumbnail")
        .or_else(|| first_thumbnail(v))
        .or_else(|| {
            entries_json
                .and_then(|e| e.first())
                .and_then(|e| str_field(e, "thumbnail"))
        })
        .unwrap_or_default()
        .to_string();

    let entries = is_playlist.then(|| {
        entries_json
            .map(|list| {
                list.iter()
                    .enumerate()
                    .map(|(i, e)| parse_entry(e, i))
                    .collect()
            })
            .unwrap_or_default()
    });

    let (requested_video_id, requested_index) = requested_entry(url);

    MediaMetadata {
        id: str_field(v, "id").map(str::to_string),
        title,
        thumbnail,
        is_playlist,
        entries,
        available_qualities: None,
        available_subtitles: parse_subtitles(v),
        requested_video_id,
        requested_index,
    }
}

fn parse_entry(e: &Value, i: usize) -> PlaylistEntry {
    let id = str_field(e, "id").map(str::to_string);
    let url = str_field(e, "url")
        .or_else(|| str_field(e, "webpage_url"))
        .map(str::to_string)
        .or_else(|| id.as_deref().map(youtube_watch_url))
        .unwrap_or_default();

    PlaylistEntry {
        title: str_field(e, "title")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Video {}", i + 1)),
        thumbnail: str_field(e, "thumbnail")
            .or_else(|| first_thumbnail(e))
            .unwrap_or_default()
            .to_string(),
        id: id.unwrap_or_else(|| i.to_string()),
        url,
        index: i as u32 + 1,
    }
}

/// Quality tiers from a full format list, best first.
///
/// Each height keeps its largest format; the tier size is that video size plus
/// the largest audio-only size. A synthetic `best` tier with unknown size is
/// always first.
pub fn parse_qualities(v: &Value) -> Vec<QualityOption> {
    let formats: &[Value] = v
        .get("formats")
        .and_then(|f| f.as_array())
        .map(|f| f.as_slice())
        .unwrap_or(&[]);

    let is_audio_only = |f: &Value| {
        let acodec = str_field(f, "acodec");
        let vcodec = str_field(f, "vcodec");
        acodec.is_some() && acodec != Some("none") && matches!(vcodec, None | Some("none"))
    };

    let audio_size = formats
        .iter()
        .filter(|f| is_audio_only(*f))
        .map(format_size)
        .max()
        .unwrap_or(0);

    // height -> largest size at that height
    let mut by_height: BTreeMap<u64, u64> = BTreeMap::new();
    for f in formats {
        let Some(height) = f.get("height").and_then(|h| h.as_u64()).filter(|h| *h > 0) else {
            continue;
        };
        let size = by_height.entry(height).or_insert(0);
        *size = (*size).max(format_size(f));
    }

    let mut qualities = vec![QualityOption::new("best", "Best Available")];

    qualities.extend(
        by_height
            .iter()
            .rev()
            .filter(|(h, _)| **h >= MIN_LISTED_HEIGHT)
            .map(|(h, video_size)| {
                let total = video_size + audio_size;
                let label = if total > 0 {
                    format!("{}p (~{})", h, format_bytes(total))
                } else {
                    format!("{}p", h)
                };
                QualityOption {
                    value: format!("{}p", h),
                    label,
                    estimated_size_bytes: total,
                }
            }),
    );

    if audio_size > 0 {
        qualities.push(QualityOption {
            value: "audio".to_string(),
            label: format!("Audio Only (MP3) (~{})", format_bytes(audio_size)),
            estimated_size_bytes: audio_size,
        });
    }

    qualities
}

/// Static tiers used when the format enumeration call fails.
pub fn fallback_qualities() -> Vec<QualityOption> {
    vec![
        QualityOption::new("best", "Best Available"),
        QualityOption::new("1080p", "1080p"),
        QualityOption::new("720p", "720p"),
        QualityOption::new("480p", "480p"),
        QualityOption::new("audio", "Audio Only"),
    ]
}

/// Manual tracks first, then automatic captions for languages not already
/// covered. `None` when there are no tracks at all.
pub fn parse_subtitles(v: &Value) -> Option<Vec<SubtitleTrack>> {
    fn track_name(lang: &str, formats: &Value) -> String {
        formats
            .as_array()
            .and_then(|fs| fs.iter().find_map(|f| str_field(f, "name")))
            .unwrap_or(lang)
            .to_string()
    }

    let mut tracks: Vec<SubtitleTrack> = Vec::new();

    if let Some(manual) = v.get("subtitles").and_then(|s| s.as_object()) {
        for (lang, formats) in manual {
            tracks.push(SubtitleTrack {
                lang: lang.clone(),
                name: track_name(lang, formats),
                kind: SubtitleKind::Manual,
            });
        }
    }

    if let Some(auto) = v.get("automatic_captions").and_then(|s| s.as_object()) {
        for (lang, formats) in auto {
            if tracks.iter().any(|t| &t.lang == lang) {
                continue;
            }
            tracks.push(SubtitleTrack {
                lang: lang.clone(),
                name: format!("{} (Auto)", track_name(lang, formats)),
                kind: SubtitleKind::Auto,
            });
        }
    }

    (!tracks.is_empty()).then_some(tracks)
}

/// One `--dump-json` search line. Lines without an id are skipped.
pub fn parse_search_line(line: &str) -> Option<SearchResult> {
    let v: Value = serde_json::from_str(line).ok()?;
    let id = str_field(&v, "id")?.to_string();

    let duration = v
        .get("duration")
        .and_then(|d| d.as_f64())
        .map(format_duration)
        .unwrap_or_else(|| "N/A".to_string());

    Some(SearchResult {
        title: str_field(&v, "title").unwrap_or_default().to_string(),
        thumbnail: str_field(&v, "thumbnail")
            .or_else(|| first_thumbnail(&v))
            .unwrap_or_default()
            .to_string(),
        duration,
        webpage_url: str_field(&v, "webpage_url")
            .map(str::to_string)
            .unwrap_or_else(|| youtube_watch_url(&id)),
        id,
    })
}

/// `m:ss`, e.g. 125 s -> `2:05`.
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "N/A".to_string();
    }
    let total = seconds as u64;
    format!("{}:{:02}", total / 60, total % 60)
}
