//! Progress Parser
//!
//! Stateless parsing of the progress lines printed by the extractor and the
//! fetcher, e.g.
//!
//! ```text
//! [download]  12.3% of ~10.00MiB at  2.41MiB/s ETA 00:04
//!   3072K ........ ........ 12% 5.21M 2m3s
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One parsed progress line. Only produced when a percent token is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLine {
    /// 0..=100, exactly as printed.
    pub percent: f64,
    /// Size text with the `~` approximation marker stripped, e.g. `10.00MiB`.
    pub size_text: Option<String>,
    pub speed_text: Option<String>,
    pub eta_text: Option<String>,
    /// 0 when the line carries no size.
    pub total_bytes: u64,
    /// `percent/100 * total_bytes`, 0 when the total is unknown.
    pub downloaded_bytes: u64,
}

static PERCENT_RE: OnceLock<Option<Regex>> = OnceLock::new();
static SIZE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static SPEED_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ETA_RE: OnceLock<Option<Regex>> = OnceLock::new();
static UNIT_RE: OnceLock<Option<Regex>> = OnceLock::new();

pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Parse a progress line. Returns `None` when the line has no percent token,
/// i.e. it is not a progress line.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let percent_re = cached_regex(&PERCENT_RE, r"(\d+(?:\.\d+)?)%")?;
    let percent = percent_re
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())?
        .min(100.0);

    let size_text = cached_regex(&SIZE_RE, r"of\s+~?\s*(\d+(?:\.\d+)?\s*[KMGT]?i?B)\b")
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let speed_text = cached_regex(&SPEED_RE, r"at\s+~?\s*(\d+(?:\.\d+)?\s*[KMGT]?i?B/s)")
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let eta_text = cached_regex(&ETA_RE, r"ETA\s+(\d+(?::\d+)+)")
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let total_bytes = size_text
        .as_deref()
        .and_then(parse_size_to_bytes)
        .unwrap_or(0);
    let downloaded_bytes = if total_bytes > 0 {
        ((percent / 100.0) * total_bytes as f64).round() as u64
    } else {
        0
    };

    Some(ProgressLine {
        percent,
        size_text,
        speed_text,
        eta_text,
        total_bytes,
        downloaded_bytes,
    })
}

/// Convert a human-readable size to bytes.
///
/// Binary units (`KiB`, `MiB`, `GiB`, `TiB`) use powers of 1024, decimal units
/// (`KB`, `MB`, `GB`, `TB`) powers of 1000. A leading `~` is ignored.
pub fn parse_size_to_bytes(s: &str) -> Option<u64> {
    let re = cached_regex(&UNIT_RE, r"^~?\s*(\d+(?:\.\d+)?)\s*([KMGT]?)(i?)B$")?;
    let caps = re.captures(s.trim())?;
    let num: f64 = caps.get(1)?.as_str().parse().ok()?;
    let exp = match caps.get(2).map(|m| m.as_str()).unwrap_or("") {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        _ => return None,
    };
    let base: f64 = if caps.get(3).map(|m| m.as_str()) == Some("i") {
        1024.0
    } else {
        1000.0
    };

    Some((num * base.powi(exp)).round() as u64)
}

/// Short human label for a byte count, e.g. `12.5 MB` (1024-based).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_extractor_line() {
        let p = parse_progress_line("[download]  12.3% of ~10.00MiB at  2.41MiB/s ETA 00:04")
            .unwrap();
        assert_eq!(p.percent, 12.3);
        assert_eq!(p.size_text.as_deref(), Some("10.00MiB"));
        assert_eq!(p.speed_text.as_deref(), Some("2.41MiB/s"));
        assert_eq!(p.eta_text.as_deref(), Some("00:04"));
        assert_eq!(p.total_bytes, 10 * 1024 * 1024);
        assert_eq!(p.downloaded_bytes, 1_289_748);
    }

    #[test]
    fn percent_matches_text_exactly() {
        for text in ["0%", "0.1%", "45.6%", "99.9%", "100%", "100.0%"] {
            let line = format!("[download] {text} of 1.00MiB");
            let expected: f64 = text.trim_end_matches('%').parse().unwrap();
            let p = parse_progress_line(&line).unwrap();
            assert_eq!(p.percent, expected);
            assert!((0.0..=100.0).contains(&p.percent));
        }
    }

    #[test]
    fn no_percent_is_not_progress() {
        assert!(parse_progress_line("[download] Destination: video.f137.mp4").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn fetcher_dot_line_has_percent_only() {
        let p = parse_progress_line("  3072K ........ ........ 12% 5.21M 2m3s").unwrap();
        assert_eq!(p.percent, 12.0);
        assert_eq!(p.total_bytes, 0);
        assert_eq!(p.downloaded_bytes, 0);
    }

    #[test]
    fn long_eta_is_kept() {
        let p = parse_progress_line("[download]  1.0% of 2.00GiB at 1.00MiB/s ETA 01:05:30")
            .unwrap();
        assert_eq!(p.eta_text.as_deref(), Some("01:05:30"));
    }

    #[test]
    fn binary_and_decimal_units() {
        assert_eq!(parse_size_to_bytes("12.5MiB"), Some(13_107_200));
        assert_eq!(parse_size_to_bytes("12.5MB"), Some(12_500_000));
        assert_eq!(parse_size_to_bytes("1KiB"), Some(1024));
        assert_eq!(parse_size_to_bytes("1KB"), Some(1000));
        assert_eq!(parse_size_to_bytes("2GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size_to_bytes("1TB"), Some(1_000_000_000_000));
        assert_eq!(parse_size_to_bytes("~3.00MiB"), Some(3 * 1024 * 1024));
        assert_eq!(parse_size_to_bytes("512B"), Some(512));
        assert_eq!(parse_size_to_bytes("N/A"), None);
    }

    #[test]
    fn decimal_size_on_line() {
        let p = parse_progress_line("[download]  50.0% of 10.00MB").unwrap();
        assert_eq!(p.total_bytes, 10_000_000);
        assert_eq!(p.downloaded_bytes, 5_000_000);
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10 MB");
    }
}
