//! Multi-Phase Progress Aggregator
//!
//! A merged video+audio download runs as sequential phases (video stream, audio
//! stream, then a silent merge), each printing its own 0-100% with its own byte
//! total. `PhaseState` folds those lines into one global percentage using the
//! size estimates gathered during analysis.
//!
//! Contract:
//! - the global percent never decreases within one attempt
//! - it stays at or below 99.9 while the process runs; only the engine sets 100
//!   after a zero exit code
//! - without estimates the per-phase percent is passed through unchanged

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{DownloadOptions, DownloadService};
use crate::progress::{cached_regex, parse_progress_line};

/// Highest percent shown while a process is still running.
pub const IN_FLIGHT_CAP: f64 = 99.9;

const DESTINATION_MARKER: &str = "Destination: ";
const EXTRACTOR_PROGRESS_TAG: &str = "[download]";

static FORMAT_COUNT_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Pre-fetched byte estimates for the phases of one download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimates {
    pub video: u64,
    pub audio: u64,
}

impl SizeEstimates {
    pub fn from_options(options: &DownloadOptions) -> Self {
        Self {
            video: options.estimated_video_size.unwrap_or(0),
            audio: options.estimated_audio_size.unwrap_or(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.video + self.audio
    }
}

/// Global progress after folding one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateProgress {
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub size: Option<String>,
}

/// What a line meant to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// A new output file was announced; the previous phase is finished.
    NewPhase { index: u32, destination: String },
    /// The tool announced how many formats (phases) it will fetch.
    PhaseCount(u32),
    Progress(AggregateProgress),
    /// Anything else. The caller logs it verbatim.
    Other,
}

/// Explicit aggregation state for one download attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseState {
    estimates: SizeEstimates,
    /// Only lines carrying the extractor's `[download]` tag count as progress.
    tagged_progress: bool,

    /// Sum of the real sizes of finished phases.
    pub completed_bytes: u64,
    /// 0 before any destination is announced, then 1, 2, ...
    pub phase_index: u32,
    /// Real total reported for the phase in progress.
    pub last_phase_actual_size: u64,
    pub last_destination: Option<String>,
    /// From a `Downloading N format(s)` announcement.
    pub detected_phases: Option<u32>,
    /// Highest percent reported so far.
    pub last_percent: f64,
}

impl PhaseState {
    pub fn new(estimates: SizeEstimates, service: DownloadService) -> Self {
        Self {
            estimates,
            tagged_progress: service == DownloadService::Extractor,
            completed_bytes: 0,
            phase_index: 0,
            last_phase_actual_size: 0,
            last_destination: None,
            detected_phases: None,
            last_percent: 0.0,
        }
    }

    pub fn for_options(options: &DownloadOptions, service: DownloadService) -> Self {
        Self::new(SizeEstimates::from_options(options), service)
    }

    /// Phases this job is expected to run: the announced count, else 2 when an
    /// audio estimate exists, else 1.
    pub fn target_phases(&self) -> u32 {
        self.detected_phases
            .unwrap_or(if self.estimates.audio > 0 { 2 } else { 1 })
    }

    /// Fold one output line into the state.
    pub fn observe(&mut self, line: &str) -> Observation {
        let line = line.trim();

        if let Some(n) = parse_format_count(line) {
            self.detected_phases = Some(n);
            return Observation::PhaseCount(n);
        }

        if let Some(destination) = parse_destination(line) {
            if self.last_destination.as_deref() == Some(destination) {
                return Observation::Other;
            }
            self.completed_bytes += self.last_phase_actual_size;
            self.phase_index += 1;
            self.last_phase_actual_size = 0;
            self.last_destination = Some(destination.to_string());
            return Observation::NewPhase {
                index: self.phase_index,
                destination: destination.to_string(),
            };
        }

        if self.tagged_progress && !line.contains(EXTRACTOR_PROGRESS_TAG) {
            return Observation::Other;
        }

        match parse_progress_line(line) {
            Some(p) => {
                self.last_phase_actual_size = p.total_bytes;
                let (percent, downloaded_bytes, total_bytes) =
                    self.blend(p.percent, p.downloaded_bytes, p.total_bytes);

                let percent = percent.clamp(0.0, IN_FLIGHT_CAP).max(self.last_percent);
                self.last_percent = percent;

                Observation::Progress(AggregateProgress {
                    percent,
                    downloaded_bytes,
                    total_bytes,
                    speed: p.speed_text,
                    eta: p.eta_text,
                    size: p.size_text,
                })
            }
            None => Observation::Other,
        }
    }

    /// Cross-phase byte accounting. Returns `(percent, downloaded, total)`.
    fn blend(&self, phase_percent: f64, phase_downloaded: u64, phase_total: u64) -> (f64, u64, u64) {
        let total_estimated = self.estimates.total();
        if total_estimated == 0 {
            return (phase_percent, phase_downloaded, phase_total);
        }

        let target_phases = self.target_phases();
        let downloaded = self.completed_bytes + phase_downloaded;

        // The estimate may be too small; grow the total so this phase alone
        // cannot push the percent to 100.
        let mut observed_total = self.completed_bytes + phase_total;
        if self.phase_index <= 1 && target_phases > 1 {
            observed_total += self.estimates.audio;
        }
        let total = total_estimated.max(observed_total);

        let mut percent = downloaded as f64 / total as f64 * 100.0;
        if percent >= IN_FLIGHT_CAP && self.phase_index < target_phases {
            percent = IN_FLIGHT_CAP;
        }

        (percent, downloaded, total)
    }
}

fn parse_format_count(line: &str) -> Option<u32> {
    cached_regex(&FORMAT_COUNT_RE, r"Downloading (\d+) format\(s\)")?
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn parse_destination(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once(DESTINATION_MARKER)?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
