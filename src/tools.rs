//! Tool discovery
//!
//! Locates the external binaries the core drives (the extractor, the fetcher and
//! ffmpeg) and knows the executable names a global stop must sweep for.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

/// External tools used by the download core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    /// yt-dlp class media extractor.
    Extractor,
    /// wget class HTTP fetcher.
    Fetcher,
    Ffmpeg,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Extractor => "yt-dlp",
            Tool::Fetcher => "wget",
            Tool::Ffmpeg => "ffmpeg",
        }
    }

    pub fn binary_name(&self) -> &'static str {
        #[cfg(target_os = "windows")]
        {
            match self {
                Tool::Extractor => "yt-dlp.exe",
                Tool::Fetcher => "wget.exe",
                Tool::Ffmpeg => "ffmpeg.exe",
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            match self {
                Tool::Extractor => "yt-dlp",
                Tool::Fetcher => "wget",
                Tool::Ffmpeg => "ffmpeg",
            }
        }
    }

    /// Names a bundled sidecar may carry next to the app executable.
    fn sidecar_names(&self) -> &'static [&'static str] {
        match self {
            Tool::Extractor => &["yt-dlp", "ytdlp", "yt-dlp.exe", "ytdlp.exe"],
            Tool::Fetcher => &["wget", "wget.exe"],
            Tool::Ffmpeg => &["ffmpeg", "ffmpeg.exe"],
        }
    }

    /// Common install locations outside of PATH (bundled macOS apps do not
    /// inherit the user's shell PATH).
    fn common_paths(&self) -> &'static [&'static str] {
        match self {
            Tool::Extractor => &[
                "/opt/homebrew/bin/yt-dlp",
                "/usr/local/bin/yt-dlp",
                "$HOME/.local/bin/yt-dlp",
                "/usr/bin/yt-dlp",
                "$HOME/.local/pipx/venvs/yt-dlp/bin/yt-dlp",
                "/opt/local/bin/yt-dlp",
            ],
            Tool::Fetcher => &[
                "/opt/homebrew/bin/wget",
                "/usr/local/bin/wget",
                "/usr/bin/wget",
                "/opt/local/bin/wget",
            ],
            Tool::Ffmpeg => &[
                "/opt/homebrew/bin/ffmpeg",
                "/usr/local/bin/ffmpeg",
                "/usr/bin/ffmpeg",
                "/opt/local/bin/ffmpeg",
            ],
        }
    }

    pub fn version_args(&self) -> &[&str] {
        match self {
            Tool::Extractor => &["--version"],
            Tool::Fetcher => &["--version"],
            Tool::Ffmpeg => &["-version"],
        }
    }
}

/// Result of probing one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub tool: Tool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

/// Finds tool binaries. Priority:
/// 1. configured bundled directory
/// 2. sidecar next to the running executable (or its `Resources` sibling)
/// 3. common install paths
/// 4. system PATH
#[derive(Debug, Clone)]
pub struct ToolLocator {
    bundled_dir: Option<PathBuf>,
    version_timeout: Duration,
}

impl Default for ToolLocator {
    fn default() -> Self {
        Self {
            bundled_dir: None,
            version_timeout: Duration::from_secs(5),
        }
    }
}

impl ToolLocator {
    pub fn new(bundled_dir: Option<PathBuf>) -> Self {
        Self {
            bundled_dir,
            ..Self::default()
        }
    }

    pub fn find(&self, tool: Tool) -> Option<PathBuf> {
        if let Some(dir) = &self.bundled_dir {
            if let Some(p) = find_in_dir(dir, tool) {
                return Some(p);
            }
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                if let Some(p) = find_in_dir(exe_dir, tool) {
                    log::info!("Found bundled {} sidecar at: {:?}", tool.as_str(), p);
                    return Some(p);
                }
                if let Some(p) = exe_dir
                    .parent()
                    .and_then(|parent| find_in_dir(&parent.join("Resources"), tool))
                {
                    log::info!("Found bundled {} in Resources at: {:?}", tool.as_str(), p);
                    return Some(p);
                }
            }
        }

        for template in tool.common_paths() {
            let Some(expanded) = expand_home(template) else {
                continue;
            };
            let path = PathBuf::from(expanded);
            if path.is_file() {
                log::info!("Found {} at: {:?}", tool.as_str(), path);
                return Some(path);
            }
        }

        which::which(tool.binary_name()).ok()
    }

    /// Like [`find`](Self::find) but falls back to the bare binary name so the
    /// OS resolves it at spawn time.
    pub fn resolve(&self, tool: Tool) -> PathBuf {
        self.find(tool).unwrap_or_else(|| {
            log::warn!(
                "Could not find {} in known locations, falling back to PATH lookup",
                tool.as_str()
            );
            PathBuf::from(tool.binary_name())
        })
    }

    pub async fn info(&self, tool: Tool) -> ToolInfo {
        let path = self.find(tool);
        let version = match &path {
            Some(p) => self.version(p, tool).await.ok(),
            None => None,
        };
        ToolInfo {
            tool,
            path,
            version,
        }
    }

    /// Get the version string from a tool.
    pub async fn version(&self, path: &Path, tool: Tool) -> Result<String> {
        let mut cmd = Command::new(path);
        cmd.args(tool.version_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = tokio::time::timeout(self.version_timeout, cmd.output())
            .await
            .context("Version check timed out")?
            .context("Failed to execute tool")?;

        if !output.status.success() {
            return Err(anyhow!(
                "Tool returned non-zero exit code: {}",
                output.status
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout, tool).ok_or_else(|| anyhow!("Could not parse version from output"))
    }
}

/// Commands run by a global stop to catch processes the handle-based kill
/// missed, e.g. a JS runtime spawned by the extractor.
pub fn sweep_commands() -> Vec<(String, Vec<String>)> {
    #[cfg(windows)]
    {
        const TARGETS: &[&str] = &[
            "yt-dlp.exe",
            "ytdlp-x86_64-pc-windows-msvc.exe",
            "ytdlp-x86_64-pc-windows-gnu.exe",
            "wget.exe",
            "wget-x86_64-pc-windows-msvc.exe",
            "wget-x86_64-pc-windows-gnu.exe",
            "ffmpeg.exe",
            "node.exe",
        ];
        TARGETS
            .iter()
            .map(|exe| {
                (
                    "taskkill".to_string(),
                    vec!["/F".into(), "/IM".into(), (*exe).to_string(), "/T".into()],
                )
            })
            .collect()
    }
    #[cfg(not(windows))]
    {
        ["yt-?dlp", "wget", "ffmpeg"]
            .iter()
            .map(|pattern| {
                (
                    "pkill".to_string(),
                    vec!["-9".into(), "-f".into(), (*pattern).to_string()],
                )
            })
            .collect()
    }
}

fn find_in_dir(dir: &Path, tool: Tool) -> Option<PathBuf> {
    std::iter::once(tool.binary_name())
        .chain(tool.sidecar_names().iter().copied())
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

fn expand_home(template: &str) -> Option<String> {
    if let Some(rest) = template.strip_prefix("$HOME") {
        let home = std::env::var_os("HOME")?;
        Some(format!("{}{}", home.to_string_lossy(), rest))
    } else {
        Some(template.to_string())
    }
}

/// Parse version string from tool output.
fn parse_version(output: &str, tool: Tool) -> Option<String> {
    let first_line = output.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }

    match tool {
        // "2024.01.01"
        Tool::Extractor => Some(first_line.to_string()),
        // "GNU Wget 1.21.4 built on linux-gnu." / "ffmpeg version 6.1.1 Copyright ..."
        Tool::Fetcher | Tool::Ffmpeg => {
            let parts: Vec<&str> = first_line.split_whitespace().collect();
            match parts.as_slice() {
                ["GNU", "Wget", v, ..] => Some(v.to_string()),
                ["ffmpeg", "version", v, ..] => Some(v.to_string()),
                _ => Some(first_line.to_string()),
            }
        }
    }
}
