//! Process Supervisor
//!
//! Owns the registry of running external processes. Every process is keyed by
//! the task it belongs to, or by a synthetic key for lookups that are not tasks
//! (metadata, analysis, search), so each can be killed on its own.
//!
//! Only the flow that spawned a process touches its registry entry, except for
//! `kill_one`/`kill_all`, which signal the owning flow through a broadcast
//! channel. The owner performs the actual kill and reaps the child.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{DownloaderError, Result};
use crate::models::TaskId;
#[cfg(windows)]
use crate::tools::CREATE_NO_WINDOW;
use crate::tools::sweep_commands;

/// Registry key of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKey {
    Task(TaskId),
    /// A batch item, which has no task.
    Batch,
    Metadata,
    Analysis,
    Search,
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKey::Task(id) => write!(f, "{id}"),
            ProcessKey::Batch => f.write_str("batch"),
            ProcessKey::Metadata => f.write_str("metadata"),
            ProcessKey::Analysis => f.write_str("analysis"),
            ProcessKey::Search => f.write_str("search"),
        }
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// How a streamed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// True when the process was killed through the supervisor or a cancelled token.
    pub killed: bool,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        !self.killed && self.code == Some(0)
    }
}

#[derive(Debug)]
struct Tracked {
    generation: u64,
    pid: Option<u32>,
    kill_tx: broadcast::Sender<()>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Run the OS-level sweep (`pkill`/`taskkill`) on `kill_all`.
    pub os_sweep: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { os_sweep: true }
    }
}

/// Registry of running external processes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    registry: Arc<RwLock<HashMap<ProcessKey, Tracked>>>,
    next_generation: Arc<AtomicU64>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a process under `key`, replacing any previous entry. Returns the
    /// entry's generation and the receiver the owner must watch for kill requests.
    pub async fn track(
        &self,
        key: ProcessKey,
        pid: Option<u32>,
    ) -> (u64, broadcast::Receiver<()>) {
        let (kill_tx, kill_rx) = broadcast::channel::<()>(1);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.registry.write().await.insert(
            key,
            Tracked {
                generation,
                pid,
                kill_tx,
            },
        );
        (generation, kill_rx)
    }

    /// Drop the entry for `key` if it still belongs to `generation`.
    pub async fn untrack(&self, key: ProcessKey, generation: u64) {
        let mut registry = self.registry.write().await;
        if registry.get(&key).map(|t| t.generation) == Some(generation) {
            registry.remove(&key);
        }
    }

    pub async fn is_tracked(&self, key: ProcessKey) -> bool {
        self.registry.read().await.contains_key(&key)
    }

    pub async fn tracked_keys(&self) -> Vec<ProcessKey> {
        self.registry.read().await.keys().copied().collect()
    }

    /// Ask the owner of `key` to kill its process. Returns false when nothing
    /// is tracked under that key.
    pub async fn kill_one(&self, key: ProcessKey) -> bool {
        let entry = self.registry.write().await.remove(&key);
        match entry {
            Some(tracked) => {
                let _ = tracked.kill_tx.send(());
                log::info!("Sent kill signal to process {} (pid {:?})", key, tracked.pid);
                true
            }
            None => false,
        }
    }

    /// Kill every tracked process, then sweep the OS process table for the
    /// known tool executables. Returns the number of tracked processes signalled.
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<(ProcessKey, Tracked)> = self.registry.write().await.drain().collect();
        for (key, tracked) in &drained {
            let _ = tracked.kill_tx.send(());
            log::info!("Sent kill signal to process {} (pid {:?})", key, tracked.pid);
        }

        if self.config.os_sweep {
            sweep_os_processes().await;
        }

        drained.len()
    }

    /// Spawn `cmd`, feed its output lines to `on_line` in emission order, and
    /// wait for it to exit.
    ///
    /// The process is killed when `kill_one(key)`/`kill_all` is called, when
    /// `cancel` fires, or when `timeout` elapses (the latter is an error).
    pub async fn run_streaming<F>(
        &self,
        key: ProcessKey,
        tool: &str,
        mut cmd: Command,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        mut on_line: F,
    ) -> Result<ExitReport>
    where
        F: FnMut(Stream, &str),
    {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|source| DownloaderError::ProcessSpawn {
            tool: tool.to_string(),
            source,
        })?;

        if cancel.is_cancelled() {
            let _ = child.kill().await;
            log::info!("Process {} halted immediately after spawn", key);
            return Ok(ExitReport {
                code: None,
                killed: true,
            });
        }

        let (generation, mut kill_rx) = self.track(key, child.id()).await;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            self.untrack(key, generation).await;
            return Err(DownloaderError::Io(std::io::Error::other(format!(
                "failed to capture {tool} output"
            ))));
        };
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut kill_watch = true;
        let mut killed = false;
        let mut timed_out = false;

        while stdout_open || stderr_open {
            tokio::select! {
                signal = kill_rx.recv(), if kill_watch => {
                    match signal {
                        Err(broadcast::error::RecvError::Closed) => {
                            // Entry replaced by a newer process under the same key.
                            kill_watch = false;
                        }
                        _ => {
                            log::info!("Process {} received kill signal", key);
                            killed = true;
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    log::info!("Process {} cancelled", key);
                    killed = true;
                    break;
                }
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(l)) => on_line(Stream::Stdout, &l),
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            log::error!("Error reading {} stdout: {}", tool, e);
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(l)) => on_line(Stream::Stderr, &l),
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            log::error!("Error reading {} stderr: {}", tool, e);
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        if killed || timed_out {
            let _ = child.kill().await;
        }
        let status = child.wait().await;
        self.untrack(key, generation).await;

        if timed_out {
            return Err(DownloaderError::Timeout(timeout.unwrap_or_default()));
        }

        let status = status?;
        Ok(ExitReport {
            code: status.code(),
            killed,
        })
    }

    /// Run `cmd` to completion and collect its output.
    pub async fn run_collect(
        &self,
        key: ProcessKey,
        tool: &str,
        cmd: Command,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<CollectedOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let report = self
            .run_streaming(key, tool, cmd, cancel, timeout, |stream, line| match stream {
                Stream::Stdout => stdout.push(line.to_string()),
                Stream::Stderr => stderr.push(line.to_string()),
            })
            .await?;

        Ok(CollectedOutput {
            stdout,
            stderr,
            report,
        })
    }
}

/// Captured output of a short-lived process.
#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub report: ExitReport,
}

async fn sweep_os_processes() {
    for (program, args) in sweep_commands() {
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        match cmd.status().await {
            Ok(status) => log::debug!("{} {:?} exited with {}", program, args, status),
            Err(e) => log::debug!("{} {:?} could not run: {}", program, args, e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig { os_sweep: false })
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn streams_lines_in_order_and_reports_exit_code() {
        let sup = supervisor();
        let token = CancellationToken::new();
        let out = sup
            .run_collect(
                ProcessKey::Search,
                "sh",
                sh("echo one; echo two; echo oops >&2; exit 3"),
                &token,
                None,
            )
            .await
            .unwrap();

        assert_eq!(out.stdout, vec!["one", "two"]);
        assert_eq!(out.stderr, vec!["oops"]);
        assert_eq!(out.report.code, Some(3));
        assert!(!out.report.killed);
        assert!(!sup.is_tracked(ProcessKey::Search).await);
    }

    #[tokio::test]
    async fn kill_one_stops_the_owner() {
        let sup = supervisor();
        let id = uuid::Uuid::new_v4();
        let key = ProcessKey::Task(id);

        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                sup.run_streaming(key, "sh", sh("echo started; exec sleep 30"), &token, None, |_, _| {})
                    .await
            })
        };

        for _ in 0..100 {
            if sup.is_tracked(key).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(sup.kill_one(key).await);

        let report = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.killed);
        assert!(!report.success());
        assert!(!sup.is_tracked(key).await);
    }

    #[tokio::test]
    async fn cancelled_token_kills_and_timeout_errors() {
        let sup = supervisor();

        let token = CancellationToken::new();
        token.cancel();
        let report = sup
            .run_streaming(ProcessKey::Metadata, "sh", sh("exec sleep 30"), &token, None, |_, _| {})
            .await
            .unwrap();
        assert!(report.killed);

        let token = CancellationToken::new();
        let err = sup
            .run_streaming(
                ProcessKey::Metadata,
                "sh",
                sh("exec sleep 30"),
                &token,
                Some(Duration::from_millis(100)),
                |_, _| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloaderError::Timeout(_)));
        assert!(sup.tracked_keys().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let sup = supervisor();
        let token = CancellationToken::new();
        let err = sup
            .run_collect(
                ProcessKey::Analysis,
                "missing-tool",
                Command::new("/definitely/not/a/binary"),
                &token,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloaderError::ProcessSpawn { .. }));
    }

    #[tokio::test]
    async fn kill_all_clears_registry() {
        let sup = supervisor();
        let (_, mut rx_a) = sup.track(ProcessKey::Metadata, None).await;
        let (_, mut rx_b) = sup.track(ProcessKey::Search, None).await;

        assert_eq!(sup.kill_all().await, 2);
        assert!(rx_a.recv().await.is_ok());
        assert!(rx_b.recv().await.is_ok());
        assert!(sup.tracked_keys().await.is_empty());
    }

    #[tokio::test]
    async fn stale_untrack_keeps_newer_entry() {
        let sup = supervisor();
        let (old, _rx1) = sup.track(ProcessKey::Metadata, None).await;
        let (_new, _rx2) = sup.track(ProcessKey::Metadata, None).await;
        sup.untrack(ProcessKey::Metadata, old).await;
        assert!(sup.is_tracked(ProcessKey::Metadata).await);
    }
}
