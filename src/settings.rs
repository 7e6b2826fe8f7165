//! Settings Manager
//!
//! Persists the task list and user preferences as JSON values in SQLite.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::models::DownloadTask;
use crate::tasks::{coerce_on_load, renumber};

/// Folder created under the user's download directory by default.
pub const DEFAULT_FOLDER_NAME: &str = "OmniDownloader";

/// Settings keys used in the database.
pub mod keys {
    pub const TASKS: &str = "tasks";
    pub const BASE_PATH: &str = "base_path";
    pub const QUEUE_ACTIVE: &str = "queue_active";
    pub const SORT_BY: &str = "sort_by";
    pub const FILTER_BY: &str = "filter_by";
}

/// `<user download dir>/OmniDownloader`, or the same under the home
/// directory when the platform reports no download dir.
pub fn default_base_path() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
        .join(DEFAULT_FOLDER_NAME)
}

/// Settings manager for reading and writing settings to the database.
pub struct SettingsManager<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get a setting value by key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query settings")?;

        match result {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .with_context(|| format!("Failed to deserialize setting {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value by key.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).context("Failed to serialize setting")?;

        self.conn
            .execute(
                "INSERT INTO settings (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![key, json],
            )
            .context("Failed to save setting")?;

        Ok(())
    }

    /// Delete a setting by key.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }

    /// Load the persisted task list, ready for the store: interrupted tasks
    /// come back paused, ordered by queue order and renumbered `1..N`.
    ///
    /// An unreadable list is logged and treated as empty so a corrupt slot
    /// never blocks startup.
    pub fn load_tasks(&self) -> Result<Vec<DownloadTask>> {
        let mut tasks = match self.get::<Vec<DownloadTask>>(keys::TASKS) {
            Ok(tasks) => tasks.unwrap_or_default(),
            Err(e) => {
                log::warn!("Discarding unreadable task list: {:#}", e);
                Vec::new()
            }
        };
        coerce_on_load(&mut tasks);
        tasks.sort_by(|a, b| {
            a.queue_order
                .cmp(&b.queue_order)
                .then(a.created_at.cmp(&b.created_at))
        });
        renumber(&mut tasks);
        Ok(tasks)
    }

    pub fn save_tasks(&self, tasks: &[DownloadTask]) -> Result<()> {
        self.set(keys::TASKS, tasks)
    }

    /// The saved base path, or the default one when nothing was saved yet.
    pub fn base_path(&self) -> Result<PathBuf> {
        Ok(self
            .get::<PathBuf>(keys::BASE_PATH)?
            .unwrap_or_else(default_base_path))
    }

    /// Persist a new base path, creating the directory first.
    pub fn set_base_path(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("create download dir: {}", path.display()))?;
        self.set(keys::BASE_PATH, path)
    }

    pub fn queue_active(&self) -> Result<bool> {
        self.get::<bool>(keys::QUEUE_ACTIVE)
            .map(|opt| opt.unwrap_or(true))
    }

    pub fn set_queue_active(&self, active: bool) -> Result<()> {
        self.set(keys::QUEUE_ACTIVE, &active)
    }

    pub fn sort_by(&self) -> Result<Option<String>> {
        self.get::<String>(keys::SORT_BY)
    }

    pub fn set_sort_by(&self, value: &str) -> Result<()> {
        self.set(keys::SORT_BY, value)
    }

    pub fn filter_by(&self) -> Result<Option<String>> {
        self.get::<String>(keys::FILTER_BY)
    }

    pub fn set_filter_by(&self, value: &str) -> Result<()> {
        self.set(keys::FILTER_BY, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadService, TaskStatus};
    use rusqlite::Connection;

    fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL
            )",
            [],
        )
        .unwrap();
        conn
    }

    fn task(url: &str, order: u32, status: TaskStatus) -> DownloadTask {
        DownloadTask::new(url, DownloadService::Extractor, Default::default(), url, None, order)
            .with_status(status)
    }

    #[test]
    fn test_defaults_when_empty() {
        let conn = setup_test_db();
        let manager = SettingsManager::new(&conn);

        assert!(manager.load_tasks().unwrap().is_empty());
        assert!(manager.queue_active().unwrap());
        assert!(manager.sort_by().unwrap().is_none());
        assert!(manager
            .base_path()
            .unwrap()
            .ends_with(DEFAULT_FOLDER_NAME));
    }

    #[test]
    fn test_restart_parks_interrupted_tasks() {
        let conn = setup_test_db();
        let manager = SettingsManager::new(&conn);

        let mut running = task("https://a", 5, TaskStatus::Downloading);
        running.speed = Some("1.00MiB/s".into());
        let tasks = vec![
            running,
            task("https://b", 2, TaskStatus::Analyzing),
            task("https://c", 9, TaskStatus::Completed),
        ];
        manager.save_tasks(&tasks).unwrap();

        let loaded = manager.load_tasks().unwrap();
        let summary: Vec<(&str, TaskStatus, u32)> = loaded
            .iter()
            .map(|t| (t.url.as_str(), t.status, t.queue_order))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("https://b", TaskStatus::Paused, 1),
                ("https://a", TaskStatus::Paused, 2),
                ("https://c", TaskStatus::Completed, 3),
            ]
        );
        assert!(loaded[1].speed.is_none());
    }

    #[test]
    fn test_corrupt_task_list_loads_empty() {
        let conn = setup_test_db();
        conn.execute(
            "INSERT INTO settings (key, value_json) VALUES ('tasks', '{not json')",
            [],
        )
        .unwrap();
        let manager = SettingsManager::new(&conn);
        assert!(manager.load_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_base_path_is_created() {
        let conn = setup_test_db();
        let manager = SettingsManager::new(&conn);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("media").join("incoming");

        manager.set_base_path(&target).unwrap();
        assert!(target.is_dir());
        assert_eq!(manager.base_path().unwrap(), target);
    }

    #[test]
    fn test_scalar_prefs() {
        let conn = setup_test_db();
        let manager = SettingsManager::new(&conn);

        manager.set_queue_active(false).unwrap();
        manager.set_sort_by("date").unwrap();
        manager.set_filter_by("completed").unwrap();

        assert!(!manager.queue_active().unwrap());
        assert_eq!(manager.sort_by().unwrap().as_deref(), Some("date"));
        assert_eq!(manager.filter_by().unwrap().as_deref(), Some("completed"));

        manager.delete(keys::SORT_BY).unwrap();
        assert!(manager.sort_by().unwrap().is_none());
    }
}
