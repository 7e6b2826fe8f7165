use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

const DB_FILE_NAME: &str = "omnidl.sqlite3";

/// Database handle wrapper.
///
/// `rusqlite::Connection` is `Send` but not `Sync`; share it behind a mutex.
pub struct Db {
    conn: Connection,
    path: Option<PathBuf>,
}

/// Per-user app directories.
///
/// macOS:  ~/Library/Application Support/OmniDL
/// Windows: %APPDATA%\\OmniDL
/// Linux:  ~/.local/share/omnidl (depending on XDG)
pub fn app_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "omnidl", "OmniDL")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))
}

/// Directory holding the settings database and the bundled tools.
pub fn app_data_dir() -> Result<PathBuf> {
    Ok(app_project_dirs()?.data_dir().to_path_buf())
}

/// Create the data dir and its `tools` subdirectory.
pub fn ensure_app_dirs() -> Result<AppDirs> {
    let data = app_data_dir()?;
    let tools = data.join("tools");

    fs::create_dir_all(&data).with_context(|| format!("create data dir: {}", data.display()))?;
    fs::create_dir_all(&tools).with_context(|| format!("create tools dir: {}", tools.display()))?;

    Ok(AppDirs { data, tools })
}

#[derive(Debug, Clone)]
pub struct AppDirs {
    pub data: PathBuf,
    pub tools: PathBuf,
}

impl Db {
    /// Open the database at the per-user location and apply migrations.
    pub fn open_default() -> Result<Self> {
        let dirs = ensure_app_dirs()?;
        Self::open(&dirs.data.join(DB_FILE_NAME))
    }

    /// Open (or create) the database file at `path` and apply migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create db dir: {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&mut conn)?;

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Throwaway database, used by tests and by callers that opt out of
    /// persistence.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        migrate(&mut conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        read_schema_version(&self.conn)
    }
}

fn read_schema_version(conn: &Connection) -> Result<i64> {
    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    Ok(existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0))
}

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let current_version = read_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "db schema version {} is newer than app supports {}",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

/// Task list and preferences all live as JSON blobs in one key/value table.
fn migration_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value_json TEXT NOT NULL
        );
        "#,
    )?;
    tx.commit()?;
    Ok(())
}
