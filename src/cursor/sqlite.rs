// ABOUTME: SQLite-backed cursor store
// ABOUTME: One row per job id holding the epoch-ms start of its last clean run

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::CursorStore;

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS job_cursors (
    job_id TEXT PRIMARY KEY NOT NULL,
    last_success_ms INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

pub struct SqliteCursorStore {
    conn: Mutex<Connection>,
}

impl SqliteCursorStore {
    /// Open or create the cursor database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create cursor directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cursor database {}", path.display()))?;
        conn.execute_batch(CREATE_TABLES)
            .context("Failed to initialize cursor tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory cursor database")?;
        conn.execute_batch(CREATE_TABLES)
            .context("Failed to initialize cursor tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("cursor database lock poisoned"))
    }
}

impl CursorStore for SqliteCursorStore {
    fn get_last_success(&self, job_id: &str) -> Result<Option<i64>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT last_success_ms FROM job_cursors WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read cursor for job '{}'", job_id))
    }

    fn set_last_success(&self, job_id: &str, epoch_ms: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO job_cursors (job_id, last_success_ms, updated_at) \
             VALUES (?1, ?2, datetime('now')) \
             ON CONFLICT(job_id) DO UPDATE SET last_success_ms = ?2, updated_at = datetime('now')",
            params![job_id, epoch_ms],
        )
        .with_context(|| format!("Failed to write cursor for job '{}'", job_id))?;
        Ok(())
    }

    fn clear(&self, job_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM job_cursors WHERE job_id = ?1", params![job_id])
            .with_context(|| format!("Failed to clear cursor for job '{}'", job_id))?;
        Ok(())
    }
}
