// ABOUTME: `cursor` commands: show or reset a job's last-success timestamp
// ABOUTME: Operates directly on the SQLite cursor store

use anyhow::Result;
use std::path::{Path, PathBuf};

use odata_sync::cursor::{CursorStore, SqliteCursorStore};
use odata_sync::filter::from_epoch_ms;

fn open(config: &Path, cursor_db: Option<PathBuf>) -> Result<SqliteCursorStore> {
    let settings = super::settings(config, None, cursor_db)?;
    SqliteCursorStore::open(&settings.cursor.path)
}

pub fn show(job_id: &str, config: &Path, cursor_db: Option<PathBuf>) -> Result<()> {
    match open(config, cursor_db)?.get_last_success(job_id)? {
        Some(ms) => {
            let at = from_epoch_ms(ms)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "out of range".to_string());
            println!("{}: {} ({})", job_id, ms, at);
        }
        None => println!("{}: no successful run recorded", job_id),
    }
    Ok(())
}

pub fn reset(job_id: &str, config: &Path, cursor_db: Option<PathBuf>) -> Result<()> {
    open(config, cursor_db)?.clear(job_id)?;
    println!("Cleared cursor for {}", job_id);
    Ok(())
}
