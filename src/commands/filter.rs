// ABOUTME: `filter` command: shows the window and predicate a job would use right now
// ABOUTME: Reads the stored cursor but never writes it

use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};

use odata_sync::config::{load_job, JobKind};
use odata_sync::cursor::{CursorStore, SqliteCursorStore};
use odata_sync::pull::plan_read;

pub fn execute(job_path: &Path, config: &Path, cursor_db: Option<PathBuf>) -> Result<()> {
    let job = load_job(job_path)?;
    let settings = super::settings(config, None, cursor_db)?;

    let window = match &job.kind {
        JobKind::Pull(pull) => pull.filter_window.as_ref(),
        JobKind::Push(push) => push.filter_window.as_ref(),
    };
    let Some(window) = window else {
        println!("Job '{}' has no filter window", job.id);
        return Ok(());
    };

    let cursor = if window.is_incremental() {
        SqliteCursorStore::open(&settings.cursor.path)?.get_last_success(&job.id)?
    } else {
        None
    };
    let plan = plan_read(&job.odata_url, Some(window), Utc::now(), cursor)?;

    if let Some(range) = plan.range {
        println!("from:      {}", range.from.to_rfc3339());
        println!("to:        {}", range.to.to_rfc3339());
    }
    println!("predicate: {}", plan.predicate.as_deref().unwrap_or("(none)"));
    if let JobKind::Pull(_) = job.kind {
        println!("url:       {}", plan.url);
    }
    Ok(())
}
