// ABOUTME: `run` command: wires PostgreSQL, the OData client and the cursor store into a runner
// ABOUTME: Prints the run outcome as JSON on success

use anyhow::Result;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use odata_sync::clock::SystemClock;
use odata_sync::config::load_job;
use odata_sync::cursor::SqliteCursorStore;
use odata_sync::pull::PullEngine;
use odata_sync::push::PushEngine;
use odata_sync::remote::{ODataClient, StaticToken};
use odata_sync::target::{PgStore, TypeCastCache};
use odata_sync::{JobRunner, RunOutcome, SyncError};

pub async fn execute(
    job_path: &Path,
    config: &Path,
    database_url: Option<String>,
    cursor_db: Option<PathBuf>,
) -> Result<()> {
    let job = load_job(job_path)?;
    let settings = super::settings(config, database_url, cursor_db)?;

    let url = settings.database.url.clone().ok_or_else(|| {
        SyncError::config("no database URL; set [database] url, DATABASE_URL or --database-url")
    })?;
    let store = Arc::new(
        PgStore::connect(&url, TypeCastCache::new(), settings.statement_timeout()).await?,
    );
    let remote = Arc::new(ODataClient::new(
        settings.http_timeout(),
        Arc::new(StaticToken::new(settings.remote.token.clone())),
    )?);
    let cursors = Arc::new(SqliteCursorStore::open(&settings.cursor.path)?);
    let clock = Arc::new(SystemClock);

    let runner = JobRunner::new(
        PullEngine::new(remote.clone(), store.clone(), cursors.clone(), clock.clone()),
        PushEngine::new(remote, store, cursors, clock),
    );

    let summary = match runner.run(&job).await? {
        RunOutcome::Pull(r) => json!({
            "job": job.id,
            "mode": "pull",
            "rows": r.rows,
            "rowOk": r.row_ok,
            "rowFail": r.row_fail,
        }),
        RunOutcome::Push(r) => json!({
            "job": job.id,
            "mode": "push",
            "ok": r.ok,
            "fail": r.fail,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
