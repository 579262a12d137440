// ABOUTME: Pull engine: windowed, paged OData reads mapped into a PostgreSQL table
// ABOUTME: Advances the job cursor to the run start only after a zero-failure incremental run

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{FilterWindow, Job, JobKind, PullSpec, Section, WriteMode};
use crate::cursor::CursorStore;
use crate::error::SyncError;
use crate::filter::{append_filter, build_predicate, TimeRange};
use crate::mapper::map_columns;
use crate::remote::{fetch_all, RemoteApi};
use crate::target::{TargetSink, WriteRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    pub rows: usize,
    /// Row-level counts; `None` for replace-all writes, which succeed or fail as a whole.
    pub row_ok: Option<usize>,
    pub row_fail: Option<usize>,
}

/// Collection URL for a run at `now`, plus the range it covers.
#[derive(Debug, Clone)]
pub struct PlannedRead {
    pub url: String,
    pub range: Option<TimeRange>,
    pub predicate: Option<String>,
}

/// Resolve the filter window and inject its predicate into `odata_url`.
pub fn plan_read(
    odata_url: &str,
    window: Option<&FilterWindow>,
    now: DateTime<Utc>,
    cursor: Option<i64>,
) -> Result<PlannedRead> {
    let Some(window) = window else {
        return Ok(PlannedRead {
            url: odata_url.to_string(),
            range: None,
            predicate: None,
        });
    };

    let range = TimeRange::resolve(window, now, cursor);
    let predicate = build_predicate(window, &range)?;
    let url = match &predicate {
        Some(expr) => append_filter(odata_url, expr)?,
        None => odata_url.to_string(),
    };
    Ok(PlannedRead {
        url,
        range: Some(range),
        predicate,
    })
}

pub struct PullEngine {
    remote: Arc<dyn RemoteApi>,
    sink: Arc<dyn TargetSink>,
    cursors: Arc<dyn CursorStore>,
    clock: Arc<dyn Clock>,
}

impl PullEngine {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        sink: Arc<dyn TargetSink>,
        cursors: Arc<dyn CursorStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            remote,
            sink,
            cursors,
            clock,
        }
    }

    pub async fn run(&self, job: &Job) -> Result<PullResult> {
        let JobKind::Pull(spec) = &job.kind else {
            return Err(SyncError::config(format!("job '{}' is not a pull job", job.id)).into());
        };
        job.validate()?;

        let started_at = self.clock.now();
        let plan = self.plan(job, spec, started_at)?;
        info!(job = %job.id, url = %plan.url, "Starting pull");

        let section = job.mapping.resolve(Section::Item, &job.transform)?;
        let records = fetch_all(self.remote.as_ref(), &plan.url, spec.page_size)
            .await
            .with_context(|| format!("Failed to read collection for job '{}'", job.id))?;

        let rows: Vec<Vec<Value>> = records
            .iter()
            .map(|record| map_columns(record, &section, &spec.target.columns))
            .collect();
        debug!(job = %job.id, rows = rows.len(), "Mapped remote rows");

        let request = WriteRequest {
            target: &spec.target,
            mode: spec.write_mode,
            truncate: spec.truncate,
            on_error: spec.on_error,
        };
        let outcome = self.sink.write(&request, &rows).await?;

        let incremental = spec
            .filter_window
            .as_ref()
            .map(FilterWindow::is_incremental)
            .unwrap_or(false);
        if incremental && outcome.fail == 0 {
            self.cursors
                .set_last_success(&job.id, started_at.timestamp_millis())?;
            info!(job = %job.id, cursor = %started_at, "Advanced cursor");
        }

        let row_mode = spec.write_mode != WriteMode::Replace;
        info!(
            job = %job.id,
            rows = outcome.rows,
            ok = outcome.ok,
            fail = outcome.fail,
            "Pull finished"
        );
        Ok(PullResult {
            rows: outcome.rows,
            row_ok: row_mode.then_some(outcome.ok),
            row_fail: row_mode.then_some(outcome.fail),
        })
    }

    /// The read a run of `job` would perform at `now`, honouring the stored cursor.
    pub fn plan(&self, job: &Job, spec: &PullSpec, now: DateTime<Utc>) -> Result<PlannedRead> {
        let window = spec.filter_window.as_ref();
        let cursor = match window {
            Some(w) if w.is_incremental() => self.cursors.get_last_success(&job.id)?,
            _ => None,
        };
        plan_read(&job.odata_url, window, now, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::parse_toml;
    use crate::cursor::MemoryCursorStore;
    use crate::mapper::Row;
    use crate::target::WriteOutcome;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    const JOB: &str = r#"
        id = "orders-pull"
        mode = "pull"
        odataUrl = "https://erp.example.com/odata/Orders"
        pageSize = 2

        [target]
        table = "orders"
        columns = ["order_no", "qty"]

        [filterWindow]
        mode = "sinceLastSuccess"
        lookback = { days = 1 }
        pairs = [{ date = "CreatedOn", time = "CreatedAt" }]

        [mapping.item]
        numberFields = ["qty"]

        [mapping.item.fields]
        order_no = "OrderNo"
        qty = "Quantity"
    "#;

    struct FakeRemote {
        rows: Vec<Row>,
        urls: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn new(n: usize) -> Self {
            let rows = (0..n)
                .map(|i| {
                    json!({"OrderNo": format!("O{}", i), "Quantity": format!(" {} ", i)})
                        .as_object()
                        .cloned()
                        .unwrap()
                })
                .collect();
            Self {
                rows,
                urls: Mutex::new(Vec::new()),
            }
        }

        fn last_filter(&self) -> String {
            let urls = self.urls.lock().unwrap();
            let url = reqwest::Url::parse(urls.last().unwrap()).unwrap();
            url.query_pairs()
                .find(|(k, _)| k == "$filter")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl crate::remote::RemoteApi for FakeRemote {
        async fn fetch_page(&self, url: &str, skip: usize, top: usize) -> Result<Vec<Row>> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(self.rows.iter().skip(skip).take(top).cloned().collect())
        }

        async fn fetch_csrf_token(&self, _url: &str) -> Result<String> {
            Ok("t".into())
        }

        async fn post(&self, _url: &str, _token: &str, _body: &Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        fail: usize,
        written: Mutex<Vec<Vec<Value>>>,
    }

    #[async_trait]
    impl TargetSink for RecordingSink {
        async fn write(&self, _request: &WriteRequest<'_>, rows: &[Vec<Value>]) -> Result<WriteOutcome> {
            self.written.lock().unwrap().extend(rows.iter().cloned());
            Ok(WriteOutcome {
                rows: rows.len(),
                ok: rows.len() - self.fail,
                fail: self.fail,
                failures: Vec::new(),
            })
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn engine(
        remote: Arc<FakeRemote>,
        sink: Arc<RecordingSink>,
        cursors: Arc<MemoryCursorStore>,
        now: DateTime<Utc>,
    ) -> PullEngine {
        PullEngine::new(remote, sink, cursors, Arc::new(FixedClock(now)))
    }

    #[tokio::test]
    async fn test_pull_maps_and_writes_all_pages() {
        let job = parse_toml(JOB).unwrap();
        let remote = Arc::new(FakeRemote::new(5));
        let sink = Arc::new(RecordingSink::default());
        let cursors = Arc::new(MemoryCursorStore::new());
        let result = engine(remote.clone(), sink.clone(), cursors, at(2024, 1, 2, 10, 0))
            .run(&job)
            .await
            .unwrap();

        assert_eq!(
            result,
            PullResult {
                rows: 5,
                row_ok: Some(5),
                row_fail: Some(0)
            }
        );
        let written = sink.written.lock().unwrap();
        assert_eq!(written[3], vec![json!("O3"), json!(3)]);
        assert_eq!(remote.urls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_first_run_uses_lookback_window() {
        let job = parse_toml(JOB).unwrap();
        let remote = Arc::new(FakeRemote::new(0));
        let cursors = Arc::new(MemoryCursorStore::new());
        engine(
            remote.clone(),
            Arc::new(RecordingSink::default()),
            cursors,
            at(2024, 1, 2, 10, 0),
        )
        .run(&job)
        .await
        .unwrap();

        let filter = remote.last_filter();
        assert!(filter.starts_with("(CreatedOn ne null and "));
        assert!(filter.contains("(CreatedOn gt 2024-01-01) or (CreatedOn eq 2024-01-01 and CreatedAt ge 10:00:00)"));
        assert!(filter.contains("(CreatedOn lt 2024-01-02) or (CreatedOn eq 2024-01-02 and CreatedAt le 10:00:00)"));
    }

    #[tokio::test]
    async fn test_cursor_is_run_start_and_next_window_begins_there() {
        let job = parse_toml(JOB).unwrap();
        let cursors = Arc::new(MemoryCursorStore::new());
        let first = at(2024, 1, 2, 10, 0);
        engine(
            Arc::new(FakeRemote::new(1)),
            Arc::new(RecordingSink::default()),
            cursors.clone(),
            first,
        )
        .run(&job)
        .await
        .unwrap();
        assert_eq!(
            cursors.get_last_success("orders-pull").unwrap(),
            Some(first.timestamp_millis())
        );

        let remote = Arc::new(FakeRemote::new(0));
        engine(
            remote.clone(),
            Arc::new(RecordingSink::default()),
            cursors.clone(),
            at(2024, 1, 2, 12, 30),
        )
        .run(&job)
        .await
        .unwrap();
        let filter = remote.last_filter();
        assert!(filter.contains("(CreatedOn eq 2024-01-02 and CreatedAt ge 10:00:00)"));
        assert!(filter.contains("(CreatedOn eq 2024-01-02 and CreatedAt le 12:30:00)"));
    }

    #[tokio::test]
    async fn test_row_failures_leave_cursor_untouched() {
        let job = parse_toml(JOB).unwrap();
        let cursors = Arc::new(MemoryCursorStore::new());
        cursors.set_last_success("orders-pull", 42).unwrap();
        let sink = Arc::new(RecordingSink {
            fail: 1,
            ..Default::default()
        });
        let result = engine(Arc::new(FakeRemote::new(3)), sink, cursors.clone(), at(2024, 1, 2, 10, 0))
            .run(&job)
            .await
            .unwrap();

        assert_eq!(result.row_fail, Some(1));
        assert_eq!(result.row_ok.unwrap() + result.row_fail.unwrap(), result.rows);
        assert_eq!(cursors.get_last_success("orders-pull").unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_relative_window_never_writes_cursor() {
        let text = JOB.replace("mode = \"sinceLastSuccess\"", "mode = \"relative\"");
        let job = parse_toml(&text).unwrap();
        let cursors = Arc::new(MemoryCursorStore::new());
        engine(
            Arc::new(FakeRemote::new(1)),
            Arc::new(RecordingSink::default()),
            cursors.clone(),
            at(2024, 1, 2, 10, 0),
        )
        .run(&job)
        .await
        .unwrap();
        assert_eq!(cursors.get_last_success("orders-pull").unwrap(), None);
    }

    #[tokio::test]
    async fn test_incremental_replace_fails_before_io() {
        let text = format!("writeMode = \"replace\"\n{}", JOB);
        let job = parse_toml(&text).unwrap();
        let remote = Arc::new(FakeRemote::new(1));
        let err = engine(
            remote.clone(),
            Arc::new(RecordingSink::default()),
            Arc::new(MemoryCursorStore::new()),
            at(2024, 1, 2, 10, 0),
        )
        .run(&job)
        .await
        .unwrap_err();

        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Config(_))));
        assert!(remote.urls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_plan_without_window_keeps_url() {
        let plan = plan_read("https://h/odata/X?$top=5", None, at(2024, 1, 1, 0, 0), None).unwrap();
        assert_eq!(plan.url, "https://h/odata/X?$top=5");
        assert!(plan.range.is_none());
    }

    #[tokio::test]
    async fn test_bad_mapping_timezone_fails_before_fetch() {
        let text = JOB.replace(
            "numberFields = [\"qty\"]",
            "numberFields = [\"qty\"]\n        timezone = \"Mars/Olympus\"",
        );
        let job = parse_toml(&text).unwrap();
        let remote = Arc::new(FakeRemote::new(3));
        let sink = Arc::new(RecordingSink::default());
        let err = engine(
            remote.clone(),
            sink.clone(),
            Arc::new(MemoryCursorStore::new()),
            at(2024, 1, 2, 10, 0),
        )
        .run(&job)
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Config(_))
        ));
        assert!(remote.urls.lock().unwrap().is_empty());
        assert!(sink.written.lock().unwrap().is_empty());
    }
}
