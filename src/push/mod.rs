// ABOUTME: Push engine: reads pending rows, posts them to the remote service and records outcomes
// ABOUTME: Duplicate-key rejections are isolated by halving batches before any row is taken as sent

pub mod source;

pub use source::{group_by_header, join_dual, Group, Joined, SourceRow};

use anyhow::{Context, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ErrorPolicy, Job, JobKind, PushSpec, ResolvedSection, Section, SourceConfig};
use crate::cursor::CursorStore;
use crate::error::{clip, SyncError, REASON_CLIP};
use crate::filter::TimeRange;
use crate::mapper::{map_section, Row};
use crate::remote::RemoteApi;
use crate::target::{SourceStore, DUPLICATE_AS_SENT};
use crate::verify::verify;

/// Reason stored against dual-source items that matched no header row.
pub const NO_MATCHING_HEADER: &str = "no matching header";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushResult {
    pub ok: usize,
    pub fail: usize,
}

impl PushResult {
    pub fn total(&self) -> usize {
        self.ok + self.fail
    }
}

impl AddAssign for PushResult {
    fn add_assign(&mut self, other: Self) {
        self.ok += other.ok;
        self.fail += other.fail;
    }
}

/// One POST: either a header with item lines or a single row body.
#[derive(Debug, Clone)]
struct Unit<'a> {
    header: Option<Row>,
    items: Vec<Row>,
    rows: Vec<&'a SourceRow>,
}

impl<'a> Unit<'a> {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn body(&self, items_key: &str) -> Value {
        match &self.header {
            Some(header) => {
                let mut body = header.clone();
                body.insert(
                    items_key.to_string(),
                    Value::Array(self.items.iter().cloned().map(Value::Object).collect()),
                );
                Value::Object(body)
            }
            None => Value::Object(self.items.first().cloned().unwrap_or_default()),
        }
    }

    fn split(self) -> (Unit<'a>, Unit<'a>) {
        let mid = self.len() / 2;
        let mut items = self.items;
        let mut rows = self.rows;
        let right_items = items.split_off(mid);
        let right_rows = rows.split_off(mid);
        (
            Unit {
                header: self.header.clone(),
                items,
                rows,
            },
            Unit {
                header: self.header,
                items: right_items,
                rows: right_rows,
            },
        )
    }

    fn mark_rows(&self) -> Vec<&'a Row> {
        self.rows.iter().map(|r| r.item()).collect()
    }
}

struct RunContext<'a> {
    job_id: &'a str,
    url: &'a str,
    token: String,
    spec: &'a PushSpec,
}

/// Rejection body when `err` is a remote error carrying one of `codes`.
pub(crate) fn duplicate_body(err: &anyhow::Error, codes: &[String]) -> Option<String> {
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Transport { body, .. }) if codes.iter().any(|c| body.contains(c.as_str())) => {
            Some(body.clone())
        }
        _ => None,
    }
}

fn failure_reason(err: &anyhow::Error) -> String {
    match err.downcast_ref::<SyncError>() {
        Some(sync) => sync.reason(),
        None => clip(&format!("{:#}", err), REASON_CLIP),
    }
}

pub struct PushEngine {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn SourceStore>,
    cursors: Arc<dyn CursorStore>,
    clock: Arc<dyn Clock>,
}

impl PushEngine {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn SourceStore>,
        cursors: Arc<dyn CursorStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            remote,
            store,
            cursors,
            clock,
        }
    }

    pub async fn run(&self, job: &Job) -> Result<PushResult> {
        let JobKind::Push(spec) = &job.kind else {
            return Err(SyncError::config(format!("job '{}' is not a push job", job.id)).into());
        };
        job.validate()?;

        let started_at = self.clock.now();
        let window = spec.filter_window.as_ref();
        let range = match window {
            Some(w) => {
                let cursor = if w.is_incremental() {
                    self.cursors.get_last_success(&job.id)?
                } else {
                    None
                };
                Some(TimeRange::resolve(w, started_at, cursor))
            }
            None => None,
        };

        let item_section = job.mapping.resolve(Section::Item, &job.transform)?;
        let header_section = if job.mapping.has_header() {
            Some(job.mapping.resolve(Section::Header, &job.transform)?)
        } else {
            None
        };

        let token = self
            .remote
            .fetch_csrf_token(&job.odata_url)
            .await
            .with_context(|| format!("Failed to fetch write token for job '{}'", job.id))?;

        let joined = self.read_source(&spec.source, range.as_ref()).await?;
        info!(
            job = %job.id,
            rows = joined.rows.len(),
            orphans = joined.orphans.len(),
            "Read pending rows"
        );

        let mut result = PushResult::default();
        if !joined.orphans.is_empty() {
            let orphans: Vec<&Row> = joined.orphans.iter().collect();
            warn!(job = %job.id, count = orphans.len(), "Items without a matching header");
            self.store
                .mark_error(&orphans, NO_MATCHING_HEADER, &spec.mark)
                .await?;
            result.fail += orphans.len();
        }

        let ctx = RunContext {
            job_id: &job.id,
            url: &job.odata_url,
            token,
            spec,
        };

        result += match &header_section {
            Some(header) => self.push_grouped(&ctx, &joined.rows, header, &item_section).await?,
            None => {
                let concurrency = match &spec.source {
                    SourceConfig::Single(single) => single.concurrency,
                    SourceConfig::Dual(_) => 1,
                };
                self.push_each(&ctx, &joined.rows, &item_section, concurrency)
                    .await?
            }
        };

        let incremental = window.map(|w| w.is_incremental()).unwrap_or(false);
        if incremental && result.fail == 0 {
            self.cursors
                .set_last_success(&job.id, started_at.timestamp_millis())?;
            info!(job = %job.id, cursor = %started_at, "Advanced cursor");
        }

        info!(job = %job.id, ok = result.ok, fail = result.fail, "Push finished");
        Ok(result)
    }

    async fn read_source(&self, source: &SourceConfig, range: Option<&TimeRange>) -> Result<Joined> {
        match source {
            SourceConfig::Single(single) => {
                let rows = self.store.read_pending(&single.sql, range).await?;
                Ok(Joined {
                    rows: rows.into_iter().map(SourceRow::Single).collect(),
                    orphans: Vec::new(),
                })
            }
            SourceConfig::Dual(dual) => {
                let items = self.store.read_pending(&dual.item_sql, range).await?;
                if items.is_empty() {
                    return Ok(Joined::default());
                }
                let headers = self.store.read_pending(&dual.header_sql, range).await?;
                Ok(join_dual(headers, items, &dual.join))
            }
        }
    }

    async fn push_grouped(
        &self,
        ctx: &RunContext<'_>,
        rows: &[SourceRow],
        header: &ResolvedSection,
        item: &ResolvedSection,
    ) -> Result<PushResult> {
        let mut result = PushResult::default();
        for group in group_by_header(rows, header, item) {
            for batch in group.members.chunks(ctx.spec.batch_size) {
                let unit = Unit {
                    header: Some(group.header.clone()),
                    items: batch.iter().map(|(_, mapped)| mapped.clone()).collect(),
                    rows: batch.iter().map(|(row, _)| *row).collect(),
                };
                result += self.send_unit(ctx, unit).await?;
            }
        }
        Ok(result)
    }

    /// One row per request. Workers take the next unsent row from a shared
    /// index; a fatal error stops new dispatch and is returned once in-flight
    /// rows finish.
    async fn push_each(
        &self,
        ctx: &RunContext<'_>,
        rows: &[SourceRow],
        item: &ResolvedSection,
        concurrency: usize,
    ) -> Result<PushResult> {
        let units: Vec<Unit<'_>> = rows
            .iter()
            .map(|row| Unit {
                header: None,
                items: vec![map_section(row.item(), item)],
                rows: vec![row],
            })
            .collect();

        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let workers = (0..concurrency.max(1).min(units.len().max(1))).map(|worker| {
            let units = &units;
            let next = &next;
            let stop = &stop;
            async move {
                let mut local = PushResult::default();
                while !stop.load(Ordering::SeqCst) {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(unit) = units.get(i) else {
                        break;
                    };
                    match self.send_unit(ctx, unit.clone()).await {
                        Ok(r) => local += r,
                        Err(e) => {
                            debug!(worker, index = i, "Worker stopping after fatal error");
                            stop.store(true, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                }
                Ok(local)
            }
        });

        let mut result = PushResult::default();
        let mut first_error = None;
        for outcome in join_all(workers).await {
            match outcome {
                Ok(r) => result += r,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    fn send_unit<'a>(&'a self, ctx: &'a RunContext<'a>, unit: Unit<'a>) -> BoxFuture<'a, Result<PushResult>> {
        async move {
            let body = unit.body(&ctx.spec.items_key);
            match self.remote.post(ctx.url, &ctx.token, &body).await {
                Ok(response) => {
                    let (sent, sent_items): (&Row, &[Row]) = match &unit.header {
                        Some(header) => (header, unit.items.as_slice()),
                        None => (&unit.items[0], &unit.items[..0]),
                    };
                    let verdict = verify(&ctx.spec.sap_success, sent, sent_items, &response);
                    if verdict.ok {
                        let marked = self
                            .store
                            .mark_sent(&unit.mark_rows(), None, &ctx.spec.mark)
                            .await?;
                        debug!(job = ctx.job_id, rows = unit.len(), marked, "Posted");
                        return Ok(PushResult {
                            ok: unit.len(),
                            fail: 0,
                        });
                    }
                    let reason = verdict.reason.unwrap_or_default();
                    self.fail_unit(ctx, &unit, SyncError::Verification(reason).into())
                        .await
                }
                Err(err) => match duplicate_body(&err, &ctx.spec.duplicate.codes) {
                    Some(_) if unit.len() > 1 => {
                        debug!(
                            job = ctx.job_id,
                            rows = unit.len(),
                            "Duplicate key in batch, splitting"
                        );
                        let (left, right) = unit.split();
                        let mut result = self.send_unit(ctx, left).await?;
                        result += self.send_unit(ctx, right).await?;
                        Ok(result)
                    }
                    Some(_) if ctx.spec.duplicate.as_sent => {
                        info!(job = ctx.job_id, "Duplicate key for single row, taking it as sent");
                        self.store
                            .mark_sent(&unit.mark_rows(), Some(DUPLICATE_AS_SENT), &ctx.spec.mark)
                            .await?;
                        Ok(PushResult { ok: 1, fail: 0 })
                    }
                    Some(body) => {
                        self.fail_unit(ctx, &unit, SyncError::DuplicateKey(body).into())
                            .await
                    }
                    None => self.fail_unit(ctx, &unit, err).await,
                },
            }
        }
        .boxed()
    }

    /// Record `err` against every row of the unit; re-raise under `failMode = abort`.
    async fn fail_unit(&self, ctx: &RunContext<'_>, unit: &Unit<'_>, err: anyhow::Error) -> Result<PushResult> {
        let reason = failure_reason(&err);
        warn!(job = ctx.job_id, rows = unit.len(), reason = %reason, "Push failed");
        self.store
            .mark_error(&unit.mark_rows(), &reason, &ctx.spec.mark)
            .await?;
        if ctx.spec.fail_mode == ErrorPolicy::Abort {
            return Err(err);
        }
        Ok(PushResult {
            ok: 0,
            fail: unit.len(),
        })
    }
}
