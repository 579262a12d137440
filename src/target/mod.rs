// ABOUTME: Relational side of the sync: target writes, pending-row reads and outcome marking
// ABOUTME: Engines depend on the traits here; `PgStore` implements them for PostgreSQL

pub mod cache;
pub mod fallback;
pub mod postgres;

pub use cache::{TableInfo, TypeCastCache};
pub use fallback::{with_savepoint_fallback, BatchOutcome, RowFailure, SavepointApply};
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ErrorPolicy, MarkTarget, TargetConfig, WriteMode};
use crate::filter::TimeRange;
use crate::mapper::Row;

/// Status note stored when a duplicate-key rejection is taken as prior success.
pub const DUPLICATE_AS_SENT: &str = "duplicateAsSent";

pub struct WriteRequest<'a> {
    pub target: &'a TargetConfig,
    pub mode: WriteMode,
    pub truncate: bool,
    pub on_error: ErrorPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub rows: usize,
    pub ok: usize,
    pub fail: usize,
    pub failures: Vec<RowFailure>,
}

impl WriteOutcome {
    pub fn all_ok(rows: usize) -> Self {
        Self {
            rows,
            ok: rows,
            ..Default::default()
        }
    }

    pub fn from_batches(rows: usize, batches: BatchOutcome) -> Self {
        Self {
            rows,
            ok: batches.ok,
            fail: batches.fail,
            failures: batches.failures,
        }
    }
}

/// Writes mapped pull rows into the target table.
#[async_trait]
pub trait TargetSink: Send + Sync {
    /// `rows` are tuples ordered like `request.target.columns`.
    async fn write(&self, request: &WriteRequest<'_>, rows: &[Vec<Value>]) -> Result<WriteOutcome>;
}

/// Reads rows waiting to be pushed and records push outcomes against them.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Run a caller-supplied statement. With a window the statement may use
    /// `$1` (from) and `$2` (to) as `timestamptz`; statements that declare
    /// fewer parameters get only those.
    async fn read_pending(&self, sql: &str, window: Option<&TimeRange>) -> Result<Vec<Row>>;

    async fn mark_sent(&self, rows: &[&Row], note: Option<&str>, mark: &MarkTarget) -> Result<u64>;

    async fn mark_error(&self, rows: &[&Row], reason: &str, mark: &MarkTarget) -> Result<u64>;
}
