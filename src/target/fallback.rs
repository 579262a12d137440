// ABOUTME: Batch-then-row savepoint fallback shared by the insert and upsert write paths
// ABOUTME: A failed batch is rolled back to its savepoint and replayed row by row

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::config::ErrorPolicy;
use crate::error::SyncError;

const BATCH_SAVEPOINT: &str = "sync_batch";
const ROW_SAVEPOINT: &str = "sync_row";

/// A write target inside an open transaction that supports savepoints.
#[async_trait]
pub trait SavepointApply: Send {
    async fn apply(&mut self, rows: &[Vec<Value>]) -> Result<()>;
    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to(&mut self, name: &str) -> Result<()>;
    async fn release(&mut self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Position of the row in the full input set.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub ok: usize,
    pub fail: usize,
    pub failures: Vec<RowFailure>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.ok += other.ok;
        self.fail += other.fail;
        self.failures.extend(other.failures);
    }
}

fn snapshot(columns: &[String], row: &[Value]) -> String {
    let map: Map<String, Value> = columns
        .iter()
        .cloned()
        .zip(row.iter().cloned())
        .collect();
    Value::Object(map).to_string()
}

/// Apply `batch` under a savepoint; on failure replay it one row at a time,
/// each under its own savepoint, so a bad row never undoes its siblings.
///
/// `offset` is the index of the batch's first row in the full input.
/// With `ErrorPolicy::Abort` the first failing row ends the call with
/// [`SyncError::RowWrite`]; the caller is expected to drop the transaction.
pub async fn with_savepoint_fallback<A>(
    applier: &mut A,
    batch: &[Vec<Value>],
    offset: usize,
    columns: &[String],
    policy: ErrorPolicy,
) -> Result<BatchOutcome>
where
    A: SavepointApply + ?Sized,
{
    if batch.is_empty() {
        return Ok(BatchOutcome::default());
    }

    applier.savepoint(BATCH_SAVEPOINT).await?;
    match applier.apply(batch).await {
        Ok(()) => {
            applier.release(BATCH_SAVEPOINT).await?;
            return Ok(BatchOutcome {
                ok: batch.len(),
                ..Default::default()
            });
        }
        Err(e) => {
            warn!(
                offset,
                rows = batch.len(),
                error = %format!("{:#}", e),
                "Batch write failed, retrying row by row"
            );
            applier.rollback_to(BATCH_SAVEPOINT).await?;
            applier.release(BATCH_SAVEPOINT).await?;
        }
    }

    let mut outcome = BatchOutcome::default();
    for (pos, row) in batch.iter().enumerate() {
        let index = offset + pos;
        applier.savepoint(ROW_SAVEPOINT).await?;
        match applier.apply(std::slice::from_ref(row)).await {
            Ok(()) => {
                applier.release(ROW_SAVEPOINT).await?;
                outcome.ok += 1;
            }
            Err(e) => {
                applier.rollback_to(ROW_SAVEPOINT).await?;
                applier.release(ROW_SAVEPOINT).await?;
                let reason = format!("{:#}", e);
                error!(index, row = %snapshot(columns, row), error = %reason, "Row write failed");

                if policy == ErrorPolicy::Abort {
                    return Err(SyncError::RowWrite { index, reason }.into());
                }
                outcome.fail += 1;
                outcome.failures.push(RowFailure { index, reason });
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    /// Rejects any statement containing a row whose first value is "bad".
    #[derive(Default)]
    struct FlakyApplier {
        applied: Vec<Value>,
        pending: Vec<Value>,
        ops: Vec<String>,
    }

    #[async_trait]
    impl SavepointApply for FlakyApplier {
        async fn apply(&mut self, rows: &[Vec<Value>]) -> Result<()> {
            if rows.iter().any(|r| r[0] == json!("bad")) {
                bail!("value rejected");
            }
            self.pending.extend(rows.iter().map(|r| r[0].clone()));
            Ok(())
        }

        async fn savepoint(&mut self, name: &str) -> Result<()> {
            self.ops.push(format!("savepoint {}", name));
            Ok(())
        }

        async fn rollback_to(&mut self, name: &str) -> Result<()> {
            self.ops.push(format!("rollback {}", name));
            self.pending.clear();
            Ok(())
        }

        async fn release(&mut self, name: &str) -> Result<()> {
            self.ops.push(format!("release {}", name));
            self.applied.append(&mut self.pending);
            Ok(())
        }
    }

    fn rows(values: &[&str]) -> Vec<Vec<Value>> {
        values.iter().map(|v| vec![json!(v)]).collect()
    }

    fn columns() -> Vec<String> {
        vec!["code".to_string()]
    }

    #[tokio::test]
    async fn test_clean_batch_applies_once() {
        let mut applier = FlakyApplier::default();
        let batch = rows(&["a", "b", "c"]);
        let outcome = with_savepoint_fallback(&mut applier, &batch, 0, &columns(), ErrorPolicy::Continue)
            .await
            .unwrap();
        assert_eq!(outcome.ok, 3);
        assert_eq!(outcome.fail, 0);
        assert_eq!(applier.ops, vec!["savepoint sync_batch", "release sync_batch"]);
    }

    #[tokio::test]
    async fn test_single_bad_row_is_isolated() {
        let mut applier = FlakyApplier::default();
        let batch = rows(&["a", "bad", "c", "d"]);
        let outcome = with_savepoint_fallback(&mut applier, &batch, 10, &columns(), ErrorPolicy::Continue)
            .await
            .unwrap();

        assert_eq!(outcome.ok + outcome.fail, batch.len());
        assert_eq!(outcome.fail, 1);
        assert_eq!(outcome.failures[0].index, 11);
        assert!(outcome.failures[0].reason.contains("value rejected"));
        assert_eq!(applier.applied, vec![json!("a"), json!("c"), json!("d")]);
    }

    #[tokio::test]
    async fn test_abort_policy_stops_at_first_failure() {
        let mut applier = FlakyApplier::default();
        let batch = rows(&["a", "bad", "c"]);
        let err = with_savepoint_fallback(&mut applier, &batch, 0, &columns(), ErrorPolicy::Abort)
            .await
            .unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::RowWrite { index, .. }) => assert_eq!(*index, 1),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(applier.applied, vec![json!("a")]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let mut applier = FlakyApplier::default();
        let outcome = with_savepoint_fallback(&mut applier, &[], 0, &columns(), ErrorPolicy::Continue)
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert!(applier.ops.is_empty());
    }
}
