// ABOUTME: Per-job "last successful run" cursor persistence
// ABOUTME: Trait plus an in-memory implementation; SQLite lives in the sqlite submodule

pub mod sqlite;

pub use sqlite::SqliteCursorStore;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Key-value store for the epoch-millisecond start of each job's last
/// zero-failure run.
pub trait CursorStore: Send + Sync {
    /// `Ok(None)` when the job has never completed a clean run.
    fn get_last_success(&self, job_id: &str) -> Result<Option<i64>>;

    fn set_last_success(&self, job_id: &str, epoch_ms: i64) -> Result<()>;

    /// Forget the cursor so the next run starts from the lookback window.
    fn clear(&self, job_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, i64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn get_last_success(&self, job_id: &str) -> Result<Option<i64>> {
        let cursors = self.cursors.lock().map_err(|_| anyhow!("cursor lock poisoned"))?;
        Ok(cursors.get(job_id).copied())
    }

    fn set_last_success(&self, job_id: &str, epoch_ms: i64) -> Result<()> {
        let mut cursors = self.cursors.lock().map_err(|_| anyhow!("cursor lock poisoned"))?;
        cursors.insert(job_id.to_string(), epoch_ms);
        Ok(())
    }

    fn clear(&self, job_id: &str) -> Result<()> {
        let mut cursors = self.cursors.lock().map_err(|_| anyhow!("cursor lock poisoned"))?;
        cursors.remove(job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.get_last_success("a").unwrap(), None);
        store.set_last_success("a", 42).unwrap();
        store.set_last_success("b", 7).unwrap();
        assert_eq!(store.get_last_success("a").unwrap(), Some(42));
        store.clear("a").unwrap();
        assert_eq!(store.get_last_success("a").unwrap(), None);
        assert_eq!(store.get_last_success("b").unwrap(), Some(7));
    }
}
