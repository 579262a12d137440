// ABOUTME: Per-table column type and primary key cache keyed by schema.table
// ABOUTME: Filled lazily by the Postgres store and shared across jobs; never invalidated

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Column types (as `regtype` text) and primary key of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub columns: HashMap<String, String>,
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn column_type(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }
}

/// Types a text parameter can be compared or assigned to without a cast
/// beyond `::text`.
fn is_text_type(ty: &str) -> bool {
    matches!(ty, "text" | "character varying" | "character" | "name")
}

/// Placeholder for parameter `n` bound as text, cast to `ty` when the
/// column is not itself textual.
pub fn placeholder(n: usize, ty: Option<&str>) -> String {
    match ty {
        Some(t) if !is_text_type(t) => format!("${}::text::{}", n, t),
        _ => format!("${}::text", n),
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeCastCache {
    tables: Arc<RwLock<HashMap<String, Arc<TableInfo>>>>,
}

impl TypeCastCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(schema: &str, table: &str) -> String {
        format!("{}.{}", schema, table)
    }

    pub fn get(&self, schema: &str, table: &str) -> Option<Arc<TableInfo>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(&Self::key(schema, table)).cloned()
    }

    /// Store `info` unless another task got there first; returns the cached entry.
    pub fn insert(&self, schema: &str, table: &str, info: TableInfo) -> Arc<TableInfo> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(Self::key(schema, table))
            .or_insert_with(|| Arc::new(info))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pk: &[&str]) -> TableInfo {
        TableInfo {
            columns: [("id", "integer"), ("day", "date")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            primary_key: pk.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_first_insert_wins() {
        let cache = TypeCastCache::new();
        assert!(cache.get("mes", "orders").is_none());
        cache.insert("mes", "orders", info(&["id"]));
        let kept = cache.insert("mes", "orders", info(&["day"]));
        assert_eq!(kept.primary_key, vec!["id"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = TypeCastCache::new();
        let shared = cache.clone();
        cache.insert("mes", "orders", info(&["id"]));
        assert_eq!(
            shared.get("mes", "orders").unwrap().column_type("day"),
            Some("date")
        );
        assert!(shared.get("other", "orders").is_none());
    }

    #[test]
    fn test_placeholder_casts_only_non_text() {
        assert_eq!(placeholder(1, Some("date")), "$1::text::date");
        assert_eq!(
            placeholder(2, Some("timestamp with time zone")),
            "$2::text::timestamp with time zone"
        );
        assert_eq!(placeholder(3, Some("character varying")), "$3::text");
        assert_eq!(placeholder(4, None), "$4::text");
    }
}
