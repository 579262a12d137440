// ABOUTME: Push source shaping: dual-source joins and grouping rows under their mapped header
// ABOUTME: Header and item columns stay in separate maps so same-named fields never collide

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::config::{JoinKey, ResolvedSection};
use crate::mapper::{map_section, Row};
use crate::verify::normalize;

/// One pending row as read from the source database.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    Single(Row),
    Joined { header: Row, item: Row },
}

impl SourceRow {
    pub fn header(&self) -> &Row {
        match self {
            SourceRow::Single(row) => row,
            SourceRow::Joined { header, .. } => header,
        }
    }

    /// The part that carries the mark table's primary key.
    pub fn item(&self) -> &Row {
        match self {
            SourceRow::Single(row) => row,
            SourceRow::Joined { item, .. } => item,
        }
    }
}

fn join_key(row: &Row, columns: impl Iterator<Item = impl AsRef<str>>) -> Vec<String> {
    columns.map(|c| normalize(row.get(c.as_ref()))).collect()
}

pub fn item_key(item: &Row, join: &[JoinKey]) -> Vec<String> {
    join_key(item, join.iter().map(|k| &k.item))
}

pub fn header_key(header: &Row, join: &[JoinKey]) -> Vec<String> {
    join_key(header, join.iter().map(|k| &k.header))
}

/// Result of joining item rows to header rows.
#[derive(Debug, Default)]
pub struct Joined {
    pub rows: Vec<SourceRow>,
    /// Items whose key matched no header.
    pub orphans: Vec<Row>,
}

/// Join `items` to `headers` on the composite `join` key, keeping item order.
///
/// Headers are first filtered to the keys some item needs. When two headers
/// share a key the first one read wins.
pub fn join_dual(headers: Vec<Row>, items: Vec<Row>, join: &[JoinKey]) -> Joined {
    let needed: HashSet<Vec<String>> = items.iter().map(|i| item_key(i, join)).collect();

    let mut by_key: HashMap<Vec<String>, Row> = HashMap::new();
    for header in headers {
        let key = header_key(&header, join);
        if !needed.contains(&key) {
            continue;
        }
        if by_key.contains_key(&key) {
            warn!(key = ?key, "Duplicate header row for join key, keeping the first");
            continue;
        }
        by_key.insert(key, header);
    }

    let mut joined = Joined::default();
    for item in items {
        match by_key.get(&item_key(&item, join)) {
            Some(header) => joined.rows.push(SourceRow::Joined {
                header: header.clone(),
                item,
            }),
            None => joined.orphans.push(item),
        }
    }
    joined
}

/// Rows that share one mapped header, in first-seen order.
#[derive(Debug)]
pub struct Group<'a> {
    pub header: Row,
    /// Each source row with its mapped item body.
    pub members: Vec<(&'a SourceRow, Row)>,
}

/// Group rows by their mapped header values.
pub fn group_by_header<'a>(
    rows: &'a [SourceRow],
    header: &ResolvedSection,
    item: &ResolvedSection,
) -> Vec<Group<'a>> {
    let mut groups: Vec<Group<'a>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let mapped_header = map_section(row.header(), header);
        let key = Value::Object(mapped_header.clone()).to_string();
        let mapped_item = map_section(row.item(), item);
        match index.get(&key) {
            Some(&pos) => groups[pos].members.push((row, mapped_item)),
            None => {
                index.insert(key, groups.len());
                groups.push(Group {
                    header: mapped_header,
                    members: vec![(row, mapped_item)],
                });
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MappingConfig, Section, TransformOptions};
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn join() -> Vec<JoinKey> {
        vec![JoinKey {
            header: "order_no".into(),
            item: "order_ref".into(),
        }]
    }

    #[test]
    fn test_join_keeps_columns_separate() {
        let headers = vec![row(json!({"order_no": "A", "status": "H"}))];
        let items = vec![row(json!({"order_ref": "A", "status": "I", "line": 1}))];
        let joined = join_dual(headers, items, &join());

        assert!(joined.orphans.is_empty());
        let SourceRow::Joined { header, item } = &joined.rows[0] else {
            panic!("expected joined row");
        };
        assert_eq!(header["status"], json!("H"));
        assert_eq!(item["status"], json!("I"));
    }

    #[test]
    fn test_join_reports_orphans_and_ignores_unneeded_headers() {
        let headers = vec![
            row(json!({"order_no": "A"})),
            row(json!({"order_no": "Z"})),
        ];
        let items = vec![
            row(json!({"order_ref": "A", "line": 1})),
            row(json!({"order_ref": "B", "line": 2})),
            row(json!({"order_ref": "A", "line": 3})),
        ];
        let joined = join_dual(headers, items, &join());
        assert_eq!(joined.rows.len(), 2);
        assert_eq!(joined.orphans, vec![row(json!({"order_ref": "B", "line": 2}))]);
    }

    #[test]
    fn test_join_matches_numbers_against_strings() {
        let headers = vec![row(json!({"order_no": 7}))];
        let items = vec![row(json!({"order_ref": " 7 "}))];
        assert_eq!(join_dual(headers, items, &join()).rows.len(), 1);
    }

    #[test]
    fn test_group_in_first_seen_order() {
        let mapping: MappingConfig = serde_json::from_value(json!({
            "header": { "fields": { "OrderNo": "order_no" } },
            "item": { "fields": { "Line": "line" } }
        }))
        .unwrap();
        let opts = TransformOptions::default();
        let header = mapping.resolve(Section::Header, &opts).unwrap();
        let item = mapping.resolve(Section::Item, &opts).unwrap();

        let rows: Vec<SourceRow> = [("B", 1), ("A", 2), ("B", 3)]
            .iter()
            .map(|(o, l)| SourceRow::Single(row(json!({"order_no": o, "line": l}))))
            .collect();
        let groups = group_by_header(&rows, &header, &item);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].header, row(json!({"OrderNo": "B"})));
        let lines: Vec<&Value> = groups[0].members.iter().map(|(_, m)| &m["Line"]).collect();
        assert_eq!(lines, vec![&json!(1), &json!(3)]);
        assert_eq!(groups[1].members.len(), 1);
    }
}
