// ABOUTME: Verifies remote POST responses: severity messages, header echo and item echo
// ABOUTME: Checks short-circuit in that order; all must pass for a push to count as sent

use serde_json::Value;

use crate::config::{Require, SuccessPolicy};
use crate::mapper::Row;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub ok: bool,
    pub reason: Option<String>,
    /// Per submitted item, whether the response echoed it back. Empty when
    /// no item echo check ran.
    pub item_matches: Vec<bool>,
}

impl Verdict {
    fn pass(item_matches: Vec<bool>) -> Self {
        Self {
            ok: true,
            reason: None,
            item_matches,
        }
    }

    fn fail(reason: String, item_matches: Vec<bool>) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            item_matches,
        }
    }
}

/// OData v2 wraps payloads in `{"d": ...}`.
pub fn unwrap_envelope(body: &Value) -> &Value {
    match body.get("d") {
        Some(inner) if inner.is_object() || inner.is_array() => inner,
        _ => body,
    }
}

/// Arrays may arrive bare or as `{"results": [...]}`.
fn as_entries(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("results").and_then(Value::as_array),
        _ => None,
    }
}

fn lookup_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(body, |node, seg| match node {
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => node.get(seg),
        })
}

/// String-normalised, trimmed comparison value.
pub fn normalize(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

fn severity_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_error_message(entry: &Value) -> bool {
    let severity = entry.get("severity");
    if let Some(Value::String(s)) = severity {
        if s.trim().eq_ignore_ascii_case("error") {
            return true;
        }
    }
    [severity, entry.get("numericSeverity")]
        .into_iter()
        .flatten()
        .filter_map(severity_number)
        .any(|n| n >= 4.0)
}

fn first_error(container: &Value, messages_key: &str) -> Option<String> {
    let messages = container.get(messages_key).and_then(as_entries)?;
    messages.iter().find(|m| is_error_message(m)).map(|m| {
        m.get("message")
            .and_then(Value::as_str)
            .unwrap_or("error message in response")
            .to_string()
    })
}

fn check_severity(policy: &SuccessPolicy, body: &Value) -> Option<String> {
    if let Some(msg) = first_error(body, &policy.messages_key) {
        return Some(format!("error message: {}", msg));
    }
    let items_key = policy.items_key.as_deref()?;
    let items = body.get(items_key).and_then(as_entries)?;
    items.iter().enumerate().find_map(|(idx, item)| {
        first_error(item, &policy.messages_key).map(|msg| format!("item {} error message: {}", idx, msg))
    })
}

fn satisfied(require: Require, results: &[bool]) -> bool {
    match require {
        Require::All => results.iter().all(|m| *m),
        Require::Any => results.is_empty() || results.iter().any(|m| *m),
    }
}

/// Verify `response` for a POST that carried `sent` (header or single row
/// body) and `sent_items` (item lines, empty for single-row pushes).
pub fn verify(policy: &SuccessPolicy, sent: &Row, sent_items: &[Row], response: &Value) -> Verdict {
    let body = unwrap_envelope(response);

    if let Some(reason) = check_severity(policy, body) {
        return Verdict::fail(reason, Vec::new());
    }

    if let Some(echo) = &policy.header_echo {
        let results: Vec<bool> = echo
            .keys
            .iter()
            .map(|k| normalize(sent.get(k)) == normalize(body.get(k)))
            .collect();
        if !satisfied(echo.require, &results) {
            let mismatched: Vec<&str> = echo
                .keys
                .iter()
                .zip(&results)
                .filter(|(_, ok)| !**ok)
                .map(|(k, _)| k.as_str())
                .collect();
            return Verdict::fail(
                format!("header echo mismatch on {}", mismatched.join(", ")),
                Vec::new(),
            );
        }
    }

    let Some(item_echo) = &policy.item_echo else {
        return Verdict::pass(Vec::new());
    };

    let entries = lookup_path(body, &item_echo.path)
        .and_then(as_entries)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let matches: Vec<bool> = sent_items
        .iter()
        .map(|item| {
            entries.iter().any(|entry| {
                item_echo
                    .keys
                    .iter()
                    .all(|k| normalize(item.get(k)) == normalize(entry.get(k)))
            })
        })
        .collect();

    if satisfied(item_echo.require, &matches) {
        Verdict::pass(matches)
    } else {
        let missing = matches.iter().filter(|m| !**m).count();
        Verdict::fail(
            format!("{} of {} items not echoed at '{}'", missing, matches.len(), item_echo.path),
            matches,
        )
    }
}
