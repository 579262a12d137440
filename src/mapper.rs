// ABOUTME: Field mapper applying null policy, numeric coercion, date/time rules and length clamps
// ABOUTME: Pure functions over JSON rows; shared by the pull and push engines

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Number, Value};

use crate::config::{DateRule, NullPolicy, ResolvedSection, TimeRule};

/// A source or destination row: column name to value.
pub type Row = Map<String, Value>;

pub const ZERO_DATE: &str = "0000-00-00";
pub const ZERO_TIME: &str = "00:00:00";

/// Missing, `null`, or a blank string.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Map one destination field. `None` means the field stays absent.
pub fn transform_field(dest: &str, raw: Option<&Value>, section: &ResolvedSection) -> Option<Value> {
    let mut value = raw.cloned();

    if is_empty(raw) {
        value = match section.null_policy_for(dest) {
            NullPolicy::Empty => Some(Value::String(String::new())),
            NullPolicy::Null => Some(Value::Null),
            NullPolicy::Zero => Some(Value::from(0)),
            NullPolicy::Pass => value,
        };
    }

    let mut value = value?;

    if section.number_fields.contains(dest) {
        value = coerce_number(&value);
    }

    if let Some(rule) = section.date_rules.get(dest) {
        value = apply_date_rule(*rule, &value, &section.timezone);
    }
    if let Some(rule) = section.time_rules.get(dest) {
        value = apply_time_rule(*rule, &value, &section.timezone);
    }

    if let (Some(max), Value::String(s)) = (section.length.get(dest), &value) {
        if let Some((idx, _)) = s.char_indices().nth(*max) {
            value = Value::String(s[..idx].to_string());
        }
    }

    Some(value)
}

/// Map a row through the section's field map.
///
/// With no fields configured every source column passes through under its own name.
pub fn map_section(source: &Row, section: &ResolvedSection) -> Row {
    let mut out = Row::new();
    if section.fields.is_empty() {
        for (name, value) in source {
            if let Some(v) = transform_field(name, Some(value), section) {
                out.insert(name.clone(), v);
            }
        }
        return out;
    }
    for (dest, src) in &section.fields {
        if let Some(v) = transform_field(dest, source.get(src), section) {
            out.insert(dest.clone(), v);
        }
    }
    out
}

/// Map a row into a tuple ordered by `columns`. Unmapped columns read the
/// source field of the same name.
pub fn map_columns(source: &Row, section: &ResolvedSection, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|col| {
            let src = section.fields.get(col).unwrap_or(col);
            transform_field(col, source.get(src), section).unwrap_or(Value::Null)
        })
        .collect()
}

pub fn coerce_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::Bool(b) => Value::from(i64::from(*b)),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::Null;
            }
            match trimmed.parse::<f64>() {
                Ok(f) if f.is_finite() => number_value(f),
                _ => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        return Value::from(f as i64);
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn is_zero_literal(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.trim() == "0",
        _ => false,
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn apply_date_rule(rule: DateRule, value: &Value, tz: &Tz) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    if is_zero_literal(value) {
        return Value::String(ZERO_DATE.to_string());
    }
    let date = match rule {
        DateRule::Yyyymmdd => text_of(value).and_then(|s| {
            NaiveDate::parse_from_str(&s, "%Y%m%d")
                .ok()
                .filter(|_| s.len() == 8)
                .or_else(|| parse_iso_date(&s))
        }),
        DateRule::Iso => text_of(value).and_then(|s| parse_iso_date(&s)),
        DateRule::Instant => parse_instant(value).map(|i| i.with_timezone(tz).date_naive()),
    };
    date.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

pub fn apply_time_rule(rule: TimeRule, value: &Value, tz: &Tz) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    if is_zero_literal(value) {
        return Value::String(ZERO_TIME.to_string());
    }
    let time = match rule {
        TimeRule::Hhmmss => text_of(value).and_then(|s| {
            let padded = if s.len() < 6 && s.chars().all(|c| c.is_ascii_digit()) {
                format!("{:0>6}", s)
            } else {
                s
            };
            NaiveTime::parse_from_str(&padded, "%H%M%S")
                .ok()
                .filter(|_| padded.len() == 6)
                .or_else(|| parse_iso_time(&padded))
        }),
        TimeRule::Iso => text_of(value).and_then(|s| parse_iso_time(&s)),
        TimeRule::Instant => parse_instant(value).map(|i| i.with_timezone(tz).time()),
        TimeRule::Duration => text_of(value).and_then(|s| parse_duration_time(&s)),
    };
    time.map(|t| Value::String(t.format("%H:%M:%S").to_string()))
        .unwrap_or(Value::Null)
}

fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    let head = s.get(..10)?;
    let date = NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()?;
    match s.as_bytes().get(10) {
        None | Some(b'T') | Some(b' ') => Some(date),
        _ => None,
    }
}

fn parse_iso_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// `PT10H05M00S` -> 10:05:00
fn parse_duration_time(s: &str) -> Option<NaiveTime> {
    let rest = s.strip_prefix("PT")?;
    let (mut h, mut m, mut sec) = (0u32, 0u32, 0u32);
    let mut digits = String::new();
    for ch in rest.chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            'H' | 'M' | 'S' => {
                let n: u32 = digits.parse().ok()?;
                digits.clear();
                match ch {
                    'H' => h = n,
                    'M' => m = n,
                    _ => sec = n,
                }
            }
            _ => return None,
        }
    }
    if !digits.is_empty() {
        return None;
    }
    NaiveTime::from_hms_opt(h, m, sec)
}

/// Epoch millis (number or digit string), `/Date(ms)/`, RFC 3339, or a
/// naive ISO datetime taken as UTC.
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Some(inner) = s.strip_prefix("/Date(").and_then(|r| r.strip_suffix(")/")) {
                // Offset suffix (`+0100`) is ignored; a leading sign belongs to the millis.
                let end = inner
                    .char_indices()
                    .skip(1)
                    .find(|(_, c)| *c == '+' || *c == '-')
                    .map(|(i, _)| i)
                    .unwrap_or(inner.len());
                let ms: i64 = inner[..end].parse().ok()?;
                return Utc.timestamp_millis_opt(ms).single();
            }
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                let ms: i64 = s.parse().ok()?;
                return Utc.timestamp_millis_opt(ms).single();
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .map(|n| n.and_utc())
        }
        _ => None,
    }
}
