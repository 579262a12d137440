// ABOUTME: Builds OData $filter predicates that bound date/time column pairs to an instant range
// ABOUTME: Also injects a predicate into a collection URL, AND-ing with any existing $filter

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Url;
use urlencoding::encode;

use crate::config::{DateTimePair, FilterWindow, LiteralStyle, WindowMode};

/// Inclusive instant range a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn lookback(window: &FilterWindow, now: DateTime<Utc>) -> Self {
        Self {
            from: now - window.lookback.duration(),
            to: now,
        }
    }

    /// Resolve the range for a run starting at `now`.
    ///
    /// `cursor` is the persisted last-success epoch millis, only consulted in
    /// `sinceLastSuccess` mode.
    pub fn resolve(window: &FilterWindow, now: DateTime<Utc>, cursor: Option<i64>) -> Self {
        match window.mode {
            WindowMode::Relative => Self::lookback(window, now),
            WindowMode::SinceLastSuccess => match cursor.and_then(from_epoch_ms) {
                Some(from) => Self { from, to: now },
                None => Self::lookback(window, now),
            },
        }
    }
}

pub fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

struct Bound {
    date: String,
    time: String,
}

fn civil_bound(instant: DateTime<Utc>, tz: &Tz, style: LiteralStyle) -> Bound {
    let local = instant.with_timezone(tz);
    match style {
        LiteralStyle::V4 => Bound {
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M:%S").to_string(),
        },
        LiteralStyle::V2 => Bound {
            date: local.format("datetime'%Y-%m-%dT00:00:00'").to_string(),
            time: local.format("time'PT%HH%MM%SS'").to_string(),
        },
    }
}

fn pair_predicate(pair: &DateTimePair, from: &Bound, to: &Bound, inclusive: bool) -> String {
    let (ge, le) = if inclusive { ("ge", "le") } else { ("gt", "lt") };
    let d = &pair.date;
    let t = &pair.time;
    format!(
        "({d} ne null and (({d} gt {fd}) or ({d} eq {fd} and {t} {ge} {ft})) and (({d} lt {td}) or ({d} eq {td} and {t} {le} {tt})))",
        fd = from.date,
        ft = from.time,
        td = to.date,
        tt = to.time,
    )
}

/// Build the predicate for `range`, or `None` when the window names no pairs.
pub fn build_predicate(window: &FilterWindow, range: &TimeRange) -> Result<Option<String>> {
    if window.pairs.is_empty() {
        return Ok(None);
    }
    let tz: Tz = window
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Unknown filter timezone '{}'", window.timezone))?;

    let from = civil_bound(range.from, &tz, window.literals);
    let to = civil_bound(range.to, &tz, window.literals);

    let parts: Vec<String> = window
        .pairs
        .iter()
        .map(|pair| pair_predicate(pair, &from, &to, window.inclusive))
        .collect();

    if parts.len() == 1 {
        return Ok(parts.into_iter().next());
    }
    Ok(Some(parts.join(window.combine.glue())))
}

/// Inject `expr` as `$filter`, AND-ing it with the decoded existing filter if any.
pub fn append_filter(url: &str, expr: &str) -> Result<String> {
    let mut parsed = Url::parse(url).with_context(|| format!("Invalid collection URL '{}'", url))?;

    let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    match pairs.iter_mut().find(|(k, _)| k == "$filter") {
        Some((_, existing)) if !existing.trim().is_empty() => {
            *existing = format!("({}) and ({})", existing, expr);
        }
        Some((_, existing)) => *existing = expr.to_string(),
        None => pairs.push(("$filter".to_string(), expr.to_string())),
    }

    set_query_pairs(&mut parsed, &pairs);
    Ok(parsed.into())
}

/// Replace the query string, encoding spaces as `%20` rather than `+`.
/// System option names keep their leading `$` unescaped.
pub fn set_query_pairs(url: &mut Url, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        url.set_query(None);
        return;
    }
    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode_key(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    url.set_query(Some(&query));
}

fn encode_key(key: &str) -> String {
    match key.strip_prefix('$') {
        Some(name) => format!("${}", encode(name)),
        None => encode(key).into_owned(),
    }
}
