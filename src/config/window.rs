// ABOUTME: Filter window settings for incremental pulls and windowed pushes
// ABOUTME: Deserialized from the `filterWindow` table of a job document

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowMode {
    /// `[now - lookback, now]` on every run.
    #[default]
    Relative,
    /// `[cursor, now]`, falling back to the lookback window on the first run.
    SinceLastSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    #[default]
    And,
    Or,
}

impl Combine {
    pub fn glue(self) -> &'static str {
        match self {
            Combine::And => " and ",
            Combine::Or => " or ",
        }
    }
}

/// Literal syntax for dates and times inside `$filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteralStyle {
    /// `2024-01-01` and `10:00:00`
    #[default]
    V4,
    /// `datetime'2024-01-01T00:00:00'` and `time'PT10H00M00S'`
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Lookback {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
}

impl Default for Lookback {
    fn default() -> Self {
        Self { days: 1, hours: 0 }
    }
}

impl Lookback {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(self.days) + chrono::Duration::hours(self.hours)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DateTimePair {
    pub date: String,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterWindow {
    #[serde(default)]
    pub mode: WindowMode,
    #[serde(default)]
    pub lookback: Lookback,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub pairs: Vec<DateTimePair>,
    #[serde(default)]
    pub combine: Combine,
    #[serde(default = "default_inclusive")]
    pub inclusive: bool,
    #[serde(default)]
    pub literals: LiteralStyle,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_inclusive() -> bool {
    true
}

impl FilterWindow {
    pub fn is_incremental(&self) -> bool {
        self.mode == WindowMode::SinceLastSuccess
    }
}
