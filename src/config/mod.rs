// ABOUTME: Job and application configuration
// ABOUTME: Parses job documents from TOML or JSON and validates them before any run

pub mod app;
pub mod job;
pub mod mapping;
pub mod window;

pub use app::AppConfig;
pub use job::{
    DualSource, DuplicatePolicy, EchoPolicy, ErrorPolicy, ItemEchoPolicy, Job, JobKind, JoinKey,
    MarkTarget, PullSpec, PushSpec, Require, SingleSource, SourceConfig, SuccessPolicy,
    TargetConfig, WriteMode,
};
pub use mapping::{
    DateRule, MappingConfig, NullPolicy, ResolvedSection, Section, TimeRule, TransformOptions,
};
pub use window::{Combine, DateTimePair, FilterWindow, LiteralStyle, Lookback, WindowMode};

use anyhow::{Context, Result};
use std::path::Path;

/// Read a job document. `.json` files are parsed as JSON, everything else as TOML.
pub fn load_job(path: &Path) -> Result<Job> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let job = if is_json {
        parse_json(&text)
    } else {
        parse_toml(&text)
    }
    .with_context(|| format!("Failed to parse job file {}", path.display()))?;

    job.validate()?;
    Ok(job)
}

pub fn parse_toml(text: &str) -> Result<Job> {
    Ok(toml::from_str(text)?)
}

pub fn parse_json(text: &str) -> Result<Job> {
    Ok(serde_json::from_str(text)?)
}
