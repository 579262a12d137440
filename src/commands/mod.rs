// ABOUTME: CLI subcommand implementations
// ABOUTME: Each command loads settings, applies flag overrides and drives the library

pub mod cursor;
pub mod filter;
pub mod run;

use anyhow::Result;
use std::path::{Path, PathBuf};

use odata_sync::config::AppConfig;

/// Settings file plus environment, with command-line flags applied last.
pub fn settings(
    config: &Path,
    database_url: Option<String>,
    cursor_db: Option<PathBuf>,
) -> Result<AppConfig> {
    let mut settings = AppConfig::load(Some(config))?;
    if let Some(url) = database_url {
        settings.database.url = Some(url);
    }
    if let Some(path) = cursor_db {
        settings.cursor.path = path;
    }
    Ok(settings)
}
