// ABOUTME: Process-wide settings for database, remote endpoint and cursor storage
// ABOUTME: Loaded from TOML, then overridden by environment variables

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSettings {
    pub url: Option<String>,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSettings {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    pub token: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CursorSettings {
    #[serde(default = "default_cursor_path")]
    pub path: PathBuf,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            path: default_cursor_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub cursor: CursorSettings,
}

fn default_statement_timeout() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    30
}

fn default_cursor_path() -> PathBuf {
    PathBuf::from(".odata-sync/cursors.db")
}

impl AppConfig {
    /// Load settings from `path` when it exists, then apply `DATABASE_URL`
    /// and `ODATA_TOKEN` from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read settings file {}", p.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("Failed to parse settings file {}", p.display()))?
            }
            _ => Self::default(),
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }
        if let Ok(token) = std::env::var("ODATA_TOKEN") {
            config.remote.token = Some(token);
        }
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.database.statement_timeout_secs)
    }
}
