// ABOUTME: Job document model: a pull or push job resolved once at load time
// ABOUTME: Validation runs here so configuration errors surface before any I/O

use anyhow::Result;
use serde::Deserialize;

use super::mapping::{MappingConfig, Section, TransformOptions};
use super::window::FilterWindow;
use crate::error::SyncError;
use crate::ident;

pub const DEFAULT_DUPLICATE_CODE: &str = "DBSQL_DUPLICATE_KEY_ERROR";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub odata_url: String,
    #[serde(default)]
    pub mapping: MappingConfig,
    /// Job-level transform options, layered between mapping defaults and sections.
    #[serde(default)]
    pub transform: TransformOptions,
    #[serde(flatten)]
    pub kind: JobKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum JobKind {
    Pull(PullSpec),
    Push(PushSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Delete everything, insert the new set, one transaction.
    Replace,
    /// Row-wise insert with savepoint fallback.
    #[default]
    Insert,
    /// Row-wise upsert on the primary key with savepoint fallback.
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Record the failure against the row and keep going.
    #[default]
    Continue,
    /// The first failure aborts the run.
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default = "default_target_batch")]
    pub batch_size: usize,
    /// Conflict key for upserts. Introspected from the primary key when absent.
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSpec {
    pub target: TargetConfig,
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Delete all target rows before a row-wise insert.
    #[serde(default)]
    pub truncate: bool,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    pub filter_window: Option<FilterWindow>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSource {
    pub sql: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinKey {
    pub header: String,
    pub item: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DualSource {
    pub header_sql: String,
    pub item_sql: String,
    #[serde(default)]
    pub join: Vec<JoinKey>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Single(SingleSource),
    Dual(DualSource),
}

/// Where push outcomes are written back.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkTarget {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub pk: Vec<String>,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_message_column")]
    pub message_column: String,
    pub sent_at_column: Option<String>,
    #[serde(default = "default_sent_value")]
    pub sent_value: String,
    #[serde(default = "default_error_value")]
    pub error_value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicatePolicy {
    #[serde(default = "default_duplicate_codes")]
    pub codes: Vec<String>,
    #[serde(default)]
    pub as_sent: bool,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            codes: default_duplicate_codes(),
            as_sent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Require {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EchoPolicy {
    pub keys: Vec<String>,
    #[serde(default)]
    pub require: Require,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemEchoPolicy {
    /// Dot path into the response body, e.g. `to_Item.results`.
    pub path: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub require: Require,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessPolicy {
    #[serde(default = "default_messages_key")]
    pub messages_key: String,
    /// Response key holding the item array whose nested messages are also scanned.
    pub items_key: Option<String>,
    pub header_echo: Option<EchoPolicy>,
    pub item_echo: Option<ItemEchoPolicy>,
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        Self {
            messages_key: default_messages_key(),
            items_key: None,
            header_echo: None,
            item_echo: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSpec {
    pub source: SourceConfig,
    pub mark: MarkTarget,
    #[serde(default = "default_push_batch")]
    pub batch_size: usize,
    #[serde(default)]
    pub fail_mode: ErrorPolicy,
    #[serde(default)]
    pub duplicate: DuplicatePolicy,
    /// Body key that carries the item lines of a header+items POST.
    #[serde(default = "default_items_key")]
    pub items_key: String,
    pub filter_window: Option<FilterWindow>,
    #[serde(default)]
    pub sap_success: SuccessPolicy,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_target_batch() -> usize {
    500
}

fn default_page_size() -> usize {
    1000
}

fn default_concurrency() -> usize {
    1
}

fn default_push_batch() -> usize {
    50
}

fn default_items_key() -> String {
    "items".to_string()
}

fn default_status_column() -> String {
    "sync_status".to_string()
}

fn default_message_column() -> String {
    "sync_message".to_string()
}

fn default_sent_value() -> String {
    "SENT".to_string()
}

fn default_error_value() -> String {
    "ERROR".to_string()
}

fn default_duplicate_codes() -> Vec<String> {
    vec![DEFAULT_DUPLICATE_CODE.to_string()]
}

fn default_messages_key() -> String {
    "messages".to_string()
}

impl Job {
    pub fn mode_name(&self) -> &'static str {
        match self.kind {
            JobKind::Pull(_) => "pull",
            JobKind::Push(_) => "push",
        }
    }

    /// Check the job for everything that can be rejected without I/O.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SyncError::config("job id must not be empty").into());
        }
        reqwest::Url::parse(&self.odata_url).map_err(|e| {
            SyncError::config(format!("job '{}': invalid odataUrl: {}", self.id, e))
        })?;

        match &self.kind {
            JobKind::Pull(pull) => self.validate_pull(pull)?,
            JobKind::Push(push) => self.validate_push(push)?,
        }
        self.check_mapping()
    }

    /// Resolve every configured section so bad transform options fail here.
    fn check_mapping(&self) -> Result<()> {
        let mut sections = vec![Section::Item];
        if self.mapping.has_header() {
            sections.push(Section::Header);
        }
        for section in sections {
            self.mapping
                .resolve(section, &self.transform)
                .map_err(|e| match e.downcast_ref::<SyncError>() {
                    Some(SyncError::Config(msg)) => self.config_error(msg),
                    _ => self.config_error(&e.to_string()),
                })?;
        }
        Ok(())
    }

    fn validate_pull(&self, pull: &PullSpec) -> Result<()> {
        let target = &pull.target;
        self.check_ident(&target.schema)?;
        self.check_ident(&target.table)?;
        if target.columns.is_empty() {
            return Err(self.config_error("target.columns must not be empty"));
        }
        for column in target.columns.iter().chain(target.key.iter().flatten()) {
            self.check_ident(column)?;
        }
        if target.batch_size == 0 || pull.page_size == 0 {
            return Err(self.config_error("batchSize and pageSize must be positive"));
        }
        if let Some(window) = &pull.filter_window {
            self.check_window(window)?;
            if window.is_incremental() && pull.write_mode == WriteMode::Replace {
                return Err(self.config_error(
                    "filterWindow.mode = sinceLastSuccess cannot be combined with writeMode = replace",
                ));
            }
        }
        Ok(())
    }

    fn validate_push(&self, push: &PushSpec) -> Result<()> {
        let mark = &push.mark;
        self.check_ident(&mark.schema)?;
        self.check_ident(&mark.table)?;
        if mark.pk.is_empty() {
            return Err(self.config_error("mark.pk must name at least one column"));
        }
        for column in mark
            .pk
            .iter()
            .chain([&mark.status_column, &mark.message_column])
            .chain(mark.sent_at_column.iter())
        {
            self.check_ident(column)?;
        }
        if push.batch_size == 0 {
            return Err(self.config_error("batchSize must be positive"));
        }
        match &push.source {
            SourceConfig::Single(single) => {
                if single.concurrency == 0 {
                    return Err(self.config_error("source.concurrency must be at least 1"));
                }
            }
            SourceConfig::Dual(dual) => {
                if dual.join.is_empty() {
                    return Err(self.config_error("dual source requires at least one join key"));
                }
                if !self.mapping.has_header() {
                    return Err(
                        self.config_error("dual source requires a mapping.header section")
                    );
                }
            }
        }
        if self.mapping.has_header() && push.items_key.trim().is_empty() {
            return Err(self.config_error("itemsKey must not be empty"));
        }
        if let Some(window) = &push.filter_window {
            self.check_window(window)?;
        }
        Ok(())
    }

    fn check_window(&self, window: &FilterWindow) -> Result<()> {
        window
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| self.config_error(&format!("unknown timezone '{}'", window.timezone)))?;
        if window.lookback.duration() < chrono::Duration::zero() {
            return Err(self.config_error("lookback must not be negative"));
        }
        Ok(())
    }

    fn check_ident(&self, name: &str) -> Result<()> {
        ident::validate(name).map_err(|e| self.config_error(&e.to_string()))
    }

    fn config_error(&self, msg: &str) -> anyhow::Error {
        SyncError::config(format!("job '{}': {}", self.id, msg)).into()
    }
}
