// ABOUTME: Field mapping configuration and option resolution
// ABOUTME: Merges mapping defaults, job-level and section-level transform options

use anyhow::Result;
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullPolicy {
    /// Empty values become `""`.
    Empty,
    /// Empty values become `null`.
    Null,
    /// Empty values become `0`.
    Zero,
    /// Leave the value untouched.
    Pass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateRule {
    /// `20240102` -> `2024-01-02`
    Yyyymmdd,
    /// Already ISO; a datetime is cut down to its date part.
    Iso,
    /// Epoch millis, RFC 3339 or `/Date(ms)/` -> civil date in the section timezone.
    Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRule {
    /// `103000` -> `10:30:00`
    Hhmmss,
    /// Already `HH:mm[:ss]`.
    Iso,
    /// Epoch millis, RFC 3339 or `/Date(ms)/` -> time of day in the section timezone.
    Instant,
    /// `PT10H30M00S` -> `10:30:00`
    Duration,
}

/// Transform options that may appear at mapping, job and section level.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOptions {
    pub null_policy: Option<NullPolicy>,
    #[serde(default)]
    pub field_null_policy: BTreeMap<String, NullPolicy>,
    #[serde(default)]
    pub number_fields: Vec<String>,
    #[serde(default)]
    pub date_rules: BTreeMap<String, DateRule>,
    #[serde(default)]
    pub time_rules: BTreeMap<String, TimeRule>,
    #[serde(default)]
    pub length: BTreeMap<String, usize>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectionMapping {
    /// Destination field -> source column.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(flatten)]
    pub options: TransformOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub defaults: TransformOptions,
    pub header: Option<SectionMapping>,
    #[serde(default)]
    pub item: SectionMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Header,
    Item,
}

/// Options for one section after resolution.
#[derive(Debug, Clone)]
pub struct ResolvedSection {
    pub fields: BTreeMap<String, String>,
    pub null_policy: NullPolicy,
    pub field_null_policy: BTreeMap<String, NullPolicy>,
    pub number_fields: BTreeSet<String>,
    pub date_rules: BTreeMap<String, DateRule>,
    pub time_rules: BTreeMap<String, TimeRule>,
    pub length: BTreeMap<String, usize>,
    pub timezone: Tz,
}

impl ResolvedSection {
    pub fn null_policy_for(&self, field: &str) -> NullPolicy {
        self.field_null_policy
            .get(field)
            .copied()
            .unwrap_or(self.null_policy)
    }
}

impl MappingConfig {
    pub fn has_header(&self) -> bool {
        self.header
            .as_ref()
            .map(|h| !h.fields.is_empty())
            .unwrap_or(false)
    }

    /// Resolve a section against the job-level options.
    ///
    /// Scalars pick the first of section, job, defaults. Maps are merged
    /// defaults -> job -> section with later keys winning. Lists are unioned.
    pub fn resolve(&self, section: Section, job: &TransformOptions) -> Result<ResolvedSection> {
        let empty = SectionMapping::default();
        let mapping = match section {
            Section::Header => self.header.as_ref().unwrap_or(&empty),
            Section::Item => &self.item,
        };
        let layers = [&self.defaults, job, &mapping.options];

        let null_policy = layers
            .iter()
            .rev()
            .find_map(|o| o.null_policy)
            .unwrap_or(NullPolicy::Pass);

        let tz_name = layers
            .iter()
            .rev()
            .find_map(|o| o.timezone.clone())
            .unwrap_or_else(|| "UTC".to_string());
        let timezone: Tz = tz_name.parse().map_err(|e| {
            SyncError::config(format!("unknown timezone '{}' in mapping: {}", tz_name, e))
        })?;

        let mut resolved = ResolvedSection {
            fields: mapping.fields.clone(),
            null_policy,
            field_null_policy: BTreeMap::new(),
            number_fields: BTreeSet::new(),
            date_rules: BTreeMap::new(),
            time_rules: BTreeMap::new(),
            length: BTreeMap::new(),
            timezone,
        };

        for layer in layers {
            resolved
                .field_null_policy
                .extend(layer.field_null_policy.iter().map(|(k, v)| (k.clone(), *v)));
            resolved
                .number_fields
                .extend(layer.number_fields.iter().cloned());
            resolved
                .date_rules
                .extend(layer.date_rules.iter().map(|(k, v)| (k.clone(), *v)));
            resolved
                .time_rules
                .extend(layer.time_rules.iter().map(|(k, v)| (k.clone(), *v)));
            resolved
                .length
                .extend(layer.length.iter().map(|(k, v)| (k.clone(), *v)));
        }

        Ok(resolved)
    }
}
