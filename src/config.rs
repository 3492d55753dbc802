//! Service configuration.
//!
//! Defaults are compiled in; a TOML file can override any subset. Invalid
//! configuration fails process start rather than being repaired silently.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, StatsError};

/// The implicit event-count field, always tracked.
pub const NUMBER_FIELD: &str = "NUMBER";

/// Rolling windows as `(interval_secs, secs_per_part)`: last hour at
/// one-minute parts, last day at one-hour parts.
pub const ROLLING_WINDOWS: [(u64, u64); 2] = [(3600, 60), (86400, 3600)];

/// Periodic counters as `(divider, period_hours)`: 6 h at 1 min buckets,
/// 144 h at 10 min buckets, 4368 h at 60 min buckets.
pub const PERIODIC_TOPOLOGY: [(u32, u32); 3] = [(60, 6), (6, 144), (1, 4368)];

/// A tracked metric column.
#[derive(Debug, Clone, Deserialize)]
pub struct Field {
    /// Column key as it appears in ingest payloads and archive documents.
    pub key: String,
    /// Human-readable label.
    pub name: String,
    /// Optional display format hint (e.g. `"time"`).
    #[serde(default)]
    pub format: Option<String>,
    /// Whether view endpoints expose the column.
    #[serde(default = "default_true")]
    pub visible: bool,
}

impl Field {
    fn new(key: &str, name: &str, format: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            format: format.map(str::to_string),
            visible: true,
        }
    }
}

/// A monitored application, in display order.
#[derive(Debug, Clone, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root directory for the store snapshot and archive collections.
    pub data_dir: PathBuf,
    /// Prefix prepended to every store key.
    pub store_prefix: String,
    /// Monitored applications, ordered.
    pub applications: Vec<Application>,
    /// Plain metric columns.
    pub fields: Vec<Field>,
    /// Duration-valued metric columns, charted as per-event means.
    pub time_fields: Vec<Field>,
    pub http: HttpConfig,
    /// Events older than this are pruned from the events collection.
    pub events_period_hours: u32,
    /// Bounded ingest queue capacity per stats kind.
    pub queue_capacity: usize,
    /// Cadence of counter `update()` rounds.
    pub counter_update_secs: u64,
    /// Cadence of materialized-view rebuilds.
    pub cache_update_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tally-data"),
            store_prefix: "appstats".to_string(),
            applications: Vec::new(),
            fields: vec![
                Field::new("sql", "SQL", None),
                Field::new("solr", "SOLR", None),
                Field::new("cache", "CACHE", None),
            ],
            time_fields: vec![
                Field::new("cpu_time", "CPU", Some("time")),
                Field::new("real_time", "TOTAL", Some("time")),
            ],
            http: HttpConfig::default(),
            events_period_hours: 4368,
            queue_capacity: 1024,
            counter_update_secs: 60,
            cache_update_secs: 60,
        }
    }
}

impl Config {
    /// Parse a TOML config file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|err| StatsError::InvalidConfig(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// All tracked field definitions with `NUMBER` guaranteed first.
    pub fn all_fields(&self) -> Vec<Field> {
        let mut all = Vec::with_capacity(1 + self.fields.len() + self.time_fields.len());
        let has_number = self
            .fields
            .iter()
            .chain(&self.time_fields)
            .any(|f| f.key == NUMBER_FIELD);
        if !has_number {
            all.push(Field::new(NUMBER_FIELD, NUMBER_FIELD, None));
        }
        all.extend(self.fields.iter().cloned());
        all.extend(self.time_fields.iter().cloned());
        all
    }

    /// Keys of all tracked fields, `NUMBER` first.
    pub fn field_keys(&self) -> Vec<String> {
        self.all_fields().into_iter().map(|f| f.key).collect()
    }

    /// Keys of fields exposed by view endpoints.
    pub fn visible_field_keys(&self) -> Vec<String> {
        self.all_fields()
            .into_iter()
            .filter(|f| f.visible)
            .map(|f| f.key)
            .collect()
    }

    /// Keys of the duration-valued fields, in configured order.
    pub fn time_field_keys(&self) -> Vec<String> {
        self.time_fields.iter().map(|f| f.key.clone()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for field in self.fields.iter().chain(&self.time_fields) {
            if field.key.is_empty() {
                return Err(StatsError::InvalidConfig("empty field key".into()));
            }
            if field.key.contains(',') {
                return Err(StatsError::InvalidConfig(format!(
                    "field key {:?} contains a comma",
                    field.key
                )));
            }
            if !seen.insert(field.key.clone()) {
                return Err(StatsError::InvalidConfig(format!(
                    "duplicate field key {:?}",
                    field.key
                )));
            }
        }
        for app in &self.applications {
            if app.id.is_empty() || app.id.contains(',') {
                return Err(StatsError::InvalidConfig(format!(
                    "invalid app id {:?}",
                    app.id
                )));
            }
        }
        if self.store_prefix.is_empty() {
            return Err(StatsError::InvalidConfig("empty store prefix".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StatsError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        if self.events_period_hours == 0 {
            return Err(StatsError::InvalidConfig(
                "events_period_hours must be > 0".into(),
            ));
        }
        if self.counter_update_secs == 0 || self.cache_update_secs == 0 {
            return Err(StatsError::InvalidConfig(
                "update cadences must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
