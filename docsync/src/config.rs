//! Configuration for the synchronization engine
//!
//! Default config location: ./docsync.toml. Every field has a default, so a
//! missing or empty file yields a usable configuration.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_UNIQUE_FIELD: &str = "_id";

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// What the coordinator does when one collection fails
    #[serde(default)]
    pub on_collection_error: ErrorPolicy,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// What happens once a collection's document count equals its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Sleep for the idle interval and look again; the collection may grow.
    #[default]
    KeepPolling,
    /// Stop the worker the first time the collection is caught up.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log the failed collection and keep the others running
    #[default]
    Continue,
    /// Cancel every worker on the first collection error
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Root directory of the JSONL source store (one sub-directory per database)
    #[serde(default = "default_source_root")]
    pub root: PathBuf,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Per-collection batch size overrides
    #[serde(default)]
    pub collection_batch: HashMap<String, usize>,
    /// Sleep after a non-empty batch
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Sleep once a collection is caught up
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,
    /// Per-collection poll interval overrides (seconds)
    #[serde(default)]
    pub collection_poll_interval: HashMap<String, u64>,
    #[serde(default = "default_sort_key")]
    pub sort_key: String,
    #[serde(default)]
    pub sort_order: SortOrder,
    /// Collections to replicate; empty means all
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub drain_policy: DrainPolicy,
    /// Batches buffered between a poller and its pipeline
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_source_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_database() -> String {
    "test".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_poll_interval() -> u64 {
    10
}

fn default_idle_interval() -> u64 {
    60
}

fn default_sort_key() -> String {
    "created_at".to_string()
}

fn default_channel_capacity() -> usize {
    10
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_source_root(),
            database: default_database(),
            batch_size: default_batch_size(),
            collection_batch: HashMap::new(),
            poll_interval_secs: default_poll_interval(),
            idle_interval_secs: default_idle_interval(),
            collection_poll_interval: HashMap::new(),
            sort_key: default_sort_key(),
            sort_order: SortOrder::default(),
            allow_list: Vec::new(),
            drain_policy: DrainPolicy::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Index name rollover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rollover {
    /// `<prefix>-YYYY-MM-DD`
    #[default]
    Daily,
    /// `<prefix>`
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_addresses")]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Unique-identifier field, keyed by index prefix or collection name
    #[serde(default)]
    pub unique_fields: HashMap<String, String>,
    /// Collection name to index prefix
    #[serde(default)]
    pub coll_prefix: HashMap<String, String>,
    #[serde(default)]
    pub rollover: Rollover,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Skip TLS certificate verification (development clusters only)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_addresses() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_timeout() -> u64 {
    30
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            user: String::new(),
            password: String::new(),
            unique_fields: HashMap::new(),
            coll_prefix: HashMap::new(),
            rollover: Rollover::default(),
            timeout_secs: default_timeout(),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Durable logs are kept in `<state_dir>/cursors`
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_collection_maps_dir")]
    pub collection_maps_dir: PathBuf,
    #[serde(default = "default_index_maps_dir")]
    pub index_maps_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./processed")
}

fn default_collection_maps_dir() -> PathBuf {
    PathBuf::from("./mappers/collections")
}

fn default_index_maps_dir() -> PathBuf {
    PathBuf::from("./mappers/indices")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            collection_maps_dir: default_collection_maps_dir(),
            index_maps_dir: default_index_maps_dir(),
        }
    }
}

/// How arrays are treated while flattening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArrayPolicy {
    /// Keep arrays as opaque values; field maps may coalesce them later
    #[default]
    Retain,
    /// Flatten each element under an indexed sub-path (`tags.0`, `tags.1`)
    Index,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingConfig {
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub array_policy: ArrayPolicy,
}

fn default_separator() -> String {
    ".".to_string()
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            array_policy: ArrayPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log output format: "pretty" or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve Prometheus metrics on this address when set
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info,docsync=debug".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
            metrics_addr: None,
        }
    }
}

/// Parse `coll:index,coll2:index2` pairs. Malformed pairs are skipped.
pub fn parse_prefix_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let mut parts = pair.split(':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(coll), Some(index), None) if !coll.trim().is_empty() && !index.trim().is_empty() => {
                    Some((coll.trim().to_string(), index.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

impl Config {
    /// Load config from a file path; a missing file yields defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            Self::from_toml(&content)
        } else {
            tracing::info!("Config {} not found, using defaults", config_path.display());
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config, then apply `DOCSYNC_*` environment overrides.
    pub fn load_with_env(config_path: &Path) -> Result<Self> {
        let mut config = Self::load(config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup("DOCSYNC_DB").filter(|v| !v.is_empty()) {
            self.source.database = db;
        }
        if let Some(colls) = lookup("DOCSYNC_COLLECTIONS").filter(|v| !v.is_empty()) {
            self.source.allow_list = if colls.trim() == "*" {
                Vec::new()
            } else {
                colls
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            };
        }
        if let Some(pairs) = lookup("DOCSYNC_INDEX_PREFIXES").filter(|v| !v.is_empty()) {
            self.index.coll_prefix.extend(parse_prefix_pairs(&pairs));
        }
        if let Some(addr) = lookup("DOCSYNC_ES_ADDR").filter(|v| !v.is_empty()) {
            self.index.addresses = addr.split(',').map(|a| a.trim().to_string()).collect();
        }
        if let Some(user) = lookup("DOCSYNC_ES_USER") {
            self.index.user = user;
        }
        if let Some(password) = lookup("DOCSYNC_ES_PASSWORD") {
            self.index.password = password;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.source.batch_size == 0 {
            return Err(SyncError::Config("source.batch_size must be positive".into()));
        }
        if let Some((coll, _)) = self.source.collection_batch.iter().find(|(_, n)| **n == 0) {
            return Err(SyncError::Config(format!(
                "source.collection_batch.{} must be positive",
                coll
            )));
        }
        if self.source.channel_capacity == 0 {
            return Err(SyncError::Config("source.channel_capacity must be positive".into()));
        }
        if self.mapping.separator.is_empty() {
            return Err(SyncError::Config("mapping.separator must not be empty".into()));
        }
        Ok(())
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.cursor_dir())?;
        Ok(())
    }

    /// Directory holding the per-collection durable logs
    pub fn cursor_dir(&self) -> PathBuf {
        self.paths.state_dir.join("cursors")
    }

    pub fn batch_size_for(&self, collection: &str) -> usize {
        self.source
            .collection_batch
            .get(collection)
            .copied()
            .unwrap_or(self.source.batch_size)
    }

    pub fn poll_interval_for(&self, collection: &str) -> Duration {
        let secs = self
            .source
            .collection_poll_interval
            .get(collection)
            .copied()
            .unwrap_or(self.source.poll_interval_secs);
        Duration::from_secs(secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.source.idle_interval_secs)
    }

    pub fn is_allowed(&self, collection: &str) -> bool {
        self.source.allow_list.is_empty() || self.source.allow_list.iter().any(|c| c == collection)
    }

    /// Index prefix for a collection, defaulting to the collection name.
    pub fn index_prefix_for(&self, collection: &str) -> String {
        self.index
            .coll_prefix
            .get(collection)
            .cloned()
            .unwrap_or_else(|| collection.to_string())
    }

    /// Unique field: prefix override, then collection override, then `_id`.
    pub fn unique_field_for(&self, prefix: &str, collection: &str) -> String {
        self.index
            .unique_fields
            .get(prefix)
            .or_else(|| self.index.unique_fields.get(collection))
            .cloned()
            .unwrap_or_else(|| DEFAULT_UNIQUE_FIELD.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.source.database, "test");
        assert_eq!(config.source.batch_size, 100);
        assert_eq!(config.source.poll_interval_secs, 10);
        assert_eq!(config.source.sort_key, "created_at");
        assert_eq!(config.source.drain_policy, DrainPolicy::KeepPolling);
        assert_eq!(config.index.addresses, vec!["http://localhost:9200".to_string()]);
        assert_eq!(config.index.rollover, Rollover::Daily);
        assert_eq!(config.mapping.separator, ".");
        assert_eq!(config.mapping.array_policy, ArrayPolicy::Retain);
        assert_eq!(config.on_collection_error, ErrorPolicy::Continue);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::from_toml(
            r#"
[source]
database = "shop"

[index]
coll_prefix = { orders = "shop-orders" }
"#,
        )
        .unwrap();

        assert_eq!(config.source.database, "shop");
        assert_eq!(config.source.batch_size, 100);
        assert_eq!(config.source.idle_interval_secs, 60);
        assert!(config.source.allow_list.is_empty());
        assert_eq!(config.index.addresses, vec!["http://localhost:9200".to_string()]);
        assert_eq!(config.index_prefix_for("orders"), "shop-orders");
        assert_eq!(config.index_prefix_for("users"), "users");
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.source.database, "test");
        assert_eq!(config.source.channel_capacity, 10);
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = tempdir().unwrap();
        let config = Config::load(&temp.path().join("missing.toml")).unwrap();
        assert_eq!(config.source.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/docsync.toml");

        let mut config = Config::default();
        config.source.collection_batch.insert("users".into(), 500);
        config.source.drain_policy = DrainPolicy::Stop;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.batch_size_for("users"), 500);
        assert_eq!(loaded.batch_size_for("orders"), 100);
        assert_eq!(loaded.source.drain_policy, DrainPolicy::Stop);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = Config::from_toml("[source]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_unique_field_lookup_order() {
        let mut config = Config::default();
        assert_eq!(config.unique_field_for("users", "users"), "_id");

        config.index.unique_fields.insert("users".into(), "uid".into());
        assert_eq!(config.unique_field_for("people", "users"), "uid");

        config.index.unique_fields.insert("people".into(), "person_id".into());
        assert_eq!(config.unique_field_for("people", "users"), "person_id");
    }

    #[test]
    fn test_allow_list() {
        let mut config = Config::default();
        assert!(config.is_allowed("anything"));
        config.source.allow_list = vec!["users".into()];
        assert!(config.is_allowed("users"));
        assert!(!config.is_allowed("orders"));
    }

    #[test]
    fn test_poll_interval_override() {
        let mut config = Config::default();
        config.source.collection_poll_interval.insert("events".into(), 2);
        assert_eq!(config.poll_interval_for("events"), Duration::from_secs(2));
        assert_eq!(config.poll_interval_for("users"), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_prefix_pairs() {
        let pairs = parse_prefix_pairs("users:people, orders:shop-orders,broken,a:b:c,:x");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["users"], "people");
        assert_eq!(pairs["orders"], "shop-orders");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("DOCSYNC_DB", "prod"),
            ("DOCSYNC_COLLECTIONS", "users, orders"),
            ("DOCSYNC_INDEX_PREFIXES", "users:people"),
            ("DOCSYNC_ES_ADDR", "https://es1:9200,https://es2:9200"),
            ("DOCSYNC_ES_USER", "elastic"),
        ]);
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.source.database, "prod");
        assert_eq!(config.source.allow_list, vec!["users".to_string(), "orders".to_string()]);
        assert_eq!(config.index_prefix_for("users"), "people");
        assert_eq!(config.index.addresses.len(), 2);
        assert_eq!(config.index.user, "elastic");
        assert_eq!(config.index.password, "");
    }

    #[test]
    fn test_env_wildcard_clears_allow_list() {
        let mut config = Config::default();
        config.source.allow_list = vec!["users".into()];
        config.apply_overrides(|k| (k == "DOCSYNC_COLLECTIONS").then(|| "*".to_string()));
        assert!(config.source.allow_list.is_empty());
    }

    #[test]
    fn test_ensure_dirs() {
        let temp = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.state_dir = temp.path().join("state");
        config.ensure_dirs().unwrap();
        assert!(config.cursor_dir().is_dir());
    }
}
