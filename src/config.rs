//! Engine configuration.
//!
//! Defaults suit an embedded, in-memory engine. Every field can be overridden
//! from the environment:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `GNODE_DB_PATH` | `db_path` | in-memory |
//! | `GNODE_DEBOUNCE_MS` | `debounce` | 16 ms |
//! | `GNODE_MERGE_THRESHOLD` | `merge_threshold` | 1024 rows |
//! | `GNODE_BROADCAST_CAPACITY` | `broadcast_capacity` | 1024 deltas |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::subscription::DEFAULT_BROADCAST_CAPACITY;

/// Default debounce window for flushes and refresh passes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(16);

/// Default delta-log size that triggers a merge into the main table.
pub const DEFAULT_MERGE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Database file; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// How long a table buffers rows before flushing, and how long a refresh
    /// pass waits after being triggered.
    pub debounce: Duration,
    /// Delta-log rows that trigger a merge into the main table.
    pub merge_threshold: usize,
    /// Deltas a change stream may fall behind before it lags.
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            debounce: DEFAULT_DEBOUNCE,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Uses a database file instead of memory.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_merge_threshold(mut self, rows: usize) -> Self {
        self.merge_threshold = rows;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Loads overrides from `GNODE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads overrides through `lookup` (`key → value`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = lookup("GNODE_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "GNODE_DEBOUNCE_MS")? {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(rows) = parse_var(&lookup, "GNODE_MERGE_THRESHOLD")? {
            config.merge_threshold = rows;
        }
        if let Some(cap) = parse_var(&lookup, "GNODE_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = cap;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.merge_threshold == 0 {
            return Err(Error::InvalidConfig("merge_threshold must be at least 1".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(Error::InvalidConfig("broadcast_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key}: cannot parse '{raw}'"))),
    }
}
