//! Store configuration.
//!
//! Settings live in `<root>/config.json`. Every field has a default, so a
//! store without a config file, or with an older one, still opens.
//! Environment overrides:
//!
//! - `TASKLOG_DIR` replaces discovery and names the store root directly;
//! - `TASKLOG_LOCK_TIMEOUT_MS` replaces `lock_timeout_ms`.

use crate::core::error::{Result, StoreError};
use crate::core::ids::is_valid_prefix;
use crate::core::notify::HookConfig;
use crate::storage::layout::{StoreLayout, MARKER_DIR};
use crate::storage::{codec, durable};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Prefix used for short ids when none is configured or inferable.
pub const DEFAULT_PREFIX: &str = "TASK";

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

const fn default_lock_poll_ms() -> u64 {
    10
}

const fn default_hook_timeout_ms() -> u64 {
    10_000
}

const fn default_true() -> bool {
    true
}

/// Tunables stored in `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Primary short-id prefix. When unset, the most used prefix in the
    /// index wins, then [`DEFAULT_PREFIX`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    /// Mirror every event into `events/_global.jsonl`.
    #[serde(default = "default_true")]
    pub mirror_global_log: bool,
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
    /// Settings written by newer versions.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefix: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_ms: default_lock_poll_ms(),
            mirror_global_log: true,
            hook_timeout_ms: default_hook_timeout_ms(),
            hooks: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Where a store lives and how it behaves.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// The marker directory itself, e.g. `/work/project/.tasklog`.
    pub root: PathBuf,
    pub settings: Settings,
}

impl RegistryConfig {
    /// Creates a config with default settings for `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            settings: Settings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Loads `config.json` under `root`, then applies environment overrides.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// names an invalid prefix.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let path = StoreLayout::new(&root).config_path();
        let bytes = durable::read_optional(&path)
            .map_err(|e| StoreError::from_storage(e, "config:load"))?;
        let settings = match bytes {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::corrupt("config_parse", format!("Invalid config.json: {e}"), "config:load")
                    .with_context("path", path.display().to_string())
            })?,
            None => Settings::default(),
        };
        let mut config = Self { root, settings };
        config.apply_overrides(env::var("TASKLOG_LOCK_TIMEOUT_MS").ok().as_deref());
        config.validate()?;
        Ok(config)
    }

    /// Finds the store for `start`: `TASKLOG_DIR` if set, otherwise the
    /// nearest `.tasklog` directory in `start` or its ancestors.
    ///
    /// # Errors
    /// Returns `not_found` if no store is found, or any [`RegistryConfig::load`] error.
    pub fn discover(start: &Path) -> Result<Self> {
        if let Ok(dir) = env::var("TASKLOG_DIR") {
            return Self::load(dir);
        }
        match Self::find_marker(start) {
            Some(root) => Self::load(root),
            None => Err(StoreError::not_found(
                "store_not_found",
                format!("No {MARKER_DIR} directory in {} or its parents", start.display()),
                "config:discover",
            )
            .with_hint("Initialise a store first")),
        }
    }

    /// Walks up from `start` looking for the marker directory.
    #[must_use]
    pub fn find_marker(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(MARKER_DIR))
            .find(|candidate| candidate.is_dir())
    }

    fn apply_overrides(&mut self, lock_timeout_ms: Option<&str>) {
        if let Some(raw) = lock_timeout_ms {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.settings.lock_timeout_ms = ms,
                Err(_) => warn!(value = raw, "ignoring invalid TASKLOG_LOCK_TIMEOUT_MS"),
            }
        }
    }

    /// Checks settings that would otherwise fail later.
    ///
    /// # Errors
    /// Returns a validation error for a malformed prefix.
    pub fn validate(&self) -> Result<()> {
        if let Some(prefix) = &self.settings.prefix {
            let counter_ok = match prefix.split_once('-') {
                Some((head, sub)) => is_valid_prefix(head) && is_valid_prefix(sub),
                None => is_valid_prefix(prefix),
            };
            if !counter_ok {
                return Err(StoreError::validation(
                    "invalid_prefix",
                    format!("Short-id prefix '{prefix}' must match [A-Z][A-Z0-9]*"),
                    "config:validate",
                )
                .with_context("prefix", prefix.clone()));
            }
        }
        Ok(())
    }

    /// Writes `config.json` atomically.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = StoreLayout::new(&self.root).config_path();
        codec::encode_document(&self.settings)
            .and_then(|bytes| durable::atomic_replace(&path, &bytes))
            .map_err(|e| StoreError::from_storage(e, "config:save"))
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.lock_timeout_ms)
    }

    #[must_use]
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.lock_poll_ms.max(1))
    }

    #[must_use]
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.hook_timeout_ms)
    }
}
