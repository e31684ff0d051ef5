//! Sync configuration.
//!
//! `SyncSettings` is persisted as JSON and can be overridden from the
//! environment (`TASKSYNC_*`). Callers that want `.env` support load it with
//! `dotenvy` before calling [`SyncSettings::apply_env`].

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sync::SyncOptions;
use crate::{Error, Result};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_QUEUE_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKGROUND_INTERVAL_SECS: u64 = 15 * 60;

const ENV_API_URL: &str = "TASKSYNC_API_URL";
const ENV_REQUEST_TIMEOUT: &str = "TASKSYNC_REQUEST_TIMEOUT_SECS";
const ENV_MAX_QUEUE_ATTEMPTS: &str = "TASKSYNC_MAX_QUEUE_ATTEMPTS";
const ENV_BACKGROUND_INTERVAL: &str = "TASKSYNC_BACKGROUND_INTERVAL_SECS";

/// Settings for the remote client and sync engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    /// Base URL of the task API; sync is disabled when unset
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Failed attempts before a queued change is dead-lettered
    #[serde(default = "default_max_queue_attempts")]
    pub max_queue_attempts: u32,
    /// Period of the background sync loop; `0` disables it
    #[serde(default = "default_background_interval_secs")]
    pub background_interval_secs: u64,
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

const fn default_max_queue_attempts() -> u32 {
    DEFAULT_MAX_QUEUE_ATTEMPTS
}

const fn default_background_interval_secs() -> u64 {
    DEFAULT_BACKGROUND_INTERVAL_SECS
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_queue_attempts: DEFAULT_MAX_QUEUE_ATTEMPTS,
            background_interval_secs: DEFAULT_BACKGROUND_INTERVAL_SECS,
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let mut settings = serde_json::from_str::<Self>(&raw).map_err(|error| {
            Error::Config(format!(
                "Failed to parse settings at {}: {error}",
                path.display()
            ))
        })?;
        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let mut normalized = self.clone();
        normalized.normalize();
        normalized.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(&normalized)?;
        std::fs::write(path, payload)?;
        Ok(())
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env()?;
        Ok(settings)
    }

    /// Apply `TASKSYNC_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = normalize_text_option(lookup(ENV_API_URL)) {
            self.api_base_url = Some(url);
        }
        if let Some(value) = parse_env(&lookup, ENV_REQUEST_TIMEOUT)? {
            self.request_timeout_secs = value;
        }
        if let Some(value) = parse_env(&lookup, ENV_MAX_QUEUE_ATTEMPTS)? {
            self.max_queue_attempts = value;
        }
        if let Some(value) = parse_env(&lookup, ENV_BACKGROUND_INTERVAL)? {
            self.background_interval_secs = value;
        }

        self.normalize();
        self.validate()
    }

    pub fn normalize(&mut self) {
        self.api_base_url = normalize_text_option(self.api_base_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.max_queue_attempts = self.max_queue_attempts.max(1);
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.api_base_url {
            if !is_http_url(url) {
                return Err(Error::Config(
                    "api_base_url must include http:// or https://".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `None` when background sync is disabled
    #[must_use]
    pub const fn background_interval(&self) -> Option<Duration> {
        if self.background_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.background_interval_secs))
        }
    }

    #[must_use]
    pub const fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            request_timeout: self.request_timeout(),
        }
    }
}

/// Trim `value`, treating blank text as absent
pub(crate) fn normalize_text_option(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = normalize_text_option(lookup(key)) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got '{raw}'")))
}
