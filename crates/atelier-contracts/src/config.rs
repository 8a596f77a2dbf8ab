use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::providers::{ProviderTarget, TargetRegistry};

pub const CONFIG_PATH_ENV: &str = "ATELIER_CONFIG";
pub const API_BASE_ENV: &str = "ATELIER_API_BASE";
pub const API_KEY_ENV: &str = "ATELIER_API_KEY";
pub const POLL_INTERVAL_ENV: &str = "ATELIER_POLL_INTERVAL";
pub const MAX_POLLS_ENV: &str = "ATELIER_MAX_POLLS";

const DEFAULT_API_BASE: &str = "https://api.apiyi.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_s: f64,
    pub max_delay_s: f64,
    pub jitter_s: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_s: 1.5,
            max_delay_s: 12.0,
            jitter_s: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_s: f64,
    pub max_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_s: 5.0,
            max_polls: 120,
        }
    }
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        seconds_or(self.interval_s, Self::default().interval_s)
    }
}

/// `value` seconds as a `Duration`. Negative values clamp to zero; NaN,
/// infinite and out-of-range values fall back to `fallback_s`.
pub fn seconds_or(value: f64, fallback_s: f64) -> Duration {
    if value.is_nan() {
        return Duration::from_secs_f64(fallback_s.max(0.0));
    }
    Duration::try_from_secs_f64(value.max(0.0))
        .unwrap_or_else(|_| Duration::from_secs_f64(fallback_s.max(0.0)))
}

fn finite_seconds(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub retry: RetrySettings,
    pub polling: PollSettings,
    pub download_timeout_s: f64,
    pub targets: Vec<ProviderTarget>,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            retry: RetrySettings::default(),
            polling: PollSettings::default(),
            download_timeout_s: 600.0,
            targets: Vec::new(),
        }
    }
}

impl StudioConfig {
    /// Defaults, then the JSON file named by `ATELIER_CONFIG`, then env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match config_path_from_env() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(non_empty_env);
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup(API_BASE_ENV) {
            self.api_base = base.trim().trim_end_matches('/').to_string();
        }
        if let Some(key) = lookup(API_KEY_ENV) {
            self.api_key = Some(key);
        }
        if let Some(interval) = lookup(POLL_INTERVAL_ENV).and_then(|raw| finite_seconds(&raw)) {
            self.polling.interval_s = interval.max(0.0);
        }
        if let Some(max_polls) = lookup(MAX_POLLS_ENV).and_then(|raw| raw.trim().parse::<u32>().ok()) {
            self.polling.max_polls = max_polls.max(1);
        }
    }

    pub fn download_timeout(&self) -> Duration {
        seconds_or(
            self.download_timeout_s.clamp(1.0, 3600.0),
            Self::default().download_timeout_s,
        )
    }

    /// Configured targets (or the defaults), each holding a credential when one is known.
    pub fn target_registry(&self) -> TargetRegistry {
        let key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if self.targets.is_empty() {
            return TargetRegistry::with_defaults(&self.api_base, key);
        }
        let targets = self
            .targets
            .iter()
            .cloned()
            .map(|target| match (&target.api_key, key) {
                (None, Some(key)) => target.with_api_key(key),
                _ => target,
            })
            .collect();
        TargetRegistry::new(targets)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    non_empty_env(CONFIG_PATH_ENV).map(PathBuf::from)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
