//! User configuration.
//!
//! Read from `<home>/config.toml` (every field optional), then overridden by
//! `KIT_SOURCES` and `KIT_LOCK_TIMEOUT`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::Paths;

const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: '{value}'")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Manifest providers in priority order (`builtin`, `dir:<path>`, `https://...`).
    /// Empty means the defaults: the user manifest directory, then the built-in set.
    pub sources: Vec<String>,
    /// Upper bound on waiting for another process's cache or install lock.
    pub lock_timeout_secs: u64,
    /// Optional bound on a whole resolve/install.
    pub resolve_timeout_secs: Option<u64>,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            resolve_timeout_secs: None,
            user_agent: crate::USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the layout (defaults if absent) and apply
    /// environment overrides.
    pub fn load(paths: &Paths) -> Result<Self, ConfigError> {
        let path = paths.config_path();
        let config = match std::fs::read_to_string(&path) {
            Ok(text) => {
                toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        config.with_env(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an environment lookup.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup("KIT_SOURCES") {
            self.sources = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = lookup("KIT_LOCK_TIMEOUT") {
            self.lock_timeout_secs = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: "KIT_LOCK_TIMEOUT",
                value: raw,
            })?;
        }
        Ok(self)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Option<Duration> {
        self.resolve_timeout_secs.map(Duration::from_secs)
    }

    /// Source URIs, substituting the defaults when none are configured.
    pub fn source_uris(&self, paths: &Paths) -> Vec<String> {
        if self.sources.is_empty() {
            vec![
                format!("dir:{}", paths.manifests_path().display()),
                "builtin".to_string(),
            ]
        } else {
            self.sources.clone()
        }
    }
}
