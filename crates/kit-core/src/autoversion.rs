//! Dynamic version discovery.
//!
//! A [`VersionSource`] adapter only lists raw labels (tag names, links).
//! Matching those labels against the manifest's pattern and picking the
//! highest one is shared by every strategy and lives in [`select_highest`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kit_schema::version;
use regex::Regex;
use reqwest::Client;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::manifest::{AutoVersionBlock, GIT_TAGS, HTML};

const HREF: &str = r#"(?i)href\s*=\s*["']([^"']+)["']"#;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutoVersionError {
    #[error("No version source registered for strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Invalid version pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("None of the {labels} labels from {locator} match '{pattern}'")]
    NoMatch {
        locator: String,
        pattern: String,
        labels: usize,
    },

    #[error("Version source {locator} is unavailable: {reason}")]
    SourceUnavailable { locator: String, reason: String },
}

/// Lists raw version labels for a locator, in source order.
#[async_trait]
pub trait VersionSource: Send + Sync + fmt::Debug {
    async fn list_labels(&self, locator: &str) -> Result<Vec<String>, AutoVersionError>;
}

/// Tags of a git repository, via `git ls-remote`.
#[derive(Debug, Clone, Default)]
pub struct GitTags;

#[async_trait]
impl VersionSource for GitTags {
    async fn list_labels(&self, locator: &str) -> Result<Vec<String>, AutoVersionError> {
        let unavailable = |reason: String| AutoVersionError::SourceUnavailable {
            locator: locator.to_string(),
            reason,
        };
        let output = Command::new("git")
            .args(["ls-remote", "--tags", "--refs", locator])
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| unavailable(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            return Err(unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter_map(|(_, r)| r.strip_prefix("refs/tags/"))
            .map(String::from)
            .collect())
    }
}

/// Every `href` on an HTML page, in document order.
#[derive(Debug, Clone)]
pub struct HtmlLinks {
    client: Client,
}

impl HtmlLinks {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionSource for HtmlLinks {
    async fn list_labels(&self, locator: &str) -> Result<Vec<String>, AutoVersionError> {
        let unavailable = |e: reqwest::Error| AutoVersionError::SourceUnavailable {
            locator: locator.to_string(),
            reason: e.to_string(),
        };
        let body = self
            .client
            .get(locator)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(unavailable)?
            .text()
            .await
            .map_err(unavailable)?;

        let href = Regex::new(HREF).map_err(|e| AutoVersionError::InvalidPattern {
            pattern: HREF.to_string(),
            reason: e.to_string(),
        })?;
        Ok(href
            .captures_iter(&body)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect())
    }
}

/// Compile a version pattern, which must have exactly one capture group.
pub fn compile_pattern(pattern: &str) -> Result<Regex, AutoVersionError> {
    let invalid = |reason: String| AutoVersionError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };
    let re = Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
    let groups = re.captures_len() - 1;
    if groups != 1 {
        return Err(invalid(format!("expected one capture group, found {groups}")));
    }
    Ok(re)
}

/// The highest version captured from `labels`.
///
/// Labels the pattern does not match (or captures as empty) are ignored.
/// Semver-parseable captures outrank the rest; equal versions keep the one
/// seen first.
pub fn select_highest<S: AsRef<str>>(labels: &[S], pattern: &Regex) -> Option<String> {
    let mut best: Option<&str> = None;
    for label in labels {
        let Some(candidate) = pattern
            .captures(label.as_ref())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|v| !v.is_empty())
        else {
            continue;
        };
        if best.is_none_or(|current| version::is_newer(current, candidate)) {
            best = Some(candidate);
        }
    }
    best.map(String::from)
}

/// Strategy-agnostic discovery over a registry of adapters.
#[derive(Debug, Clone, Default)]
pub struct AutoVersion {
    adapters: HashMap<String, Arc<dyn VersionSource>>,
}

impl AutoVersion {
    /// An engine with no adapters.
    pub fn new() -> Self {
        Self::default()
    }

    /// `git-tags` and `html` adapters.
    pub fn with_defaults(client: Client) -> Self {
        let mut engine = Self::new();
        engine.register(GIT_TAGS, Arc::new(GitTags));
        engine.register(HTML, Arc::new(HtmlLinks::new(client)));
        engine
    }

    pub fn register(&mut self, strategy: &str, adapter: Arc<dyn VersionSource>) {
        self.adapters.insert(strategy.to_string(), adapter);
    }

    /// Resolve the block to a single concrete version string.
    #[instrument(skip(self), fields(strategy = %block.strategy, locator = %block.locator))]
    pub async fn discover(&self, block: &AutoVersionBlock) -> Result<String, AutoVersionError> {
        let adapter = self
            .adapters
            .get(&block.strategy)
            .ok_or_else(|| AutoVersionError::UnknownStrategy(block.strategy.clone()))?;
        let pattern = compile_pattern(&block.version_pattern)?;

        let labels = adapter.list_labels(&block.locator).await?;
        debug!(count = labels.len(), "listed version labels");

        select_highest(&labels, &pattern).ok_or_else(|| AutoVersionError::NoMatch {
            locator: block.locator.clone(),
            pattern: block.version_pattern.clone(),
            labels: labels.len(),
        })
    }
}
