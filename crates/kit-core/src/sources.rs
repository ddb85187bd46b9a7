//! Manifest providers and the ordered source registry.
//!
//! Providers are consulted strictly in configured order and the first one
//! that has a manifest for a name owns that name. Later providers are never
//! merged in or consulted as a fallback, even if the owning manifest cannot
//! satisfy a particular version.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};

use crate::manifest::{Manifest, ManifestError};
use crate::paths::Paths;

const BUILTIN: &[(&str, &str)] = &[
    ("jq", include_str!("../builtin/jq.toml")),
    ("ripgrep", include_str!("../builtin/ripgrep.toml")),
];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source {provider} is unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Source {provider} has an invalid manifest: {source}")]
    Invalid {
        provider: String,
        source: ManifestError,
    },

    #[error("Unrecognised source '{0}' (expected builtin, dir:<path> or an http(s) URL)")]
    UnknownScheme(String),
}

/// Something that can enumerate and fetch manifests by name.
#[async_trait]
pub trait ManifestProvider: Send + Sync + fmt::Debug {
    /// Stable identity used in diagnostics (`dir:/path`, `builtin`, a URL).
    fn key(&self) -> &str;

    async fn list_names(&self) -> Result<BTreeSet<String>, SourceError>;

    /// `Ok(None)` when this provider does not know `name`.
    async fn fetch(&self, name: &str) -> Result<Option<Manifest>, SourceError>;
}

/// Manifests stored as `<dir>/<name>.toml`.
#[derive(Debug, Clone)]
pub struct DirSource {
    dir: PathBuf,
    key: String,
}

impl DirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let key = format!("dir:{}", dir.display());
        Self { dir, key }
    }

    fn unavailable(&self, err: &std::io::Error) -> SourceError {
        SourceError::Unavailable {
            provider: self.key.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl ManifestProvider for DirSource {
    fn key(&self) -> &str {
        &self.key
    }

    async fn list_names(&self) -> Result<BTreeSet<String>, SourceError> {
        let mut names = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(self.unavailable(&e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.unavailable(&e))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                if let Some(stem) = path.file_stem() {
                    names.insert(stem.to_string_lossy().to_lowercase());
                }
            }
        }
        Ok(names)
    }

    async fn fetch(&self, name: &str) -> Result<Option<Manifest>, SourceError> {
        let path = self.dir.join(format!("{name}.toml"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.unavailable(&e)),
        };
        trace!(path = %path.display(), "loaded manifest");
        Manifest::parse(name, &text)
            .map(Some)
            .map_err(|source| SourceError::Invalid {
                provider: self.key.clone(),
                source,
            })
    }
}

/// An in-memory manifest set. Also backs the built-in manifests.
#[derive(Debug, Clone)]
pub struct MemSource {
    key: String,
    manifests: BTreeMap<String, Manifest>,
}

impl MemSource {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            manifests: BTreeMap::new(),
        }
    }

    /// The manifests compiled into the binary.
    pub fn builtin() -> Result<Self, SourceError> {
        let mut source = Self::new("builtin");
        for (name, text) in BUILTIN {
            let manifest = Manifest::parse(name, text).map_err(|source| SourceError::Invalid {
                provider: "builtin".to_string(),
                source,
            })?;
            source.insert(manifest);
        }
        Ok(source)
    }

    pub fn insert(&mut self, manifest: Manifest) {
        self.manifests.insert(manifest.name.to_string(), manifest);
    }

    #[must_use]
    pub fn with(mut self, manifest: Manifest) -> Self {
        self.insert(manifest);
        self
    }
}

#[async_trait]
impl ManifestProvider for MemSource {
    fn key(&self) -> &str {
        &self.key
    }

    async fn list_names(&self) -> Result<BTreeSet<String>, SourceError> {
        Ok(self.manifests.keys().cloned().collect())
    }

    async fn fetch(&self, name: &str) -> Result<Option<Manifest>, SourceError> {
        Ok(self.manifests.get(&name.to_lowercase()).cloned())
    }
}

/// A manifest repository served over HTTP.
///
/// `<base>/index.json` is a JSON array of names; `<base>/<name>.toml` holds
/// each manifest.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    base: String,
    client: Client,
}

impl RemoteSource {
    pub fn new(base: &str, client: Client) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn unavailable(&self, reason: impl fmt::Display) -> SourceError {
        SourceError::Unavailable {
            provider: self.base.clone(),
            reason: reason.to_string(),
        }
    }

    async fn get(&self, url: &str) -> Result<Option<String>, SourceError> {
        debug!(url, "fetching from manifest repository");
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(|e| self.unavailable(e))?;
        resp.text().await.map(Some).map_err(|e| self.unavailable(e))
    }
}

#[async_trait]
impl ManifestProvider for RemoteSource {
    fn key(&self) -> &str {
        &self.base
    }

    async fn list_names(&self) -> Result<BTreeSet<String>, SourceError> {
        let Some(body) = self.get(&format!("{}/index.json", self.base)).await? else {
            return Ok(BTreeSet::new());
        };
        let names: Vec<String> = serde_json::from_str(&body)
            .map_err(|e| self.unavailable(format!("invalid index.json: {e}")))?;
        Ok(names.into_iter().map(|n| n.to_lowercase()).collect())
    }

    async fn fetch(&self, name: &str) -> Result<Option<Manifest>, SourceError> {
        let Some(body) = self.get(&format!("{}/{name}.toml", self.base)).await? else {
            return Ok(None);
        };
        Manifest::parse(name, &body)
            .map(Some)
            .map_err(|source| SourceError::Invalid {
                provider: self.base.clone(),
                source,
            })
    }
}

/// A manifest together with the provider it came from.
#[derive(Debug, Clone)]
pub struct ManifestMatch {
    pub origin: String,
    pub manifest: Manifest,
}

/// The ordered provider list.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    providers: Vec<Arc<dyn ManifestProvider>>,
}

impl Sources {
    pub fn new(providers: Vec<Arc<dyn ManifestProvider>>) -> Self {
        Self { providers }
    }

    /// Build providers from configured URIs (`builtin`, `dir:<path>`, an
    /// absolute path, or an `http(s)://` base URL).
    pub fn from_uris(uris: &[String], client: &Client) -> Result<Self, SourceError> {
        let mut providers: Vec<Arc<dyn ManifestProvider>> = Vec::with_capacity(uris.len());
        for uri in uris {
            let provider: Arc<dyn ManifestProvider> = if uri == "builtin" {
                Arc::new(MemSource::builtin()?)
            } else if let Some(dir) = uri.strip_prefix("dir:") {
                Arc::new(DirSource::new(dir))
            } else if uri.starts_with("http://") || uri.starts_with("https://") {
                Arc::new(RemoteSource::new(uri, client.clone()))
            } else if Path::new(uri).is_absolute() {
                Arc::new(DirSource::new(uri))
            } else {
                return Err(SourceError::UnknownScheme(uri.clone()));
            };
            providers.push(provider);
        }
        Ok(Self::new(providers))
    }

    /// Providers for the configured (or default) source list.
    pub fn from_config(
        config: &crate::Config,
        paths: &Paths,
        client: &Client,
    ) -> Result<Self, SourceError> {
        Self::from_uris(&config.source_uris(paths), client)
    }

    pub fn providers(&self) -> &[Arc<dyn ManifestProvider>] {
        &self.providers
    }

    /// The manifest for `name` from the first provider that has one.
    pub async fn find(&self, name: &str) -> Result<Option<ManifestMatch>, SourceError> {
        for provider in &self.providers {
            if let Some(manifest) = provider.fetch(name).await? {
                debug!(name, origin = provider.key(), "manifest found");
                return Ok(Some(ManifestMatch {
                    origin: provider.key().to_string(),
                    manifest,
                }));
            }
        }
        Ok(None)
    }

    /// Union of every provider's names.
    pub async fn list_names(&self) -> Result<BTreeSet<String>, SourceError> {
        let mut names = BTreeSet::new();
        for provider in &self.providers {
            names.extend(provider.list_names().await?);
        }
        Ok(names)
    }
}
