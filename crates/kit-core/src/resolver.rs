//! Reference resolution.
//!
//! Turns a [`Selector`] into a [`ResolvedPackage`]:
//!
//! 1. An installed package that satisfies the selector is returned as-is,
//!    without touching any provider or version source.
//! 2. Otherwise the first provider with a manifest for the name owns it.
//! 3. The concrete version comes from the selector (validated against the
//!    manifest), the auto-version engine, or the highest declared version.
//! 4. The package's environment is computed against the ambient snapshot.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use kit_schema::{Reference, Selector, Sha256Digest, Target, Version};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::autoversion::AutoVersion;
use crate::cache::Cache;
use crate::envars::{self, EnvironmentMapping, Envars};
use crate::manifest::{EnvOp, Manifest, Platform};
use crate::sources::{ManifestMatch, Sources};
use crate::state::{InstalledRecord, PackageMetadata};

/// Origin reported for packages answered from the state store.
pub const INSTALLED_ORIGIN: &str = "installed";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No source provides a package matching '{selector}'")]
    NotFound { selector: String },

    #[error("'{selector}' matches nothing {origin} declares (available: {})", join_or_none(.available))]
    AmbiguousVersion {
        selector: String,
        origin: String,
        available: Vec<String>,
    },

    #[error("Failed to resolve '{selector}' using {origin}")]
    ResolutionFailed {
        selector: String,
        origin: String,
        #[source]
        cause: Box<crate::Error>,
    },

    #[error("Resolving '{selector}' timed out after {after:?}")]
    Timeout { selector: String, after: Duration },
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

impl ResolveError {
    fn failed(selector: &Selector, origin: &str, cause: impl Into<crate::Error>) -> Self {
        Self::ResolutionFailed {
            selector: selector.to_string(),
            origin: origin.to_string(),
            cause: Box::new(cause.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageState {
    NotInstalled,
    Downloading,
    Installed,
    /// Recorded as installed, but the root is gone.
    Corrupt,
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotInstalled => "not installed",
            Self::Downloading => "downloading",
            Self::Installed => "installed",
            Self::Corrupt => "corrupt",
        })
    }
}

/// The outcome of one resolution. Owned by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPackage {
    pub reference: Reference,
    pub root: PathBuf,
    pub source: String,
    pub checksum: Option<Sha256Digest>,
    pub description: String,
    pub homepage: Option<String>,
    pub state: PackageState,
    pub requires: Vec<String>,
    pub provides: Vec<String>,
    pub env: Vec<EnvOp>,
    pub environment: EnvironmentMapping,
    /// Binary globs, relative to `root`.
    pub binaries: Vec<String>,
    /// Key of the provider the manifest came from.
    pub origin: String,
    #[serde(skip)]
    pub strip: usize,
}

impl ResolvedPackage {
    /// Files under `root` matching the binary globs.
    pub fn resolve_binaries(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for pattern in &self.binaries {
            let full = self.root.join(pattern);
            let paths = match glob::glob(&full.to_string_lossy()) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(pattern, error = %e, "invalid binary glob");
                    continue;
                }
            };
            found.extend(paths.flatten().filter(|p| p.is_file()));
        }
        found.sort();
        found.dedup();
        found
    }

    /// Snapshot of the manifest fields the installed fast path needs later.
    pub fn metadata(&self) -> PackageMetadata {
        PackageMetadata {
            description: self.description.clone(),
            homepage: self.homepage.clone(),
            env: self.env.clone(),
            binaries: self.binaries.clone(),
            requires: self.requires.clone(),
            provides: self.provides.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolver {
    sources: Sources,
    autoversion: AutoVersion,
    platform: Platform,
    ambient: Envars,
    pkg_root: PathBuf,
    cache: Option<Cache>,
}

impl Resolver {
    pub fn new(
        sources: Sources,
        autoversion: AutoVersion,
        platform: Platform,
        ambient: Envars,
        pkg_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sources,
            autoversion,
            platform,
            ambient,
            pkg_root: pkg_root.into(),
            cache: None,
        }
    }

    /// Report [`PackageState::Downloading`] while the cache holds a download lock.
    #[must_use]
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Resolve `selector`.
    ///
    /// `installed` should be every record in the state store; records whose
    /// root has gone missing are never used for the fast path and make the
    /// matching package report [`PackageState::Corrupt`].
    #[instrument(skip(self, installed), fields(selector = %selector))]
    pub async fn resolve(
        &self,
        selector: &Selector,
        installed: &[InstalledRecord],
    ) -> Result<ResolvedPackage, ResolveError> {
        if let Some(record) = installed_match(selector, installed) {
            debug!(reference = %record.reference, "satisfied by installed package");
            return Ok(self.from_record(record));
        }

        if selector.is_glob() {
            return self.resolve_glob(selector, installed).await;
        }

        let name = selector.package_name();
        let found = self
            .sources
            .find(name.as_str())
            .await
            .map_err(|e| ResolveError::failed(selector, &source_key(&e), e))?
            .ok_or_else(|| ResolveError::NotFound {
                selector: selector.to_string(),
            })?;

        let reference = self.select_reference(selector, &found).await?;
        self.build(selector, reference, &found, installed)
    }

    /// [`Resolver::resolve`] bounded by `timeout`. Expiry drops the in-flight
    /// work, including any version-source query.
    pub async fn resolve_with_timeout(
        &self,
        selector: &Selector,
        installed: &[InstalledRecord],
        timeout: Duration,
    ) -> Result<ResolvedPackage, ResolveError> {
        tokio::time::timeout(timeout, self.resolve(selector, installed))
            .await
            .map_err(|_| ResolveError::Timeout {
                selector: selector.to_string(),
                after: timeout,
            })?
    }

    /// Describe an installed package from its record alone.
    pub fn from_record(&self, record: &InstalledRecord) -> ResolvedPackage {
        let meta = &record.metadata;
        ResolvedPackage {
            reference: record.reference.clone(),
            root: record.install_path.clone(),
            source: record.source.clone(),
            checksum: record.checksum.clone(),
            description: meta.description.clone(),
            homepage: meta.homepage.clone(),
            state: if record.exists() {
                PackageState::Installed
            } else {
                PackageState::Corrupt
            },
            requires: meta.requires.clone(),
            provides: meta.provides.clone(),
            env: meta.env.clone(),
            environment: envars::apply(&record.install_path, &meta.env, &self.ambient),
            binaries: meta.binaries.clone(),
            origin: INSTALLED_ORIGIN.to_string(),
            strip: 0,
        }
    }

    async fn select_reference(
        &self,
        selector: &Selector,
        found: &ManifestMatch,
    ) -> Result<Reference, ResolveError> {
        let manifest = &found.manifest;
        let ambiguous = || ResolveError::AmbiguousVersion {
            selector: selector.to_string(),
            origin: found.origin.clone(),
            available: manifest.references().iter().map(ToString::to_string).collect(),
        };

        if let Some(version) = selector.requested_version() {
            // An auto-versioned manifest's declared list is advisory.
            if manifest.has_version(version) || manifest.auto_version().is_some() {
                return Ok(Reference::version(manifest.name.clone(), version.clone()));
            }
            return Err(ambiguous());
        }

        if let Some(channel) = selector.requested_channel() {
            return match manifest.channel(channel) {
                Some(block) => Ok(Reference::channel(manifest.name.clone(), block.name.clone())),
                None => Err(ambiguous()),
            };
        }

        if let Some(block) = manifest.auto_version() {
            let version = self
                .autoversion
                .discover(block)
                .await
                .map_err(|e| ResolveError::failed(selector, &found.origin, e))?;
            debug!(%version, "auto-version selected");
            return Ok(Reference::version(manifest.name.clone(), version.as_str()));
        }

        if let Some(version) = manifest.highest_version() {
            return Ok(Reference::version(manifest.name.clone(), version.clone()));
        }
        match manifest.channels().first() {
            Some(block) => Ok(Reference::channel(manifest.name.clone(), block.name.clone())),
            None => Err(ambiguous()),
        }
    }

    async fn resolve_glob(
        &self,
        selector: &Selector,
        installed: &[InstalledRecord],
    ) -> Result<ResolvedPackage, ResolveError> {
        for provider in self.sources.providers() {
            let names = provider
                .list_names()
                .await
                .map_err(|e| ResolveError::failed(selector, provider.key(), e))?;

            let mut best: Option<(Reference, Manifest)> = None;
            for name in names.iter().filter(|n| selector.matches_name(n)) {
                let Some(manifest) = provider
                    .fetch(name)
                    .await
                    .map_err(|e| ResolveError::failed(selector, provider.key(), e))?
                else {
                    continue;
                };
                let candidate = manifest
                    .references()
                    .into_iter()
                    .filter(|r| selector.matches(r))
                    .max_by(|a, b| rank(a).cmp(&rank(b)));
                if let Some(reference) = candidate {
                    if best.as_ref().is_none_or(|(b, _)| rank(&reference) > rank(b)) {
                        best = Some((reference, manifest));
                    }
                }
            }

            if let Some((reference, manifest)) = best {
                let found = ManifestMatch {
                    origin: provider.key().to_string(),
                    manifest,
                };
                return self.build(selector, reference, &found, installed);
            }
        }
        Err(ResolveError::NotFound {
            selector: selector.to_string(),
        })
    }

    fn build(
        &self,
        selector: &Selector,
        reference: Reference,
        found: &ManifestMatch,
        installed: &[InstalledRecord],
    ) -> Result<ResolvedPackage, ResolveError> {
        let manifest = &found.manifest;
        let source = manifest
            .source_for(&reference, &self.platform)
            .map_err(|e| ResolveError::failed(selector, &found.origin, e))?;
        let checksum = manifest.checksum_for(&source).cloned();
        let root = self.pkg_root.join(reference.to_string());

        let state = match installed.iter().find(|r| r.reference == reference) {
            Some(record) if record.exists() => PackageState::Installed,
            Some(_) => PackageState::Corrupt,
            None if self
                .cache
                .as_ref()
                .is_some_and(|c| c.is_downloading(&source, checksum.as_ref())) =>
            {
                PackageState::Downloading
            }
            None => PackageState::NotInstalled,
        };

        Ok(ResolvedPackage {
            environment: envars::apply(&root, &manifest.env, &self.ambient),
            reference,
            root,
            source,
            checksum,
            description: manifest.description.clone(),
            homepage: manifest.homepage.clone(),
            state,
            requires: manifest.requires.clone(),
            provides: manifest.provides.clone(),
            env: manifest.env.clone(),
            binaries: manifest.binaries.clone(),
            origin: found.origin.clone(),
            strip: manifest.strip,
        })
    }
}

/// Versions outrank channels; versions order among themselves.
fn rank(reference: &Reference) -> (bool, Option<&Version>) {
    match &reference.target {
        Target::Version(v) => (true, Some(v)),
        Target::Channel(_) => (false, None),
    }
}

/// The best installed record satisfying `selector`, if its root exists.
fn installed_match<'a>(
    selector: &Selector,
    installed: &'a [InstalledRecord],
) -> Option<&'a InstalledRecord> {
    installed
        .iter()
        .filter(|r| selector.matches(&r.reference) && r.exists())
        .max_by(|a, b| rank(&a.reference).cmp(&rank(&b.reference)))
}

fn source_key(err: &crate::sources::SourceError) -> String {
    use crate::sources::SourceError;
    match err {
        SourceError::Unavailable { provider, .. } | SourceError::Invalid { provider, .. } => {
            provider.clone()
        }
        SourceError::UnknownScheme(uri) => uri.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoversion::{AutoVersionError, VersionSource};
    use crate::manifest::GIT_TAGS;
    use crate::sources::{ManifestProvider, MemSource, SourceError};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Untouchable;

    #[async_trait]
    impl ManifestProvider for Untouchable {
        fn key(&self) -> &str {
            "untouchable"
        }
        async fn list_names(&self) -> Result<BTreeSet<String>, SourceError> {
            panic!("provider must not be queried");
        }
        async fn fetch(&self, _: &str) -> Result<Option<Manifest>, SourceError> {
            panic!("provider must not be queried");
        }
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl ManifestProvider for Slow {
        fn key(&self) -> &str {
            "slow"
        }
        async fn list_names(&self) -> Result<BTreeSet<String>, SourceError> {
            Ok(BTreeSet::new())
        }
        async fn fetch(&self, _: &str) -> Result<Option<Manifest>, SourceError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
    }

    #[derive(Debug, Default)]
    struct Tags {
        labels: Vec<&'static str>,
        calls: AtomicUsize,
        offline: bool,
    }

    #[async_trait]
    impl VersionSource for Tags {
        async fn list_labels(&self, locator: &str) -> Result<Vec<String>, AutoVersionError> {
            if self.offline {
                panic!("version source must not be queried");
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            if locator.contains("unreachable") {
                return Err(AutoVersionError::SourceUnavailable {
                    locator: locator.to_string(),
                    reason: "timeout".to_string(),
                });
            }
            Ok(self.labels.iter().map(|s| (*s).to_string()).collect())
        }
    }

    const GO: &str = r#"
description = "Go"
source = "https://go.dev/dl/go${version}.${os}-${arch}.tar.gz"
binaries = ["bin/*"]

[[env]]
name = "PATH"
prepend = "${root}/bin"

[[version]]
versions = ["1.21.3", "1.20.10", "1.9.7"]

[[channel]]
name = "stable"
version = "1.21.*"
"#;

    const TOOL: &str = r#"
source = "https://example.com/tool-${version}.tar.gz"

[[version]]
versions = ["0.0.1"]
auto-version = { git-tags = "https://example.com/tool.git" }
"#;

    fn mem(key: &str, manifests: &[(&str, &str)]) -> Arc<dyn ManifestProvider> {
        let mut source = MemSource::new(key);
        for (name, text) in manifests {
            source.insert(Manifest::parse(name, text).unwrap());
        }
        Arc::new(source)
    }

    fn resolver(providers: Vec<Arc<dyn ManifestProvider>>, tags: Arc<Tags>) -> Resolver {
        let mut autoversion = AutoVersion::new();
        autoversion.register(GIT_TAGS, tags);
        Resolver::new(
            Sources::new(providers),
            autoversion,
            Platform::new("linux", "amd64"),
            Envars::parse(["PATH=/usr/bin"]),
            "/kit/pkg",
        )
    }

    fn sel(s: &str) -> Selector {
        Selector::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_installed_fast_path_skips_providers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("foo-1.0.0");
        std::fs::create_dir_all(&root).unwrap();
        let record = InstalledRecord {
            reference: Reference::version("foo", "1.0.0"),
            install_path: root.clone(),
            checksum: None,
            installed_at: 0,
            source: "https://example.com/foo.tgz".to_string(),
            metadata: PackageMetadata {
                description: "Foo".to_string(),
                env: vec![EnvOp::prepend("PATH", "${root}/bin")],
                ..PackageMetadata::default()
            },
        };
        let tags = Arc::new(Tags {
            offline: true,
            ..Tags::default()
        });
        let r = resolver(vec![Arc::new(Untouchable)], tags);

        let pkg = r.resolve(&sel("foo"), &[record.clone()]).await.unwrap();
        assert_eq!(pkg.reference, record.reference);
        assert_eq!(pkg.state, PackageState::Installed);
        assert_eq!(pkg.origin, INSTALLED_ORIGIN);
        assert_eq!(
            pkg.environment.get("PATH").unwrap(),
            format!("{}/bin:/usr/bin", root.display())
        );

        // An exact pin on the installed version is also satisfied locally.
        let pinned = r.resolve(&sel("foo-1.0.0"), &[record]).await.unwrap();
        assert_eq!(pinned.state, PackageState::Installed);
    }

    #[tokio::test]
    async fn test_unconstrained_uses_auto_version_and_is_idempotent() {
        let tags = Arc::new(Tags {
            labels: vec!["v0.0.1", "v0.0.2"],
            ..Tags::default()
        });
        let r = resolver(vec![mem("mem", &[("tool", TOOL)])], tags.clone());

        let first = r.resolve(&sel("tool"), &[]).await.unwrap();
        let second = r.resolve(&sel("tool"), &[]).await.unwrap();
        assert_eq!(first.reference, Reference::version("tool", "0.0.2"));
        assert_eq!(first.reference, second.reference);
        assert_eq!(first.source, "https://example.com/tool-0.0.2.tar.gz");
        assert_eq!(first.state, PackageState::NotInstalled);
        assert_eq!(tags.calls.load(Ordering::SeqCst), 2);

        // Pins are accepted without validation when the manifest auto-versions.
        let pinned = r.resolve(&sel("tool-9.9.9"), &[]).await.unwrap();
        assert_eq!(pinned.reference, Reference::version("tool", "9.9.9"));
    }

    #[tokio::test]
    async fn test_unconstrained_without_auto_version_picks_highest() {
        let r = resolver(vec![mem("mem", &[("go", GO)])], Arc::default());
        let pkg = r.resolve(&sel("go"), &[]).await.unwrap();
        assert_eq!(pkg.reference, Reference::version("go", "1.21.3"));
        assert_eq!(pkg.root, PathBuf::from("/kit/pkg/go-1.21.3"));
        assert!(pkg.environment.is_changed("PATH"));
    }

    #[tokio::test]
    async fn test_pins_and_channels() {
        let r = resolver(vec![mem("mem", &[("go", GO)])], Arc::default());

        let pkg = r.resolve(&sel("go-1.20.10"), &[]).await.unwrap();
        assert_eq!(pkg.reference, Reference::version("go", "1.20.10"));

        let pkg = r.resolve(&sel("go@stable"), &[]).await.unwrap();
        assert_eq!(pkg.reference, Reference::channel("go", "stable"));
        assert_eq!(pkg.source, "https://go.dev/dl/go1.21.3.linux-amd64.tar.gz");

        match r.resolve(&sel("go-1.22.0"), &[]).await {
            Err(ResolveError::AmbiguousVersion {
                selector,
                origin,
                available,
            }) => {
                assert_eq!(selector, "go-1.22.0");
                assert_eq!(origin, "mem");
                assert!(available.contains(&"go-1.21.3".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            r.resolve(&sel("go@nightly"), &[]).await,
            Err(ResolveError::AmbiguousVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_first_provider_owns_the_name() {
        let newer_go = GO.replace("1.21.3", "1.22.0");
        let r = resolver(
            vec![
                mem("first", &[("go", GO)]),
                mem("second", &[("go", newer_go.as_str())]),
            ],
            Arc::default(),
        );
        let pkg = r.resolve(&sel("go"), &[]).await.unwrap();
        assert_eq!(pkg.origin, "first");
        // No fallback to the second provider for a version only it declares.
        assert!(matches!(
            r.resolve(&sel("go-1.22.0"), &[]).await,
            Err(ResolveError::AmbiguousVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_not_found_and_wrapped_failures() {
        let unreachable = TOOL.replace("example.com/tool.git", "unreachable/tool.git");
        let r = resolver(
            vec![mem("mem", &[("tool", unreachable.as_str())])],
            Arc::new(Tags::default()),
        );
        assert!(matches!(
            r.resolve(&sel("missing"), &[]).await,
            Err(ResolveError::NotFound { .. })
        ));

        match r.resolve(&sel("tool"), &[]).await {
            Err(ResolveError::ResolutionFailed {
                selector,
                origin,
                cause,
            }) => {
                assert_eq!(selector, "tool");
                assert_eq!(origin, "mem");
                assert!(matches!(
                    *cause,
                    crate::Error::AutoVersion(AutoVersionError::SourceUnavailable { .. })
                ));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_glob_selects_highest_match() {
        let r = resolver(
            vec![
                mem("first", &[("jq", "[[version]]\nversions = [\"1.7.1\"]\nsource = \"x\"\n")]),
                mem("second", &[("go", GO)]),
            ],
            Arc::default(),
        );
        let pkg = r.resolve(&sel("go-1.2*"), &[]).await.unwrap();
        assert_eq!(pkg.reference, Reference::version("go", "1.21.3"));
        assert_eq!(pkg.origin, "second");

        assert!(matches!(
            r.resolve(&sel("zz*"), &[]).await,
            Err(ResolveError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_root_reports_corrupt() {
        let record = InstalledRecord {
            reference: Reference::version("go", "1.21.3"),
            install_path: PathBuf::from("/definitely/not/here/go-1.21.3"),
            checksum: None,
            installed_at: 0,
            source: String::new(),
            metadata: PackageMetadata::default(),
        };
        let r = resolver(vec![mem("mem", &[("go", GO)])], Arc::default());
        let pkg = r.resolve(&sel("go"), &[record]).await.unwrap();
        assert_eq!(pkg.state, PackageState::Corrupt);
        assert_eq!(pkg.origin, "mem");
    }

    #[tokio::test]
    async fn test_timeout() {
        let r = resolver(vec![Arc::new(Slow)], Arc::default());
        assert!(matches!(
            r.resolve_with_timeout(&sel("go"), &[], Duration::from_millis(50))
                .await,
            Err(ResolveError::Timeout { .. })
        ));
    }

    #[test]
    fn test_resolve_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/go"), "").unwrap();
        std::fs::write(dir.path().join("bin/gofmt"), "").unwrap();
        std::fs::write(dir.path().join("README"), "").unwrap();

        let r = resolver(vec![], Arc::default());
        let mut pkg = r.from_record(&InstalledRecord {
            reference: Reference::version("go", "1.21.3"),
            install_path: dir.path().to_path_buf(),
            checksum: None,
            installed_at: 0,
            source: String::new(),
            metadata: PackageMetadata::default(),
        });
        pkg.binaries = vec!["bin/*".to_string(), "bin/go".to_string()];
        assert_eq!(
            pkg.resolve_binaries(),
            vec![dir.path().join("bin/go"), dir.path().join("bin/gofmt")]
        );
    }

    #[test]
    fn test_serializes_for_json_output() {
        let r = resolver(vec![], Arc::default());
        let pkg = r.from_record(&InstalledRecord {
            reference: Reference::channel("node", "lts"),
            install_path: PathBuf::from("/kit/pkg/node@lts"),
            checksum: None,
            installed_at: 0,
            source: "https://nodejs.org/x.tar.gz".to_string(),
            metadata: PackageMetadata::default(),
        });
        let json = serde_json::to_value(&pkg).unwrap();
        assert_eq!(json["reference"], "node@lts");
        assert_eq!(json["state"], "corrupt");
        assert!(json.get("strip").is_none());
    }
}
