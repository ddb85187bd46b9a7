//! Package installation
//!
//! Materializes a resolved package's artifact through the cache, unpacks it
//! into a staging directory under the package root, and moves it into place
//! before recording it in the state store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kit_schema::{Reference, Selector};
use thiserror::Error;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::cache::{self, Cache, CacheError};
use crate::extract::{self, ExtractError};
use crate::lock::{FileLock, LockError};
use crate::paths::Paths;
use crate::reporter::{NullReporter, Reporter};
use crate::resolver::{ResolvedPackage, Resolver};
use crate::state::{InstalledRecord, StateError, StateStore};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to extract {locator}: {source}")]
    Extract {
        locator: String,
        source: ExtractError,
    },

    #[error("Package not installed: {0}")]
    NotInstalled(String),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl InstallError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone)]
pub struct Installer {
    cache: Cache,
    state: StateStore,
    paths: Paths,
    reporter: Arc<dyn Reporter>,
    lock_timeout: Duration,
}

impl fmt::Debug for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installer")
            .field("cache", &self.cache)
            .field("paths", &self.paths)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl Installer {
    pub fn new(cache: Cache, state: StateStore, paths: Paths) -> Self {
        Self {
            cache,
            state,
            paths,
            reporter: Arc::new(NullReporter),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// How long to wait for another process installing the same reference.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn lock_path(&self, reference: &Reference) -> Result<PathBuf, InstallError> {
        let dir = self.paths.locks_path();
        std::fs::create_dir_all(&dir).map_err(|e| InstallError::io(&dir, e))?;
        Ok(dir.join(format!("{reference}.lock")))
    }

    /// Install `pkg`, returning its record. Already-installed packages are
    /// returned unchanged.
    #[instrument(skip(self, pkg), fields(reference = %pkg.reference))]
    pub async fn install(&self, pkg: &ResolvedPackage) -> Result<InstalledRecord, InstallError> {
        let _guard = FileLock::acquire(&self.lock_path(&pkg.reference)?, self.lock_timeout).await?;

        if let Some(record) = self.state.get_package(&pkg.reference).await? {
            if record.exists() {
                debug!("already installed");
                return Ok(record);
            }
        }

        let result = self.install_locked(pkg).await;
        if let Err(e) = &result {
            self.reporter.failed(&pkg.reference, &e.to_string());
        }
        result
    }

    async fn install_locked(&self, pkg: &ResolvedPackage) -> Result<InstalledRecord, InstallError> {
        let entry = self.cache.materialize(&pkg.source, pkg.checksum.as_ref()).await?;
        self.reporter.extracting(&pkg.reference);

        let pkg_dir = self.paths.pkg_path();
        std::fs::create_dir_all(&pkg_dir).map_err(|e| InstallError::io(&pkg_dir, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&pkg_dir)
            .map_err(|e| InstallError::io(&pkg_dir, e))?;

        let archive = entry.path.clone();
        let locator = pkg.source.clone();
        let staged = staging.path().to_path_buf();
        let strip = pkg.strip;
        tokio::task::spawn_blocking(move || extract::extract(&archive, &locator, &staged, strip))
            .await
            .map_err(|e| InstallError::Join(e.to_string()))?
            .map_err(|source| InstallError::Extract {
                locator: pkg.source.clone(),
                source,
            })?;

        let root = pkg.root.clone();
        let staged = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || promote(&staged, &root))
            .await
            .map_err(|e| InstallError::Join(e.to_string()))??;
        // The staging directory was renamed away; dropping it is a no-op.
        drop(staging);

        let record = InstalledRecord {
            reference: pkg.reference.clone(),
            install_path: pkg.root.clone(),
            checksum: Some(entry.sha256),
            installed_at: chrono::Utc::now().timestamp(),
            source: pkg.source.clone(),
            metadata: pkg.metadata(),
        };
        self.state.put_package(record.clone()).await?;

        info!(root = %record.install_path.display(), "installed");
        self.reporter.done(&pkg.reference, "installed");
        Ok(record)
    }

    /// Remove an installed package and its record.
    #[instrument(skip(self))]
    pub async fn uninstall(&self, reference: &Reference) -> Result<InstalledRecord, InstallError> {
        let _guard = FileLock::acquire(&self.lock_path(reference)?, self.lock_timeout).await?;

        let record = self
            .state
            .get_package(reference)
            .await?
            .ok_or_else(|| InstallError::NotInstalled(reference.to_string()))?;
        self.reporter.removing(reference);

        let root = record.install_path.clone();
        tokio::task::spawn_blocking(move || remove_tree(&root))
            .await
            .map_err(|e| InstallError::Join(e.to_string()))??;

        let record = self.state.remove_package(reference).await?;
        self.reporter.done(reference, "removed");
        Ok(record)
    }

    /// Resolve and install `selector` under a single deadline.
    pub async fn ensure(
        &self,
        resolver: &Resolver,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<InstalledRecord, crate::Error> {
        let work = async {
            let installed = self.state.list_all().await?;
            let pkg = resolver.resolve(selector, &installed).await?;
            Ok::<_, crate::Error>(self.install(&pkg).await?)
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| crate::Error::Timeout {
                what: format!("installing '{selector}'"),
                after: timeout,
            })?
    }
}

/// Move a fully extracted tree to `root`, replacing any unrecorded leftover.
fn promote(staged: &Path, root: &Path) -> Result<(), InstallError> {
    if root.exists() {
        debug!(root = %root.display(), "replacing unrecorded package root");
        remove_tree(root)?;
    }
    std::fs::rename(staged, root).map_err(|e| InstallError::io(root, e))?;
    set_tree_readonly(root, true)
}

fn remove_tree(root: &Path) -> Result<(), InstallError> {
    if !root.exists() {
        return Ok(());
    }
    set_tree_readonly(root, false)?;
    std::fs::remove_dir_all(root).map_err(|e| InstallError::io(root, e))
}

/// Toggle write permission on every regular file under `root`.
fn set_tree_readonly(root: &Path, readonly: bool) -> Result<(), InstallError> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            InstallError::Io {
                source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk failed")),
                path,
            }
        })?;
        if entry.file_type().is_file() {
            cache::set_readonly(entry.path(), readonly)
                .map_err(|e| InstallError::io(entry.path(), e))?;
        }
    }
    Ok(())
}
