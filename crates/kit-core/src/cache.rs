//! Content-addressed artifact cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! objects/<shard>/<key>        verified, read-only artifacts
//! objects/<shard>/<key>.json   origin metadata for URL-keyed entries
//! staging/                     in-flight downloads
//! locks/<key>.lock             per-key cross-process locks
//! ```
//!
//! Keys are `sha256-<digest>` when the expected checksum is known, so two
//! locators for byte-identical artifacts share one object, and
//! `url-<sha256(locator)>` otherwise.
//!
//! An object only appears under `objects/` after it has been fully written,
//! hashed and verified, via an atomic rename out of `staging/`. Anything
//! still in `staging/` is garbage by definition.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, Shared, WeakShared};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use kit_schema::Sha256Digest;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::Reporter;
use crate::lock::{self, FileLock, LockError};
use crate::reporter::NullReporter;

/// A stream of artifact bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to open {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Unsupported locator: {0}")]
    Unsupported(String),
}

/// Fetches raw artifact bytes. Verification is the cache's job.
#[async_trait]
pub trait Fetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, locator: &str) -> Result<ByteStream, FetchError>;
}

/// HTTP(S) fetcher backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            user_agent: crate::USER_AGENT.to_string(),
        }
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> Result<ByteStream, FetchError> {
        let response = self
            .client
            .get(strip_fragment(locator))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }
}

/// Local files, as `file://` URLs or plain paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, locator: &str) -> Result<ByteStream, FetchError> {
        let locator = strip_fragment(locator);
        let path = PathBuf::from(locator.strip_prefix("file://").unwrap_or(locator));
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| FetchError::Io { path, source })?;
        Ok(tokio_util::io::ReaderStream::new(file).boxed())
    }
}

/// Dispatches on the locator scheme.
#[derive(Debug, Clone)]
pub struct DefaultFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl DefaultFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            http: HttpFetcher::new(client),
            file: FileFetcher,
        }
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.http = self.http.with_user_agent(user_agent);
        self
    }
}

#[async_trait]
impl Fetcher for DefaultFetcher {
    async fn fetch(&self, locator: &str) -> Result<ByteStream, FetchError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            self.http.fetch(locator).await
        } else if locator.starts_with("file://") || Path::new(locator).is_absolute() {
            self.file.fetch(locator).await
        } else {
            Err(FetchError::Unsupported(locator.to_string()))
        }
    }
}

/// Locators may carry a `#name` fragment naming the unpacked file.
fn strip_fragment(locator: &str) -> &str {
    locator.split_once('#').map_or(locator, |(base, _)| base)
}

/// Cache errors are cheap to clone so that every caller waiting on one
/// download observes the same failure.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Failed to fetch {locator}: {source}")]
    Fetch {
        locator: String,
        source: Arc<FetchError>,
    },

    #[error("Checksum mismatch for {locator}: expected {expected}, got {actual}")]
    CorruptArtifact {
        locator: String,
        expected: String,
        actual: String,
    },

    #[error("Timed out after {waited:?} waiting for another download of {locator} ({holder})")]
    LockTimeout {
        locator: String,
        waited: Duration,
        holder: String,
    },

    #[error("Cache IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: Arc<io::Error>,
    },

    #[error("Invalid cache metadata {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    fn from_lock(locator: &str, err: LockError) -> Self {
        match err {
            LockError::Timeout { waited, holder, .. } => Self::LockTimeout {
                locator: locator.to_string(),
                waited,
                holder,
            },
            LockError::Io { path, source } => Self::io(&path, source),
        }
    }
}

/// A verified artifact in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub locator: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: Sha256Digest,
    pub verified: bool,
}

/// Sidecar for URL-keyed objects, which cannot recover their digest from
/// the key alone.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    locator: String,
    sha256: Sha256Digest,
    size: u64,
    fetched_at: i64,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// How long to wait for another process's download of the same key.
    pub lock_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(300),
        }
    }
}

/// What [`Cache::clean`] removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanReport {
    pub staging_removed: usize,
}

type InFlight = Shared<BoxFuture<'static, Result<CacheEntry, CacheError>>>;

struct Inner {
    root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    reporter: Arc<dyn Reporter>,
    options: CacheOptions,
    // Weak handles: when every caller gives up, the download future is
    // dropped, which releases its file lock and deletes its staging file.
    in_flight: Mutex<HashMap<String, WeakShared<BoxFuture<'static, Result<CacheEntry, CacheError>>>>>,
}

/// Handle to an on-disk cache. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.inner.root)
            .finish_non_exhaustive()
    }
}

/// The cache key for a locator and optional expected checksum.
pub fn cache_key(locator: &str, expected: Option<&Sha256Digest>) -> String {
    match expected {
        Some(digest) => format!("sha256-{digest}"),
        None => format!("url-{}", hex::encode(Sha256::digest(locator.as_bytes()))),
    }
}

fn shard(key: &str) -> &str {
    let hash = key.split_once('-').map_or(key, |(_, h)| h);
    hash.get(..2).unwrap_or(hash)
}

impl Cache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        options: CacheOptions,
    ) -> Result<Self, CacheError> {
        let root = root.into();
        for dir in ["objects", "staging", "locks"] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| CacheError::io(&path, e))?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                fetcher,
                reporter: Arc::new(NullReporter),
                options,
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Replace the progress reporter. Must be called before the handle is cloned.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reporter = reporter;
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.inner.root.join("objects").join(shard(key)).join(key)
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.inner.root.join("locks").join(format!("{key}.lock"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.object_path(key).with_extension("json")
    }

    fn staging_path(&self) -> PathBuf {
        self.inner.root.join("staging")
    }

    /// True while some process is downloading the artifact.
    pub fn is_downloading(&self, locator: &str, expected: Option<&Sha256Digest>) -> bool {
        lock::is_held(&self.lock_path(&cache_key(locator, expected)))
    }

    /// The verified entry, if already present.
    pub fn get(
        &self,
        locator: &str,
        expected: Option<&Sha256Digest>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let key = cache_key(locator, expected);
        let path = self.object_path(&key);
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let sha256 = match expected {
            Some(digest) => digest.clone(),
            None => match self.read_meta(&key)? {
                Some(meta) => meta.sha256,
                // An object without its sidecar was not published by us.
                None => return Ok(None),
            },
        };

        Ok(Some(CacheEntry {
            key,
            locator: locator.to_string(),
            path,
            size,
            sha256,
            verified: true,
        }))
    }

    fn read_meta(&self, key: &str) -> Result<Option<ObjectMeta>, CacheError> {
        let path = self.meta_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Metadata {
                    path,
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Return the verified artifact for `locator`, downloading it if needed.
    ///
    /// Concurrent calls for the same key, in this process or others, share a
    /// single download. Dropping the returned future abandons this caller's
    /// interest; the download itself is cancelled once no caller remains.
    #[instrument(skip(self, expected), fields(key))]
    pub async fn materialize(
        &self,
        locator: &str,
        expected: Option<&Sha256Digest>,
    ) -> Result<CacheEntry, CacheError> {
        if let Some(entry) = self.get(locator, expected)? {
            debug!("cache hit");
            return Ok(entry);
        }

        let key = cache_key(locator, expected);
        tracing::Span::current().record("key", key.as_str());
        let shared = self.join_or_start(&key, locator, expected);
        let result = shared.clone().await;

        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if in_flight
            .get(&key)
            .and_then(WeakShared::upgrade)
            .is_some_and(|current| current.ptr_eq(&shared))
        {
            in_flight.remove(&key);
        }
        result
    }

    fn join_or_start(
        &self,
        key: &str,
        locator: &str,
        expected: Option<&Sha256Digest>,
    ) -> InFlight {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(existing) = in_flight.get(key).and_then(WeakShared::upgrade) {
            debug!("joining in-flight download");
            return existing;
        }

        let cache = self.clone();
        let key_owned = key.to_string();
        let locator = locator.to_string();
        let expected = expected.cloned();
        let fut: BoxFuture<'static, Result<CacheEntry, CacheError>> =
            async move { cache.download(&key_owned, &locator, expected.as_ref()).await }.boxed();
        let shared = fut.shared();
        if let Some(weak) = shared.downgrade() {
            in_flight.insert(key.to_string(), weak);
        }
        shared
    }

    async fn download(
        &self,
        key: &str,
        locator: &str,
        expected: Option<&Sha256Digest>,
    ) -> Result<CacheEntry, CacheError> {
        let _lock = FileLock::acquire(&self.lock_path(key), self.inner.options.lock_timeout)
            .await
            .map_err(|e| CacheError::from_lock(locator, e))?;

        // Another process may have published it while we waited.
        if let Some(entry) = self.get(locator, expected)? {
            debug!("published by another process");
            return Ok(entry);
        }

        info!(locator, "downloading");
        let mut stream = self
            .inner
            .fetcher
            .fetch(locator)
            .await
            .map_err(|e| CacheError::Fetch {
                locator: locator.to_string(),
                source: Arc::new(e),
            })?;

        let staging = self.staging_path();
        let temp = tempfile::Builder::new()
            .prefix(".dl-")
            .tempfile_in(&staging)
            .map_err(|e| CacheError::io(&staging, e))?;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CacheError::Fetch {
                locator: locator.to_string(),
                source: Arc::new(FetchError::Io {
                    path: PathBuf::from(locator),
                    source: e,
                }),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CacheError::io(&temp_path, e))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            self.inner.reporter.downloading(locator, size, None);
        }
        file.flush().await.map_err(|e| CacheError::io(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| CacheError::io(&temp_path, e))?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected {
            if expected.as_str() != actual {
                warn!(locator, expected = %expected, actual, "checksum mismatch");
                // temp_path drops here, deleting the staging file.
                return Err(CacheError::CorruptArtifact {
                    locator: locator.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        let sha256 = Sha256Digest::new(actual).map_err(|e| CacheError::Metadata {
            path: temp_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        set_readonly(&temp_path, true).map_err(|e| CacheError::io(&temp_path, e))?;

        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        if expected.is_none() {
            self.write_meta(
                key,
                &ObjectMeta {
                    locator: locator.to_string(),
                    sha256: sha256.clone(),
                    size,
                    fetched_at: chrono::Utc::now().timestamp(),
                },
            )?;
        }
        temp_path
            .persist(&dest)
            .map_err(|e| CacheError::io(&dest, e.error))?;

        debug!(path = %dest.display(), size, "published");
        Ok(CacheEntry {
            key: key.to_string(),
            locator: locator.to_string(),
            path: dest,
            size,
            sha256,
            verified: true,
        })
    }

    fn write_meta(&self, key: &str, meta: &ObjectMeta) -> Result<(), CacheError> {
        let path = self.meta_path(key);
        let json = serde_json::to_vec_pretty(meta).map_err(|e| CacheError::Metadata {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let staging = self.staging_path();
        let mut temp = tempfile::NamedTempFile::new_in(&staging)
            .map_err(|e| CacheError::io(&staging, e))?;
        io::Write::write_all(&mut temp, &json).map_err(|e| CacheError::io(&path, e))?;
        temp.persist(&path)
            .map_err(|e| CacheError::io(&path, e.error))?;
        Ok(())
    }

    /// Remove the entry for `locator`, if any. Returns true if something was removed.
    pub fn evict(
        &self,
        locator: &str,
        expected: Option<&Sha256Digest>,
    ) -> Result<bool, CacheError> {
        let key = cache_key(locator, expected);
        let path = self.object_path(&key);
        if !path.exists() {
            return Ok(false);
        }
        set_readonly(&path, false).map_err(|e| CacheError::io(&path, e))?;
        std::fs::remove_file(&path).map_err(|e| CacheError::io(&path, e))?;
        let meta = self.meta_path(&key);
        if meta.exists() {
            std::fs::remove_file(&meta).map_err(|e| CacheError::io(&meta, e))?;
        }
        Ok(true)
    }

    /// Delete abandoned staging files.
    ///
    /// Staging files younger than the lock timeout are left alone, since a
    /// live download in another process may still own them. Lock files stay;
    /// see [`crate::lock`].
    pub fn clean(&self) -> Result<CleanReport, CacheError> {
        let mut report = CleanReport::default();
        let cutoff = SystemTime::now()
            .checked_sub(self.inner.options.lock_timeout)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let staging = self.staging_path();
        for entry in std::fs::read_dir(&staging).map_err(|e| CacheError::io(&staging, e))? {
            let entry = entry.map_err(|e| CacheError::io(&staging, e))?;
            let modified = entry.metadata().and_then(|m| m.modified());
            if modified.is_ok_and(|m| m <= cutoff) {
                let path = entry.path();
                std::fs::remove_file(&path).map_err(|e| CacheError::io(&path, e))?;
                report.staging_removed += 1;
            }
        }
        Ok(report)
    }
}

/// Toggle write permission on a file, keeping its other mode bits.
pub(crate) fn set_readonly(path: &Path, readonly: bool) -> io::Result<()> {
    let mut perms = std::fs::symlink_metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        perms.set_mode(if readonly { mode & !0o222 } else { mode | 0o200 });
    }
    #[cfg(not(unix))]
    perms.set_readonly(readonly);
    std::fs::set_permissions(path, perms)
}
