//! Crate-level error for callers that want a single type.

use std::time::Duration;

use thiserror::Error;

use crate::autoversion::AutoVersionError;
use crate::cache::{CacheError, FetchError};
use crate::config::ConfigError;
use crate::install::InstallError;
use crate::lock::LockError;
use crate::manifest::ManifestError;
use crate::resolver::ResolveError;
use crate::sources::SourceError;
use crate::state::StateError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    AutoVersion(#[from] AutoVersionError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },
}
