//! Durable record of installed packages.
//!
//! [`StateDb`] owns a `SQLite` connection; [`StateStore`] hosts one on a
//! dedicated thread so async callers can share it.

mod actor;
mod db;

use std::path::PathBuf;

use kit_schema::{Reference, Sha256Digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::EnvOp;

pub use actor::StateStore;
pub use db::StateDb;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid record for {reference}: {reason}")]
    InvalidRecord { reference: String, reason: String },

    #[error("Package not installed: {0}")]
    NotFound(String),

    #[error("State inconsistent: {reference} is recorded at {path} but that path does not exist")]
    Inconsistent { reference: String, path: PathBuf },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("State store actor died")]
    ActorDied,
}

/// What the fast path needs to describe an installed package without
/// consulting any manifest provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvOp>,
    #[serde(default)]
    pub binaries: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
}

/// One installed package. At most one per reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledRecord {
    pub reference: Reference,
    pub install_path: PathBuf,
    pub checksum: Option<Sha256Digest>,
    /// Unix seconds.
    pub installed_at: i64,
    /// Locator the artifact was fetched from.
    pub source: String,
    pub metadata: PackageMetadata,
}

impl InstalledRecord {
    /// True if the package root is still on disk.
    pub fn exists(&self) -> bool {
        self.install_path.exists()
    }
}

/// Disagreements between the database and the package directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose root has disappeared.
    pub orphaned: Vec<InstalledRecord>,
    /// Package directories nothing records.
    pub untracked: Vec<PathBuf>,
    /// Rows that could not be decoded, as `(reference, reason)`.
    pub invalid: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.untracked.is_empty() && self.invalid.is_empty()
    }

    /// One diagnostic per orphaned or unreadable record.
    pub fn inconsistencies(&self) -> Vec<StateError> {
        let orphaned = self.orphaned.iter().map(|r| StateError::Inconsistent {
            reference: r.reference.to_string(),
            path: r.install_path.clone(),
        });
        let invalid = self
            .invalid
            .iter()
            .map(|(reference, reason)| StateError::InvalidRecord {
                reference: reference.clone(),
                reason: reason.clone(),
            });
        orphaned.chain(invalid).collect()
    }
}
