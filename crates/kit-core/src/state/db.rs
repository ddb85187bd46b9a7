//! SQLite state database
//!
//! One row per installed reference. Each write is a single transaction, so a
//! crash can never leave a half-written record, and WAL mode keeps readers in
//! other processes isolated from in-flight writes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kit_schema::{Reference, Sha256Digest, Target};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, warn};

use super::{InstalledRecord, PackageMetadata, ReconcileReport, StateError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const COLUMNS: &str =
    "reference, name, target, install_path, checksum, installed_at, source, metadata";

/// State database for tracking installations
#[derive(Debug)]
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open or create the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StateError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StateError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS packages (
                reference TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                install_path TEXT NOT NULL,
                checksum TEXT,
                source TEXT NOT NULL,
                installed_at INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_packages_name ON packages(name);
            ",
        )?;
        Ok(())
    }

    /// Insert or replace the record for its reference.
    pub fn put_package(&self, record: &InstalledRecord) -> Result<(), StateError> {
        let metadata = serde_json::to_string(&record.metadata).map_err(|e| {
            StateError::InvalidRecord {
                reference: record.reference.to_string(),
                reason: e.to_string(),
            }
        })?;
        let target = encode_target(&record.reference.target);

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO packages
                (reference, name, target, install_path, checksum, source, installed_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.reference.to_string(),
                record.reference.name.as_str(),
                target,
                record.install_path.to_string_lossy(),
                record.checksum.as_ref().map(Sha256Digest::as_str),
                record.source,
                record.installed_at,
                metadata,
            ],
        )?;
        tx.commit()?;
        debug!(reference = %record.reference, "recorded installation");
        Ok(())
    }

    pub fn get_package(&self, reference: &Reference) -> Result<Option<InstalledRecord>, StateError> {
        let sql = format!("SELECT {COLUMNS} FROM packages WHERE reference = ?1");
        self.conn
            .query_row(&sql, params![reference.to_string()], read_row)
            .optional()?
            .transpose()
    }

    /// Every record, whether or not its root exists.
    ///
    /// Rows that cannot be decoded are logged and left out; see
    /// [`StateDb::reconcile`] for a listing that reports them.
    pub fn list_all(&self) -> Result<Vec<InstalledRecord>, StateError> {
        let (records, invalid) = self.scan()?;
        for err in &invalid {
            warn!(error = %err, "skipping unreadable state record");
        }
        Ok(records)
    }

    /// Decodable records, plus one `InvalidRecord` per row that is not.
    fn scan(&self) -> Result<(Vec<InstalledRecord>, Vec<StateError>), StateError> {
        let sql = format!("SELECT {COLUMNS} FROM packages ORDER BY name, reference");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_row)?;

        let mut records = Vec::new();
        let mut invalid = Vec::new();
        for row in rows {
            match row? {
                Ok(record) => records.push(record),
                Err(err) => invalid.push(err),
            }
        }
        Ok((records, invalid))
    }

    /// Records whose package root still exists.
    pub fn list_installed(&self) -> Result<Vec<InstalledRecord>, StateError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(InstalledRecord::exists)
            .collect())
    }

    /// Remove the record for `reference`, returning it.
    pub fn remove_package(&self, reference: &Reference) -> Result<InstalledRecord, StateError> {
        let tx = self.conn.unchecked_transaction()?;
        let sql = format!("SELECT {COLUMNS} FROM packages WHERE reference = ?1");
        let record = tx
            .query_row(&sql, params![reference.to_string()], read_row)
            .optional()?
            .transpose()?
            .ok_or_else(|| StateError::NotFound(reference.to_string()))?;
        tx.execute(
            "DELETE FROM packages WHERE reference = ?1",
            params![reference.to_string()],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Compare records against the package directory.
    pub fn reconcile(&self, pkg_root: &Path) -> Result<ReconcileReport, StateError> {
        let (records, invalid) = self.scan()?;
        let mut report = ReconcileReport::default();
        for err in invalid {
            if let StateError::InvalidRecord { reference, reason } = err {
                warn!(%reference, %reason, "unreadable record");
                report.invalid.push((reference, reason));
            }
        }

        for record in &records {
            if !record.exists() {
                warn!(reference = %record.reference, path = %record.install_path.display(), "orphaned record");
                report.orphaned.push(record.clone());
            }
        }

        let entries = match std::fs::read_dir(pkg_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(source) => {
                return Err(StateError::Io {
                    path: pkg_root.to_path_buf(),
                    source,
                });
            }
        };
        for entry in entries {
            let path = entry
                .map_err(|source| StateError::Io {
                    path: pkg_root.to_path_buf(),
                    source,
                })?
                .path();
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if hidden || !path.is_dir() {
                continue;
            }
            if !records.iter().any(|r| r.install_path == path) {
                report.untracked.push(path);
            }
        }
        report.untracked.sort();
        Ok(report)
    }

    /// Delete every orphaned record, returning their references.
    pub fn prune_orphans(&self) -> Result<Vec<Reference>, StateError> {
        let orphans: Vec<Reference> = self
            .list_all()?
            .into_iter()
            .filter(|r| !r.exists())
            .map(|r| r.reference)
            .collect();

        let tx = self.conn.unchecked_transaction()?;
        for reference in &orphans {
            tx.execute(
                "DELETE FROM packages WHERE reference = ?1",
                params![reference.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(orphans)
    }
}

/// Channels are stored with a leading `@`, versions bare.
fn encode_target(target: &Target) -> String {
    match target {
        Target::Version(v) => v.to_string(),
        Target::Channel(c) => format!("@{c}"),
    }
}

fn decode_target(raw: &str) -> Option<Target> {
    match raw.strip_prefix('@') {
        Some("") => None,
        Some(channel) => Some(Target::Channel(channel.into())),
        None if raw.is_empty() => None,
        None => Some(Target::Version(raw.into())),
    }
}

/// Decode a row. The outer `Result` is SQLite's, the inner one ours.
///
/// The reference comes from the `name` and `target` columns; its display
/// string is ambiguous for names containing `-<digit>`.
fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<InstalledRecord, StateError>> {
    let reference: String = row.get(0)?;
    let name: String = row.get(1)?;
    let target: String = row.get(2)?;
    let install_path: String = row.get(3)?;
    let checksum: Option<String> = row.get(4)?;
    let installed_at: i64 = row.get(5)?;
    let source: String = row.get(6)?;
    let metadata: String = row.get(7)?;

    let invalid = |reason: String| StateError::InvalidRecord {
        reference: reference.clone(),
        reason,
    };
    let decode = || -> Result<InstalledRecord, StateError> {
        if name.is_empty() {
            return Err(invalid("empty package name".to_string()));
        }
        let target = decode_target(&target)
            .ok_or_else(|| invalid(format!("unusable target '{target}'")))?;
        let parsed = Reference {
            name: name.as_str().into(),
            target,
        };
        let checksum = checksum
            .map(Sha256Digest::new)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;
        let metadata: PackageMetadata =
            serde_json::from_str(&metadata).map_err(|e| invalid(e.to_string()))?;
        Ok(InstalledRecord {
            reference: parsed,
            install_path: PathBuf::from(&install_path),
            checksum,
            installed_at,
            source: source.clone(),
            metadata,
        })
    };
    Ok(decode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::EnvOp;
    use tempfile::tempdir;

    fn record(reference: &str, root: &Path) -> InstalledRecord {
        record_for(reference.parse().unwrap(), root)
    }

    fn record_for(reference: Reference, root: &Path) -> InstalledRecord {
        InstalledRecord {
            install_path: root.join(reference.to_string()),
            reference,
            checksum: Some(
                Sha256Digest::new(
                    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                )
                .unwrap(),
            ),
            installed_at: 1_700_000_000,
            source: "https://example.com/a.tgz".to_string(),
            metadata: PackageMetadata {
                description: "A tool".to_string(),
                env: vec![EnvOp::prepend("PATH", "${root}/bin")],
                binaries: vec!["bin/*".to_string()],
                ..PackageMetadata::default()
            },
        }
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let db = StateDb::open_at(&dir.path().join("state.db")).unwrap();
        let rec = record("go-1.21.3", dir.path());

        db.put_package(&rec).unwrap();
        assert_eq!(db.get_package(&rec.reference).unwrap().unwrap(), rec);

        // Same reference replaces rather than duplicates.
        let mut newer = rec.clone();
        newer.installed_at += 10;
        db.put_package(&newer).unwrap();
        assert_eq!(db.list_all().unwrap(), vec![newer.clone()]);

        assert_eq!(db.remove_package(&rec.reference).unwrap(), newer);
        assert!(db.get_package(&rec.reference).unwrap().is_none());
        assert!(matches!(
            db.remove_package(&rec.reference),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_installed_skips_missing_roots() {
        let dir = tempdir().unwrap();
        let db = StateDb::open_in_memory().unwrap();
        let present = record("jq-1.7.1", dir.path());
        let missing = record("node@lts", dir.path());
        std::fs::create_dir_all(&present.install_path).unwrap();
        db.put_package(&present).unwrap();
        db.put_package(&missing).unwrap();

        assert_eq!(db.list_all().unwrap().len(), 2);
        assert_eq!(db.list_installed().unwrap(), vec![present]);
    }

    #[test]
    fn test_reconcile_and_prune() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        let db = StateDb::open_at(&dir.path().join("state.db")).unwrap();

        let kept = record("jq-1.7.1", &pkg);
        let orphan = record("go-1.21.3", &pkg);
        std::fs::create_dir_all(&kept.install_path).unwrap();
        std::fs::create_dir_all(&orphan.install_path).unwrap();
        std::fs::create_dir_all(pkg.join("stray-0.1.0")).unwrap();
        std::fs::create_dir_all(pkg.join(".staging-abc")).unwrap();
        db.put_package(&kept).unwrap();
        db.put_package(&orphan).unwrap();
        assert!(db.reconcile(&pkg).unwrap().orphaned.is_empty());

        // Deleted out-of-band.
        std::fs::remove_dir_all(&orphan.install_path).unwrap();

        let report = db.reconcile(&pkg).unwrap();
        assert_eq!(report.orphaned, vec![orphan.clone()]);
        assert_eq!(report.untracked, vec![pkg.join("stray-0.1.0")]);
        assert!(matches!(
            report.inconsistencies().as_slice(),
            [StateError::Inconsistent { .. }]
        ));

        assert_eq!(db.prune_orphans().unwrap(), vec![orphan.reference]);
        assert!(db.reconcile(&pkg).unwrap().orphaned.is_empty());
        assert_eq!(db.list_all().unwrap(), vec![kept]);
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let rec = record("node@lts", dir.path());
        StateDb::open_at(&path).unwrap().put_package(&rec).unwrap();

        let reopened = StateDb::open_at(&path).unwrap();
        let got = reopened.get_package(&rec.reference).unwrap().unwrap();
        assert_eq!(got.metadata.env, rec.metadata.env);
        assert_eq!(got.reference.target_label(), "lts");
    }

    #[test]
    fn test_references_survive_round_trip() {
        let dir = tempdir().unwrap();
        let db = StateDb::open_in_memory().unwrap();
        let labelled = record_for(Reference::version("tool", "r25"), dir.path());
        let dashed = record_for(Reference::version("font-3d", "1.0.0"), dir.path());
        let channel = record_for(Reference::channel("node", "lts"), dir.path());
        for rec in [&labelled, &dashed, &channel] {
            db.put_package(rec).unwrap();
        }

        let got = db.get_package(&labelled.reference).unwrap().unwrap();
        assert_eq!(got.reference.name, "tool");
        assert_eq!(got.reference.target_label(), "r25");

        let got = db.get_package(&dashed.reference).unwrap().unwrap();
        assert_eq!(got.reference.name, "font-3d");
        assert_eq!(got.reference.target_label(), "1.0.0");

        let all = db.list_all().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&labelled));
        assert!(all.contains(&dashed));
        assert!(all.contains(&channel));
    }

    #[test]
    fn test_unreadable_row_does_not_hide_others() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        let db = StateDb::open_in_memory().unwrap();
        let good = record("jq-1.7.1", &pkg);
        std::fs::create_dir_all(&good.install_path).unwrap();
        db.put_package(&good).unwrap();
        db.conn
            .execute(
                "INSERT INTO packages
                    (reference, name, target, install_path, checksum, source, installed_at, metadata)
                 VALUES ('broken-1.0.0', 'broken', '1.0.0', '/nowhere', NULL, 'x', 0, 'not json')",
                [],
            )
            .unwrap();

        assert_eq!(db.list_all().unwrap(), vec![good.clone()]);
        assert_eq!(db.list_installed().unwrap(), vec![good.clone()]);
        assert_eq!(db.get_package(&good.reference).unwrap().unwrap(), good);

        let report = db.reconcile(&pkg).unwrap();
        assert!(!report.is_clean());
        assert!(report.orphaned.is_empty());
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].0, "broken-1.0.0");
        assert!(matches!(
            report.inconsistencies().as_slice(),
            [StateError::InvalidRecord { .. }]
        ));

        assert!(db.prune_orphans().unwrap().is_empty());
    }
}
