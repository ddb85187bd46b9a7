//! State store actor
//!
//! `SQLite` connections are not `Sync`, so the [`StateDb`] lives on a
//! dedicated thread and async callers talk to it through messages.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use kit_schema::Reference;
use tokio::sync::oneshot;

use super::db::StateDb;
use super::{InstalledRecord, ReconcileReport, StateError};

type Reply<T> = oneshot::Sender<Result<T, StateError>>;

/// Requests understood by the store thread
enum StateEvent {
    GetPackage {
        reference: Reference,
        resp: Reply<Option<InstalledRecord>>,
    },
    ListInstalled {
        resp: Reply<Vec<InstalledRecord>>,
    },
    ListAll {
        resp: Reply<Vec<InstalledRecord>>,
    },
    PutPackage {
        record: Box<InstalledRecord>,
        resp: Reply<()>,
    },
    RemovePackage {
        reference: Reference,
        resp: Reply<InstalledRecord>,
    },
    Reconcile {
        pkg_root: PathBuf,
        resp: Reply<ReconcileReport>,
    },
    PruneOrphans {
        resp: Reply<Vec<Reference>>,
    },
}

impl fmt::Debug for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetPackage { reference, .. } => f
                .debug_struct("GetPackage")
                .field("reference", reference)
                .finish_non_exhaustive(),
            Self::ListInstalled { .. } => write!(f, "ListInstalled"),
            Self::ListAll { .. } => write!(f, "ListAll"),
            Self::PutPackage { record, .. } => f
                .debug_struct("PutPackage")
                .field("reference", &record.reference)
                .finish_non_exhaustive(),
            Self::RemovePackage { reference, .. } => f
                .debug_struct("RemovePackage")
                .field("reference", reference)
                .finish_non_exhaustive(),
            Self::Reconcile { pkg_root, .. } => f
                .debug_struct("Reconcile")
                .field("pkg_root", pkg_root)
                .finish_non_exhaustive(),
            Self::PruneOrphans { .. } => write!(f, "PruneOrphans"),
        }
    }
}

/// A handle to the state store thread. Cheap to clone; the thread exits when
/// the last handle is dropped.
#[derive(Clone)]
pub struct StateStore {
    sender: mpsc::Sender<StateEvent>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open the database at `path` and start its thread.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        Ok(Self::spawn(StateDb::open_at(path)?))
    }

    pub fn spawn(db: StateDb) -> Self {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            run_event_loop(db, receiver);
        });
        Self { sender }
    }

    /// Helper to send a request and wait for the response
    async fn request<T, F>(&self, f: F) -> Result<T, StateError>
    where
        F: FnOnce(Reply<T>) -> StateEvent,
    {
        let (tx, rx) = oneshot::channel();
        self.sender.send(f(tx)).map_err(|_| StateError::ActorDied)?;
        rx.await.map_err(|_| StateError::ActorDied)?
    }

    pub async fn get_package(
        &self,
        reference: &Reference,
    ) -> Result<Option<InstalledRecord>, StateError> {
        let reference = reference.clone();
        self.request(|resp| StateEvent::GetPackage { reference, resp })
            .await
    }

    pub async fn list_installed(&self) -> Result<Vec<InstalledRecord>, StateError> {
        self.request(|resp| StateEvent::ListInstalled { resp }).await
    }

    pub async fn list_all(&self) -> Result<Vec<InstalledRecord>, StateError> {
        self.request(|resp| StateEvent::ListAll { resp }).await
    }

    pub async fn put_package(&self, record: InstalledRecord) -> Result<(), StateError> {
        self.request(|resp| StateEvent::PutPackage {
            record: Box::new(record),
            resp,
        })
        .await
    }

    pub async fn remove_package(&self, reference: &Reference) -> Result<InstalledRecord, StateError> {
        let reference = reference.clone();
        self.request(|resp| StateEvent::RemovePackage { reference, resp })
            .await
    }

    pub async fn reconcile(&self, pkg_root: &Path) -> Result<ReconcileReport, StateError> {
        let pkg_root = pkg_root.to_path_buf();
        self.request(|resp| StateEvent::Reconcile { pkg_root, resp })
            .await
    }

    pub async fn prune_orphans(&self) -> Result<Vec<Reference>, StateError> {
        self.request(|resp| StateEvent::PruneOrphans { resp }).await
    }
}

// The db and receiver are moved into this thread so it has exclusive
// ownership of the connection.
#[allow(clippy::needless_pass_by_value)]
fn run_event_loop(db: StateDb, receiver: mpsc::Receiver<StateEvent>) {
    while let Ok(event) = receiver.recv() {
        tracing::trace!(?event, "state request");
        match event {
            StateEvent::GetPackage { reference, resp } => {
                let _ = resp.send(db.get_package(&reference));
            }
            StateEvent::ListInstalled { resp } => {
                let _ = resp.send(db.list_installed());
            }
            StateEvent::ListAll { resp } => {
                let _ = resp.send(db.list_all());
            }
            StateEvent::PutPackage { record, resp } => {
                let _ = resp.send(db.put_package(&record));
            }
            StateEvent::RemovePackage { reference, resp } => {
                let _ = resp.send(db.remove_package(&reference));
            }
            StateEvent::Reconcile { pkg_root, resp } => {
                let _ = resp.send(db.reconcile(&pkg_root));
            }
            StateEvent::PruneOrphans { resp } => {
                let _ = resp.send(db.prune_orphans());
            }
        }
    }
}
