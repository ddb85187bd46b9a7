//! Reporter trait for dependency injection
//!
//! This trait allows core logic to report progress and status without
//! being coupled to a specific terminal implementation.

use kit_schema::Reference;

pub trait Reporter: Send + Sync {
    /// Updates the progress of an artifact download.
    fn downloading(&self, locator: &str, current: u64, total: Option<u64>);

    /// A package archive is being unpacked.
    fn extracting(&self, reference: &Reference);

    /// Marks a package operation as successfully completed.
    fn done(&self, reference: &Reference, detail: &str);

    /// Marks a package operation as failed with a specific reason.
    fn failed(&self, reference: &Reference, reason: &str);

    /// Updates the state of a package to 'removing'.
    fn removing(&self, reference: &Reference);

    /// Log a warning message.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn downloading(&self, locator: &str, current: u64, total: Option<u64>) {
        (**self).downloading(locator, current, total);
    }
    fn extracting(&self, reference: &Reference) {
        (**self).extracting(reference);
    }
    fn done(&self, reference: &Reference, detail: &str) {
        (**self).done(reference, detail);
    }
    fn failed(&self, reference: &Reference, reason: &str) {
        (**self).failed(reference, reason);
    }
    fn removing(&self, reference: &Reference) {
        (**self).removing(reference);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn downloading(&self, _: &str, _: u64, _: Option<u64>) {}
    fn extracting(&self, _: &Reference) {}
    fn done(&self, _: &Reference, _: &str) {}
    fn failed(&self, _: &Reference, _: &str) {}
    fn removing(&self, _: &Reference) {}
    fn warning(&self, _: &str) {}
}
