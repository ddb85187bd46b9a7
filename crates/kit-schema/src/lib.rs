//! Pure value types shared by every kit crate.
//!
//! Nothing in here performs I/O: a [`Selector`] is parsed from user input,
//! matched against [`Reference`]s, and ordered through [`version::compare`].

pub mod hash;
pub mod selector;
pub mod types;
pub mod version;

// Re-exports
pub use hash::*;
pub use selector::{Selector, SelectorError};
pub use types::*;
