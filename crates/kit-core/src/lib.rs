pub mod autoversion;
pub mod cache;
pub mod config;
pub mod envars;
pub mod error;
pub mod extract;
pub mod install;
pub mod lock;
pub mod manifest;
pub mod paths;
pub mod resolver;
pub mod sources;
pub mod state;

pub mod reporter;

pub use config::Config;
pub use error::Error;
pub use paths::Paths;
pub use reporter::{NullReporter, Reporter};

/// User Agent string for outbound HTTP requests
pub const USER_AGENT: &str = concat!("kit/", env!("CARGO_PKG_VERSION"));
