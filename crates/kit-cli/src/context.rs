//! Shared command context.
//!
//! Groups the configured core services so each command takes one argument.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use kit_core::autoversion::AutoVersion;
use kit_core::cache::{Cache, CacheOptions, DefaultFetcher};
use kit_core::envars::Envars;
use kit_core::install::Installer;
use kit_core::manifest::Platform;
use kit_core::resolver::Resolver;
use kit_core::sources::Sources;
use kit_core::state::StateStore;
use kit_core::{Config, Paths, Reporter};

use crate::ui::TerminalReporter;

#[derive(Clone)]
pub struct Context {
    pub paths: Paths,
    pub config: Config,
    pub cache: Cache,
    pub state: StateStore,
    pub resolver: Resolver,
    pub installer: Installer,
    pub reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("paths", &self.paths)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Load configuration and open the cache and state database.
    pub fn load(quiet: bool) -> Result<Self> {
        let paths = Paths::from_env()
            .context("Could not determine a home directory; set KIT_HOME")?;
        paths
            .ensure()
            .with_context(|| format!("Failed to create {}", paths.home().display()))?;
        let config = Config::load(&paths).context("Failed to load configuration")?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        let reporter: Arc<dyn Reporter> = Arc::new(TerminalReporter::new(quiet));

        let sources = Sources::from_config(&config, &paths, &client)
            .context("Invalid manifest source configuration")?;
        let fetcher =
            Arc::new(DefaultFetcher::new(client.clone()).with_user_agent(&config.user_agent));
        let cache = Cache::open(
            paths.cache_path(),
            fetcher,
            CacheOptions {
                lock_timeout: config.lock_timeout(),
            },
        )
        .context("Failed to open artifact cache")?
        .with_reporter(reporter.clone());
        let state = StateStore::open(&paths.db_path()).context("Failed to open state database")?;

        let resolver = Resolver::new(
            sources,
            AutoVersion::with_defaults(client),
            Platform::current(),
            Envars::from_os(),
            paths.pkg_path(),
        )
        .with_cache(cache.clone());
        let installer = Installer::new(cache.clone(), state.clone(), paths.clone())
            .with_reporter(reporter.clone())
            .with_lock_timeout(config.lock_timeout());

        Ok(Self {
            paths,
            config,
            cache,
            state,
            resolver,
            installer,
            reporter,
        })
    }

    /// The per-command deadline: the flag if given, else the configured one.
    pub fn timeout(&self, flag: Option<u64>) -> Option<Duration> {
        flag.map(Duration::from_secs).or_else(|| self.config.resolve_timeout())
    }
}
