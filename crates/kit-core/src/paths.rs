use dirs::home_dir;
use std::path::{Path, PathBuf};

/// Returns the kit home directory, or None if the user's home cannot be resolved.
///
/// `KIT_HOME` takes precedence over `~/.kit`.
pub fn try_kit_home() -> Option<PathBuf> {
    if let Some(val) = std::env::var_os("KIT_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".kit"))
}

/// Filesystem layout rooted at a kit home directory.
///
/// Everything kit writes lives under one root so that the cache, the
/// package store and the state database share a volume and renames between
/// them stay atomic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Layout rooted at [`try_kit_home`].
    pub fn from_env() -> Option<Self> {
        try_kit_home().map(Self::new)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// User configuration: ~/.kit/config.toml
    pub fn config_path(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    /// `SQLite` database path: ~/.kit/state.db
    pub fn db_path(&self) -> PathBuf {
        self.home.join("state.db")
    }

    /// Content-addressed artifact cache: ~/.kit/cache
    pub fn cache_path(&self) -> PathBuf {
        self.home.join("cache")
    }

    /// Installed package roots: ~/.kit/pkg
    pub fn pkg_path(&self) -> PathBuf {
        self.home.join("pkg")
    }

    /// Scratch space: ~/.kit/tmp
    pub fn tmp_path(&self) -> PathBuf {
        self.home.join("tmp")
    }

    /// Per-reference install locks: ~/.kit/locks
    pub fn locks_path(&self) -> PathBuf {
        self.home.join("locks")
    }

    /// User manifest directory: ~/.kit/manifests
    pub fn manifests_path(&self) -> PathBuf {
        self.home.join("manifests")
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.home.clone(),
            self.cache_path(),
            self.pkg_path(),
            self.tmp_path(),
            self.locks_path(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_rooted_at_home() {
        let paths = Paths::new("/opt/kit");
        assert_eq!(paths.db_path(), PathBuf::from("/opt/kit/state.db"));
        assert_eq!(paths.pkg_path(), PathBuf::from("/opt/kit/pkg"));
        assert!(paths.cache_path().starts_with(paths.home()));
    }

    #[test]
    fn test_ensure_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("home"));
        paths.ensure().unwrap();
        assert!(paths.cache_path().is_dir());
        assert!(paths.locks_path().is_dir());
    }
}
