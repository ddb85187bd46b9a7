//! Package selectors: possibly-partial references supplied by users.
//!
//! Accepted forms:
//!
//! - `jq` - any version or channel of `jq`
//! - `jq-1.7.1` or `jq@1.7.1` - an exact version
//! - `node@lts` - a channel (`@latest` means "unconstrained")
//! - `go-1.2*` - a glob over `name`, `name-version` and `name@channel`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{Channel, PackageName, Reference, Target, Version};

/// Errors produced when parsing a [`Selector`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// The input was empty.
    #[error("empty package selector")]
    Empty,

    /// The input had a version or channel but no name.
    #[error("invalid package selector '{0}': missing package name")]
    MissingName(String),

    /// The input ended in `@` with nothing after it.
    #[error("invalid package selector '{0}': missing version or channel after @")]
    MissingTarget(String),

    /// The glob pattern could not be compiled.
    #[error("invalid glob selector '{input}': {reason}")]
    InvalidGlob {
        /// Offending input.
        input: String,
        /// Why the pattern was rejected.
        reason: String,
    },
}

/// A user-supplied, possibly-partial package reference.
///
/// Version and channel are mutually exclusive; the constructors are the only
/// way to build one, which keeps that invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    name: PackageName,
    version: Option<Version>,
    channel: Option<Channel>,
    glob: Option<glob::Pattern>,
}

/// Byte offset of the `-` that separates a name from its version, if any.
///
/// Names may themselves contain dashes (`protoc-gen-go-1.31.0`), so the split
/// happens at the first dash that is followed by a digit.
pub(crate) fn version_split(input: &str) -> Option<usize> {
    input
        .as_bytes()
        .windows(2)
        .position(|w| w[0] == b'-' && w[1].is_ascii_digit())
}

impl Selector {
    /// Select any version or channel of `name`.
    pub fn name(name: impl Into<PackageName>) -> Self {
        Self {
            name: name.into(),
            version: None,
            channel: None,
            glob: None,
        }
    }

    /// Select an exact version of `name`.
    pub fn version(name: impl Into<PackageName>, version: impl Into<Version>) -> Self {
        Self {
            version: Some(version.into()),
            ..Self::name(name)
        }
    }

    /// Select a channel of `name`.
    pub fn channel(name: impl Into<PackageName>, channel: impl Into<Channel>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::name(name)
        }
    }

    /// Select exactly the given reference.
    pub fn exact(reference: &Reference) -> Self {
        match &reference.target {
            Target::Version(v) => Self::version(reference.name.clone(), v.clone()),
            Target::Channel(c) => Self::channel(reference.name.clone(), c.clone()),
        }
    }

    /// Parse a selector from user input.
    ///
    /// # Errors
    ///
    /// Returns a [`SelectorError`] for empty input, a missing name or target,
    /// or an uncompilable glob.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SelectorError::Empty);
        }

        if input.contains(['*', '?', '[']) {
            let pattern = glob::Pattern::new(input).map_err(|e| SelectorError::InvalidGlob {
                input: input.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Self {
                glob: Some(pattern),
                ..Self::name(input)
            });
        }

        if let Some((name, target)) = input.split_once('@') {
            if name.is_empty() {
                return Err(SelectorError::MissingName(input.to_string()));
            }
            if target.is_empty() {
                return Err(SelectorError::MissingTarget(input.to_string()));
            }
            return Ok(if target == "latest" {
                Self::name(name)
            } else if target.starts_with(|c: char| c.is_ascii_digit()) {
                Self::version(name, target)
            } else {
                Self::channel(name, target)
            });
        }

        match version_split(input) {
            Some(0) => Err(SelectorError::MissingName(input.to_string())),
            Some(idx) => Ok(Self::version(&input[..idx], &input[idx + 1..])),
            None => Ok(Self::name(input)),
        }
    }

    /// The package name (for glob selectors, the raw pattern text).
    pub fn package_name(&self) -> &PackageName {
        &self.name
    }

    /// The requested version, if pinned.
    pub fn requested_version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// The requested channel, if any.
    pub fn requested_channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Returns true for glob selectors.
    pub fn is_glob(&self) -> bool {
        self.glob.is_some()
    }

    /// Returns true if the selector pins a version or channel.
    pub fn is_constrained(&self) -> bool {
        self.version.is_some() || self.channel.is_some()
    }

    /// Returns true if a package called `name` could satisfy this selector.
    pub fn matches_name(&self, name: &str) -> bool {
        match &self.glob {
            Some(glob) => glob.matches(name) || glob.as_str().starts_with(&format!("{name}-")),
            None => self.name == name,
        }
    }

    /// Returns true if `reference` satisfies this selector.
    pub fn matches(&self, reference: &Reference) -> bool {
        if let Some(glob) = &self.glob {
            return glob.matches(&reference.name) || glob.matches(&reference.to_string());
        }
        if reference.name != self.name {
            return false;
        }
        match (&self.version, &self.channel, &reference.target) {
            (None, None, _) => true,
            (Some(want), _, Target::Version(have)) => want == have,
            (_, Some(want), Target::Channel(have)) => want == have,
            _ => false,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(glob) = &self.glob {
            return f.write_str(glob.as_str());
        }
        match (&self.version, &self.channel) {
            (Some(v), _) => write!(f, "{}-{v}", self.name),
            (_, Some(c)) => write!(f, "{}@{c}", self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let plain = Selector::parse("jq").unwrap();
        assert!(!plain.is_constrained());
        assert_eq!(plain.package_name(), "jq");

        let dashed = Selector::parse("protoc-gen-go-1.31.0").unwrap();
        assert_eq!(dashed.package_name(), "protoc-gen-go");
        assert_eq!(dashed.requested_version().unwrap(), "1.31.0");

        let at_version = Selector::parse("jq@1.7.1").unwrap();
        assert_eq!(at_version.requested_version().unwrap(), "1.7.1");

        let channel = Selector::parse("node@lts").unwrap();
        assert_eq!(channel.requested_channel().unwrap().as_str(), "lts");
        assert!(channel.requested_version().is_none());

        assert!(!Selector::parse("jq@latest").unwrap().is_constrained());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Selector::parse("  "), Err(SelectorError::Empty));
        assert!(matches!(
            Selector::parse("@stable"),
            Err(SelectorError::MissingName(_))
        ));
        assert!(matches!(
            Selector::parse("jq@"),
            Err(SelectorError::MissingTarget(_))
        ));
        assert!(matches!(
            Selector::parse("-1.0"),
            Err(SelectorError::MissingName(_))
        ));
    }

    #[test]
    fn test_matches_references() {
        let go_121 = Reference::version("go", "1.21.3");
        let go_stable = Reference::channel("go", "stable");

        assert!(Selector::parse("go").unwrap().matches(&go_121));
        assert!(Selector::parse("go").unwrap().matches(&go_stable));
        assert!(Selector::parse("go-1.21.3").unwrap().matches(&go_121));
        assert!(!Selector::parse("go-1.20.0").unwrap().matches(&go_121));
        assert!(!Selector::parse("go@stable").unwrap().matches(&go_121));
        assert!(Selector::parse("go@stable").unwrap().matches(&go_stable));
        assert!(!Selector::parse("golang").unwrap().matches(&go_121));
    }

    #[test]
    fn test_glob_matches_name_and_reference() {
        let by_version = Selector::parse("go-1.21*").unwrap();
        assert!(by_version.is_glob());
        assert!(by_version.matches(&Reference::version("go", "1.21.3")));
        assert!(!by_version.matches(&Reference::version("go", "1.20.0")));
        assert!(by_version.matches_name("go"));

        let by_name = Selector::parse("proto*").unwrap();
        assert!(by_name.matches_name("protoc"));
        assert!(by_name.matches(&Reference::version("protoc", "25.1")));
        assert!(!by_name.matches_name("jq"));
    }

    #[test]
    fn test_display_round_trips() {
        for raw in ["jq", "go-1.21.3", "node@lts", "go-1.2*"] {
            assert_eq!(Selector::parse(raw).unwrap().to_string(), raw);
        }
    }
}
