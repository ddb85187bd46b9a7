//! Package names, versions, channels and fully qualified references.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A normalized package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    /// Create a new package name, normalizing the input to lowercase.
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    /// Return the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::ops::Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

/// A concrete version label (`1.2.3`, `1.21`, `2024-01-05`).
///
/// Ordered with [`crate::version::compare`]; labels that denote the same
/// semantic version fall back to string order so `Ord` stays consistent with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Create a new version from the given string (stored trimmed, as-is).
    pub fn new(v: &str) -> Self {
        Self(v.trim().to_string())
    }

    /// Return the version string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lenient semver reading of this label, if any.
    pub fn semver(&self) -> Option<semver::Version> {
        crate::version::parse_lenient(&self.0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        crate::version::compare(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::ops::Deref for Version {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl PartialEq<str> for Version {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Version {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A rolling, non-pinned version track such as `stable` or `nightly`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel name.
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_string())
    }

    /// Return the channel name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What a [`Reference`] points at: an exact version or a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// An exact version.
    Version(Version),
    /// A rolling channel.
    Channel(Channel),
}

impl Target {
    /// The version, if this target is one.
    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::Version(v) => Some(v),
            Self::Channel(_) => None,
        }
    }

    /// The channel, if this target is one.
    pub fn channel(&self) -> Option<&Channel> {
        match self {
            Self::Version(_) => None,
            Self::Channel(c) => Some(c),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(v) => write!(f, "{v}"),
            Self::Channel(c) => write!(f, "@{c}"),
        }
    }
}

/// Errors produced when parsing a fully-qualified [`Reference`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The input carried neither a `-<version>` nor an `@<channel>` suffix.
    #[error("'{0}' is not a fully qualified reference (expected name-version or name@channel)")]
    Unqualified(String),

    /// The name part of the input was empty.
    #[error("'{0}' has an empty package name")]
    EmptyName(String),
}

/// A fully resolved package reference: name plus exact version or channel.
///
/// Displays as `name-1.2.3` or `name@stable`; this string is the state-store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Package name.
    pub name: PackageName,
    /// Concrete version or channel.
    pub target: Target,
}

impl Reference {
    /// Reference to an exact version.
    pub fn version(name: impl Into<PackageName>, version: impl Into<Version>) -> Self {
        Self {
            name: name.into(),
            target: Target::Version(version.into()),
        }
    }

    /// Reference to a channel.
    pub fn channel(name: impl Into<PackageName>, channel: impl Into<Channel>) -> Self {
        Self {
            name: name.into(),
            target: Target::Channel(channel.into()),
        }
    }

    /// The version label or channel name without decoration.
    pub fn target_label(&self) -> &str {
        match &self.target {
            Target::Version(v) => v.as_str(),
            Target::Channel(c) => c.as_str(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Version(v) => write!(f, "{}-{v}", self.name),
            Target::Channel(c) => write!(f, "{}@{c}", self.name),
        }
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((name, channel)) = s.split_once('@') {
            if name.is_empty() {
                return Err(ReferenceError::EmptyName(s.to_string()));
            }
            return Ok(Self::channel(name, channel));
        }
        match crate::selector::version_split(s) {
            Some(0) => Err(ReferenceError::EmptyName(s.to_string())),
            Some(idx) => Ok(Self::version(&s[..idx], &s[idx + 1..])),
            None => Err(ReferenceError::Unqualified(s.to_string())),
        }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
