//! Package manifests.
//!
//! One TOML document per package. The package name comes from the file or
//! index entry the manifest was loaded from, not from the document itself.

use std::collections::BTreeMap;
use std::fmt;

use kit_schema::{Channel, PackageName, Reference, Sha256Digest, Target, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Strategy key for tag discovery in a git repository.
pub const GIT_TAGS: &str = "git-tags";
/// Strategy key for link discovery on an HTML page.
pub const HTML: &str = "html";

const DEFAULT_VERSION_PATTERN: &str = "v?(.*)";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Invalid manifest for {name}: {source}")]
    Parse {
        name: String,
        source: toml::de::Error,
    },

    #[error("Manifest for {0} declares more than one auto-version block")]
    MultipleAutoVersion(String),

    #[error("No source available for {reference} on {platform}")]
    NoSource {
        reference: String,
        platform: String,
    },

    #[error("Channel {channel} of {name} does not match any declared version")]
    EmptyChannel { name: String, channel: String },
}

/// Operating system and architecture, in manifest vocabulary (`darwin`, `arm64`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }

    /// The platform this binary was built for.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(os, arch)
    }

    fn matches(&self, attrs: &[String]) -> bool {
        attrs.iter().all(|a| *a == self.os || *a == self.arch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// How an environment variable is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvAction {
    Set(String),
    Prepend(String),
    Append(String),
}

/// One declared environment mutation. Declaration order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvOp", into = "RawEnvOp")]
pub struct EnvOp {
    pub name: String,
    pub action: EnvAction,
}

impl EnvOp {
    pub fn set(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            action: EnvAction::Set(value.to_string()),
        }
    }

    pub fn prepend(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            action: EnvAction::Prepend(value.to_string()),
        }
    }

    pub fn append(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            action: EnvAction::Append(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvOp {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prepend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    append: Option<String>,
}

impl TryFrom<RawEnvOp> for EnvOp {
    type Error = String;

    fn try_from(raw: RawEnvOp) -> Result<Self, Self::Error> {
        let action = match (raw.set, raw.prepend, raw.append) {
            (Some(v), None, None) => EnvAction::Set(v),
            (None, Some(v), None) => EnvAction::Prepend(v),
            (None, None, Some(v)) => EnvAction::Append(v),
            _ => {
                return Err(format!(
                    "env entry '{}' needs exactly one of set, prepend or append",
                    raw.name
                ));
            }
        };
        Ok(Self {
            name: raw.name,
            action,
        })
    }
}

impl From<EnvOp> for RawEnvOp {
    fn from(op: EnvOp) -> Self {
        let mut raw = Self {
            name: op.name,
            set: None,
            prepend: None,
            append: None,
        };
        match op.action {
            EnvAction::Set(v) => raw.set = Some(v),
            EnvAction::Prepend(v) => raw.prepend = Some(v),
            EnvAction::Append(v) => raw.append = Some(v),
        }
        raw
    }
}

/// A dynamic version declaration: query `locator` with `strategy` and keep
/// the highest label matched by `version_pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawAutoVersion")]
pub struct AutoVersionBlock {
    pub strategy: String,
    pub locator: String,
    pub version_pattern: String,
}

impl AutoVersionBlock {
    pub fn new(strategy: &str, locator: &str, version_pattern: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            locator: locator.to_string(),
            version_pattern: version_pattern.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawAutoVersion {
    #[serde(default)]
    git_tags: Option<String>,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    version_pattern: Option<String>,
}

impl TryFrom<RawAutoVersion> for AutoVersionBlock {
    type Error = String;

    fn try_from(raw: RawAutoVersion) -> Result<Self, Self::Error> {
        let (strategy, locator) = match (raw.git_tags, raw.html) {
            (Some(url), None) => (GIT_TAGS, url),
            (None, Some(url)) => (HTML, url),
            _ => return Err("auto-version needs exactly one of git-tags or html".to_string()),
        };
        let pattern = raw
            .version_pattern
            .unwrap_or_else(|| DEFAULT_VERSION_PATTERN.to_string());
        Ok(Self::new(strategy, &locator, &pattern))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VersionBlock {
    pub versions: Vec<Version>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub auto_version: Option<AutoVersionBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelBlock {
    pub name: Channel,
    /// Glob over declared versions tracked by this channel.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformBlock {
    pub attrs: Vec<String>,
    pub source: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    description: String,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    binaries: Vec<String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    provides: Vec<String>,
    #[serde(default)]
    strip: usize,
    #[serde(default)]
    sha256sums: BTreeMap<String, Sha256Digest>,
    #[serde(default)]
    env: Vec<EnvOp>,
    #[serde(default, rename = "version")]
    versions: Vec<VersionBlock>,
    #[serde(default, rename = "channel")]
    channels: Vec<ChannelBlock>,
    #[serde(default, rename = "platform")]
    platforms: Vec<PlatformBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub name: PackageName,
    pub description: String,
    pub homepage: Option<String>,
    pub source: Option<String>,
    pub binaries: Vec<String>,
    pub requires: Vec<String>,
    pub provides: Vec<String>,
    /// Leading path components dropped when unpacking.
    pub strip: usize,
    pub sha256sums: BTreeMap<String, Sha256Digest>,
    pub env: Vec<EnvOp>,
    pub version_blocks: Vec<VersionBlock>,
    pub channel_blocks: Vec<ChannelBlock>,
    pub platforms: Vec<PlatformBlock>,
}

impl Manifest {
    /// Parse the manifest for package `name`.
    pub fn parse(name: &str, text: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(text).map_err(|source| ManifestError::Parse {
            name: name.to_string(),
            source,
        })?;

        let auto_blocks = raw
            .versions
            .iter()
            .filter(|b| b.auto_version.is_some())
            .count();
        if auto_blocks > 1 {
            return Err(ManifestError::MultipleAutoVersion(name.to_string()));
        }

        Ok(Self {
            name: PackageName::new(name),
            description: raw.description,
            homepage: raw.homepage,
            source: raw.source,
            binaries: raw.binaries,
            requires: raw.requires,
            provides: raw.provides,
            strip: raw.strip,
            sha256sums: raw.sha256sums,
            env: raw.env,
            version_blocks: raw.versions,
            channel_blocks: raw.channels,
            platforms: raw.platforms,
        })
    }

    /// Every declared version, highest first.
    pub fn versions(&self) -> Vec<&Version> {
        let mut versions: Vec<&Version> = self
            .version_blocks
            .iter()
            .flat_map(|b| b.versions.iter())
            .collect();
        versions.sort_by(|a, b| b.cmp(a));
        versions.dedup();
        versions
    }

    pub fn highest_version(&self) -> Option<&Version> {
        self.versions().into_iter().next()
    }

    pub fn has_version(&self, version: &Version) -> bool {
        self.version_blocks
            .iter()
            .any(|b| b.versions.contains(version))
    }

    pub fn channels(&self) -> &[ChannelBlock] {
        &self.channel_blocks
    }

    pub fn channel(&self, channel: &Channel) -> Option<&ChannelBlock> {
        self.channel_blocks.iter().find(|c| c.name == *channel)
    }

    pub fn auto_version(&self) -> Option<&AutoVersionBlock> {
        self.version_blocks
            .iter()
            .find_map(|b| b.auto_version.as_ref())
    }

    /// Every concrete reference the manifest declares.
    pub fn references(&self) -> Vec<Reference> {
        let versions = self
            .versions()
            .into_iter()
            .map(|v| Reference::version(self.name.clone(), v.clone()));
        let channels = self
            .channel_blocks
            .iter()
            .map(|c| Reference::channel(self.name.clone(), c.name.clone()));
        versions.chain(channels).collect()
    }

    /// The artifact locator for `reference` on `platform`.
    ///
    /// Precedence: a matching `[[platform]]` override, then the version or
    /// channel block's own source, then the top-level source. Versions not
    /// listed anywhere (discovered by auto-version) use the auto-version
    /// block's source.
    pub fn source_for(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<String, ManifestError> {
        let no_source = || ManifestError::NoSource {
            reference: reference.to_string(),
            platform: platform.to_string(),
        };

        let (block_source, version) = match &reference.target {
            Target::Version(v) => {
                let block = self
                    .version_blocks
                    .iter()
                    .find(|b| b.versions.contains(v))
                    .or_else(|| self.version_blocks.iter().find(|b| b.auto_version.is_some()));
                (block.and_then(|b| b.source.clone()), v.as_str().to_string())
            }
            Target::Channel(c) => {
                let block = self.channel(c).ok_or_else(no_source)?;
                let tracked = self.channel_version(block)?;
                let version = tracked.map_or_else(|| c.as_str().to_string(), |v| v.to_string());
                (block.source.clone(), version)
            }
        };

        let template = self
            .platforms
            .iter()
            .find(|p| platform.matches(&p.attrs))
            .map(|p| p.source.clone())
            .or(block_source)
            .or_else(|| self.source.clone())
            .ok_or_else(no_source)?;

        Ok(expand_template(
            &template,
            &[
                ("name", self.name.as_str()),
                ("version", &version),
                ("os", &platform.os),
                ("arch", &platform.arch),
            ],
        ))
    }

    /// The highest declared version a channel tracks, if it tracks one.
    fn channel_version(&self, block: &ChannelBlock) -> Result<Option<&Version>, ManifestError> {
        let Some(glob) = &block.version else {
            return Ok(None);
        };
        let empty = || ManifestError::EmptyChannel {
            name: self.name.to_string(),
            channel: block.name.to_string(),
        };
        let pattern = glob::Pattern::new(glob).map_err(|_| empty())?;
        self.versions()
            .into_iter()
            .find(|v| pattern.matches(v))
            .map(Some)
            .ok_or_else(empty)
    }

    pub fn checksum_for(&self, locator: &str) -> Option<&Sha256Digest> {
        self.sha256sums.get(locator)
    }
}

/// Replace `${key}` placeholders. Unknown keys are left untouched.
pub fn expand_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}
