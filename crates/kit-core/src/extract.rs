//! Archive extraction
//!
//! Unpacks tar.gz, tar.zst, tar and zip artifacts, dropping `strip` leading
//! path components. Anything else is treated as a single executable.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use zip::ZipArchive;
use zstd::stream::Decoder as ZstdDecoder;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Invalid path in archive: {0}")]
    UnsafePath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    TarGz,
    TarZst,
    Tar,
    Zip,
    Binary,
}

/// Detect the format from a locator, ignoring any fragment or query.
pub fn detect_format(locator: &str) -> ArtifactFormat {
    let path = locator_path(locator).to_lowercase();

    if path.ends_with(".tar.zst") || path.ends_with(".tzst") {
        ArtifactFormat::TarZst
    } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
        ArtifactFormat::TarGz
    } else if path.ends_with(".tar") {
        ArtifactFormat::Tar
    } else if path.ends_with(".zip") {
        ArtifactFormat::Zip
    } else {
        ArtifactFormat::Binary
    }
}

/// File name for a raw binary: the `#fragment` if present, else the last
/// path segment of the locator.
pub fn binary_name(locator: &str) -> Option<String> {
    if let Some((_, fragment)) = locator.split_once('#') {
        if !fragment.is_empty() && !fragment.contains(['/', '\\']) {
            return Some(fragment.to_string());
        }
    }
    locator_path(locator)
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(ToString::to_string)
}

fn locator_path(locator: &str) -> &str {
    let base = locator.split_once('#').map_or(locator, |(b, _)| b);
    base.split_once('?').map_or(base, |(b, _)| b)
}

/// Unpack `archive` into `dest`.
pub fn extract(
    archive: &Path,
    locator: &str,
    dest: &Path,
    strip: usize,
) -> Result<(), ExtractError> {
    fs::create_dir_all(dest)?;
    match detect_format(locator) {
        ArtifactFormat::TarGz => {
            let reader = BufReader::new(File::open(archive)?);
            extract_tar(flate2::read::GzDecoder::new(reader), dest, strip)
        }
        ArtifactFormat::TarZst => {
            let reader = BufReader::new(File::open(archive)?);
            extract_tar(ZstdDecoder::new(reader)?, dest, strip)
        }
        ArtifactFormat::Tar => extract_tar(BufReader::new(File::open(archive)?), dest, strip),
        ArtifactFormat::Zip => extract_zip(archive, dest, strip),
        ArtifactFormat::Binary => {
            let name = binary_name(locator)
                .ok_or_else(|| ExtractError::Archive(format!("No file name in {locator}")))?;
            let target = dest.join(name);
            fs::copy(archive, &target)?;
            set_mode(&target, 0o755)?;
            Ok(())
        }
    }
}

/// Drop `strip` leading components and reject anything escaping the root.
/// `None` means the entry is consumed entirely by stripping.
fn sanitize(path: &Path, strip: usize) -> Result<Option<PathBuf>, ExtractError> {
    let mut out = PathBuf::new();
    let mut skipped = 0;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                if skipped < strip {
                    skipped += 1;
                } else {
                    out.push(part);
                }
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath(path.display().to_string()));
            }
        }
    }
    Ok((!out.as_os_str().is_empty()).then_some(out))
}

fn extract_tar<R: Read>(reader: R, dest: &Path, strip: usize) -> Result<(), ExtractError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let Some(relative) = sanitize(&entry_path, strip)? else {
            continue;
        };
        let absolute = dest.join(&relative);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&absolute)?;
            continue;
        }
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)?;
        }

        if kind.is_hard_link() {
            // Link targets are archive paths too, so they strip the same way.
            let target = entry
                .link_name()?
                .ok_or_else(|| ExtractError::Archive(format!("Hard link without target: {}", relative.display())))?
                .into_owned();
            let Some(target) = sanitize(&target, strip)? else {
                continue;
            };
            fs::copy(dest.join(target), &absolute)?;
            continue;
        }

        entry.unpack(&absolute)?;
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest: &Path, strip: usize) -> Result<(), ExtractError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ExtractError::Archive(e.to_string()))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;
        let Some(enclosed) = file.enclosed_name() else {
            return Err(ExtractError::UnsafePath(file.name().to_string()));
        };
        let Some(relative) = sanitize(&enclosed, strip)? else {
            continue;
        };
        let absolute = dest.join(&relative);

        if file.is_dir() {
            fs::create_dir_all(&absolute)?;
            continue;
        }
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&absolute)?;
        io::copy(&mut file, &mut out)?;
        if let Some(mode) = file.unix_mode() {
            set_mode(&absolute, mode & 0o7777)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
