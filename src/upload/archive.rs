//! Archive extraction into a submission's content area.
//!
//! Entries that would land outside the destination (absolute paths, `..`
//! components) abort the extraction instead of being skipped.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use thiserror::Error;

/// Errors from archive extraction
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("unsupported archive type: {0}")]
    Unsupported(String),

    #[error("archive entry escapes destination: {0}")]
    UnsafeEntry(String),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Archive container formats accepted for submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from the archive file name.
    pub fn from_name(name: &str) -> Result<Self, ArchiveError> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Ok(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Ok(ArchiveFormat::Tar)
        } else if lower.ends_with(".zip") {
            Ok(ArchiveFormat::Zip)
        } else {
            Err(ArchiveError::Unsupported(name.to_string()))
        }
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Extract `archive` into `dest`, creating `dest` if needed.
///
/// Returns the number of file entries written.
pub fn extract(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<u64, ArchiveError> {
    fs::create_dir_all(dest)?;
    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::Tar => extract_tar(tar::Archive::new(file), dest),
        ArchiveFormat::TarGz => extract_tar(tar::Archive::new(GzDecoder::new(file)), dest),
        ArchiveFormat::Zip => extract_zip(file, dest),
    }
}

fn extract_tar<R: io::Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<u64, ArchiveError> {
    let mut count = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !is_contained(&path) {
            return Err(ArchiveError::UnsafeEntry(path.display().to_string()));
        }
        if entry.header().entry_type().is_file() {
            count += 1;
        }
        entry.unpack_in(dest)?;
    }
    Ok(count)
}

fn extract_zip<R: io::Read + io::Seek>(reader: R, dest: &Path) -> Result<u64, ArchiveError> {
    let mut archive = zip::ZipArchive::new(reader)?;
    let mut count = 0u64;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let relative = match file.enclosed_name() {
            Some(path) if is_contained(&path) => path,
            _ => return Err(ArchiveError::UnsafeEntry(file.name().to_string())),
        };
        let out_path = dest.join(relative);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut file, &mut out)?;
        count += 1;
    }
    Ok(count)
}
