//! Archive reconstruction from verified parts
//!
//! Parts are re-verified before concatenation, the merged file is checked
//! against the merge hash, and only then is it extracted. On any integrity
//! failure the staging area is left untouched for inspection.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::archive::{self, ArchiveError, ArchiveFormat};
use super::manifest::UploadManifest;
use crate::checksum::{self, Algorithm};

/// Errors from merging parts.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("manifest is not complete: {remaining} part(s) outstanding")]
    NotComplete { remaining: usize },

    #[error("part {name} missing from staging area")]
    PartMissing { name: String },

    #[error("part {name} corrupted on disk: expected {expected}, got {actual}")]
    PartCorrupted {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("merged archive hash mismatch: expected {expected}, got {actual}")]
    MergeIntegrity { expected: String, actual: String },

    #[error("extraction failed: {0}")]
    Extract(#[from] ArchiveError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MergeError {
    /// Integrity failures leave the submission in the error-lock state.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            MergeError::PartMissing { .. }
                | MergeError::PartCorrupted { .. }
                | MergeError::MergeIntegrity { .. }
        )
    }
}

/// Reconstructs and extracts multi-part uploads.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveMerger;

impl ArchiveMerger {
    pub fn new() -> Self {
        Self
    }

    /// Merge a completed manifest's parts from `staging_dir` and extract
    /// the archive into `target_dir`. Deletes `staging_dir` on success and
    /// returns `target_dir`.
    pub fn merge(
        &self,
        manifest: &UploadManifest,
        staging_dir: &Path,
        target_dir: &Path,
    ) -> Result<PathBuf, MergeError> {
        if !manifest.completed() {
            return Err(MergeError::NotComplete {
                remaining: manifest.remaining_items().len(),
            });
        }
        let format = ArchiveFormat::from_name(&manifest.archive)?;

        self.verify_parts(manifest, staging_dir)?;
        let merged = self.concatenate(manifest, staging_dir)?;

        let partial = target_dir.with_extension("partial");
        if partial.exists() {
            fs::remove_dir_all(&partial)?;
        }
        if let Err(e) = archive::extract(&merged, format, &partial) {
            let _ = fs::remove_dir_all(&partial);
            let _ = fs::remove_file(&merged);
            return Err(e.into());
        }
        if target_dir.exists() {
            fs::remove_dir_all(target_dir)?;
        }
        fs::rename(&partial, target_dir)?;

        fs::remove_dir_all(staging_dir)?;
        tracing::info!(
            archive = %manifest.archive,
            parts = manifest.parts.len(),
            bytes = manifest.total_size(),
            "Merged and extracted multi-part upload"
        );
        Ok(target_dir.to_path_buf())
    }

    fn verify_parts(&self, manifest: &UploadManifest, staging_dir: &Path) -> Result<(), MergeError> {
        for part in &manifest.parts {
            let path = staging_dir.join(&part.name);
            if !path.is_file() {
                return Err(MergeError::PartMissing {
                    name: part.name.clone(),
                });
            }
            if let Err(actual) = checksum::verify_file(&path, &part.hash)? {
                return Err(MergeError::PartCorrupted {
                    name: part.name.clone(),
                    expected: part.hash.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Check the whole-archive hash over the parts, then concatenate them
    /// in manifest order.
    fn concatenate(&self, manifest: &UploadManifest, staging_dir: &Path) -> Result<PathBuf, MergeError> {
        let expected = manifest.merge_target();
        let algorithm = Algorithm::from_hex(expected).unwrap_or_default();
        let parts: Vec<PathBuf> = manifest
            .parts
            .iter()
            .map(|part| staging_dir.join(&part.name))
            .collect();

        let actual = checksum::hash_files(algorithm, &parts)?;
        if !checksum::digests_match(expected, &actual) {
            return Err(MergeError::MergeIntegrity {
                expected: expected.to_string(),
                actual,
            });
        }

        let merged = staging_dir.join(format!("{}.merged", manifest.archive));
        let mut out = BufWriter::new(File::create(&merged)?);
        for part in &parts {
            io::copy(&mut BufReader::new(File::open(part)?), &mut out)?;
        }
        out.flush()?;
        Ok(merged)
    }
}
