//! Client side of resumable multi-part uploads
//!
//! The archive is split into fixed-size chunks, each hashed on its own.
//! `PartUploader` sends the parts still outstanding, retrying each one
//! independently up to a bounded count before giving up on it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::manifest::{ManifestError, PartEntry, UploadManifest};
use crate::checksum::{self, Algorithm, Hasher};

/// Byte range of one chunk inside the local archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub offset: u64,
    pub len: u64,
}

/// A split archive: the manifest to register and where each part lives.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub archive_path: PathBuf,
    pub manifest: UploadManifest,
    /// Ranges in manifest order
    pub chunks: Vec<ChunkRange>,
}

impl ChunkPlan {
    /// Read one part's bytes from the archive.
    pub fn read_chunk(&self, index: usize) -> io::Result<Vec<u8>> {
        let range = self.chunks.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no chunk at index {}", index))
        })?;
        let mut file = File::open(&self.archive_path)?;
        file.seek(SeekFrom::Start(range.offset))?;
        let mut buf = vec![0u8; range.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Split `path` into `chunk_size` parts named `part-0000`, `part-0001`, ...
///
/// The archive file name becomes the manifest's archive name.
pub fn split_archive(path: &Path, chunk_size: u64) -> Result<ChunkPlan, ManifestError> {
    if chunk_size == 0 {
        return Err(ManifestError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "chunk size must be positive",
        )));
    }
    let archive = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut file = File::open(path)?;
    let mut whole = Hasher::new(Algorithm::Md5);
    let mut parts = Vec::new();
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; chunk_size as usize];
    let mut offset = 0u64;

    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        let data = &buf[..n];
        whole.update(data);
        let name = format!("part-{:04}", parts.len());
        parts.push(PartEntry::new(name, n as u64, checksum::hash_bytes(Algorithm::Md5, data)));
        chunks.push(ChunkRange {
            offset,
            len: n as u64,
        });
        offset += n as u64;
    }

    let manifest = UploadManifest::new(archive, whole.finalize_hex(), parts)?;
    Ok(ChunkPlan {
        archive_path: path.to_path_buf(),
        manifest,
        chunks,
    })
}

/// Fill `buf` as far as the reader allows.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Result of one upload session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Parts accepted by the server
    pub uploaded: Vec<String>,
    /// Parts that exhausted their retries
    pub failed: Vec<String>,
    /// Attempts made per part
    pub attempts: BTreeMap<String, u32>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sends parts with a bounded number of attempts each.
#[derive(Debug, Clone, Copy)]
pub struct PartUploader {
    max_retries: u32,
}

impl Default for PartUploader {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl PartUploader {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Upload every part of `plan` not listed in `already_received`.
    ///
    /// Parts are attempted round-robin, so one stubborn part never blocks
    /// the others. A part is marked failed after `1 + max_retries` attempts.
    pub fn upload<E, F>(&self, plan: &ChunkPlan, already_received: &[String], mut send: F) -> UploadReport
    where
        E: fmt::Display,
        F: FnMut(&PartEntry, &[u8]) -> Result<(), E>,
    {
        let mut report = UploadReport::default();
        let mut pending: Vec<usize> = plan
            .manifest
            .parts
            .iter()
            .enumerate()
            .filter(|(_, p)| !already_received.contains(&p.name))
            .map(|(i, _)| i)
            .collect();

        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for index in pending {
                let part = &plan.manifest.parts[index];
                let attempts = report.attempts.entry(part.name.clone()).or_insert(0);
                *attempts += 1;
                let attempt = *attempts;

                let outcome = plan
                    .read_chunk(index)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| send(part, &bytes).map_err(|e| e.to_string()));

                match outcome {
                    Ok(()) => report.uploaded.push(part.name.clone()),
                    Err(reason) if attempt > self.max_retries => {
                        tracing::warn!(part = %part.name, attempts = attempt, error = %reason, "Giving up on part");
                        report.failed.push(part.name.clone());
                    }
                    Err(reason) => {
                        tracing::debug!(part = %part.name, attempt, error = %reason, "Part upload failed; will retry");
                        still_pending.push(index);
                    }
                }
            }
            pending = still_pending;
        }
        report
    }
}
