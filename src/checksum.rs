//! Content hashing
//!
//! Every integrity check in the relay goes through this module: per-part
//! verification, whole-archive verification after merge, and the
//! single-part `archive.hash` check. MD5 is the default because existing
//! submission directories and manifests carry MD5 hex digests; SHA-256 is
//! available for callers that record their own hashes.

use sha2::Sha256;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Read buffer for streaming hashes.
const BUFFER_SIZE: usize = 64 * 1024;

/// Digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Md5,
    Sha256,
}

impl Algorithm {
    /// Length of the lower-case hex digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Md5 => 32,
            Algorithm::Sha256 => 64,
        }
    }

    /// Detect the algorithm from a hex digest's length.
    pub fn from_hex(digest: &str) -> Option<Self> {
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match digest.len() {
            32 => Some(Algorithm::Md5),
            64 => Some(Algorithm::Sha256),
            _ => None,
        }
    }
}

/// Incremental hasher over either algorithm.
pub struct Hasher {
    inner: HasherInner,
}

enum HasherInner {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl Hasher {
    /// Start a new digest.
    pub fn new(algorithm: Algorithm) -> Self {
        let inner = match algorithm {
            Algorithm::Md5 => HasherInner::Md5(md5::Context::new()),
            Algorithm::Sha256 => HasherInner::Sha256(<Sha256 as sha2::Digest>::new()),
        };
        Self { inner }
    }

    /// Feed bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Md5(ctx) => ctx.consume(data),
            HasherInner::Sha256(h) => sha2::Digest::update(h, data),
        }
    }

    /// Feed everything from a reader.
    pub fn update_reader<R: Read>(&mut self, mut reader: R) -> io::Result<u64> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            self.update(&buffer[..n]);
            total += n as u64;
        }
        Ok(total)
    }

    /// Finish and return the lower-case hex digest.
    pub fn finalize_hex(self) -> String {
        match self.inner {
            HasherInner::Md5(ctx) => format!("{:x}", ctx.compute()),
            HasherInner::Sha256(h) => hex::encode(sha2::Digest::finalize(h)),
        }
    }
}

/// Hash a byte slice.
pub fn hash_bytes(algorithm: Algorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Hash a file by streaming it.
pub fn hash_file(algorithm: Algorithm, path: &Path) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    hasher.update_reader(BufReader::new(File::open(path)?))?;
    Ok(hasher.finalize_hex())
}

/// Hash the ordered concatenation of several files without materializing it.
pub fn hash_files<P: AsRef<Path>>(algorithm: Algorithm, paths: &[P]) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    for path in paths {
        hasher.update_reader(BufReader::new(File::open(path.as_ref())?))?;
    }
    Ok(hasher.finalize_hex())
}

/// Compare two hex digests, ignoring case.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Hash a file and compare it with an expected digest.
///
/// The algorithm is taken from the expected digest's length.
/// Returns the computed digest on mismatch.
pub fn verify_file(path: &Path, expected: &str) -> io::Result<Result<(), String>> {
    let algorithm = Algorithm::from_hex(expected.trim()).unwrap_or_default();
    let actual = hash_file(algorithm, path)?;
    if digests_match(expected, &actual) {
        Ok(Ok(()))
    } else {
        Ok(Err(actual))
    }
}
