//! Submission directories, lock files and static metadata

mod directory;
mod info;
mod lock;

pub use directory::{
    DirectoryError, LogFile, SubmissionDirectory, ARCHIVE_HASH_FILE, CONTENT_DIR, MANIFEST_FILE,
    PARTS_DIR,
};
pub use info::SubmissionInfo;
pub use lock::{Lock, LockError, LockGuard, LockKind, LockResult};

use regex_lite::Regex;
use std::sync::OnceLock;

/// Generate a time-ordered submission id with a random suffix.
pub fn new_submission_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Plain file-name check used for submission ids and part names.
pub(crate) fn is_safe_name(name: &str) -> bool {
    static SAFE_NAME: OnceLock<Regex> = OnceLock::new();
    let re = SAFE_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("static regex"));
    name.len() <= 255 && re.is_match(name)
}
