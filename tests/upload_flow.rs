//! Upload flow tests: single-part archives and resumable multi-part uploads
//! through `UploadHandler`, driven the way a client would drive them.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bench_relay::checksum::{self, Algorithm};
use bench_relay::state::{MemoryStore, Submission, SubmissionStatus, SubmissionStore};
use bench_relay::submission::{LockKind, LogFile, SubmissionDirectory, SubmissionInfo};
use bench_relay::upload::{split_archive, PartUploader, UploadError, UploadHandler, UploadManifest};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

struct Fixture {
    root: TempDir,
    store: Arc<MemoryStore>,
    handler: UploadHandler,
}

fn fixture() -> Fixture {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let handler = UploadHandler::new(store.clone());
    Fixture { root, store, handler }
}

impl Fixture {
    fn submissions(&self) -> PathBuf {
        self.root.path().join("subs")
    }

    fn create(&self, id: &str) -> SubmissionDirectory {
        self.store
            .put_submission(&Submission::new(id, "u1", "bench-1", "m1"))
            .unwrap();
        SubmissionDirectory::create(&self.submissions(), &SubmissionInfo::new(id, "u1", "bench-1", "m1"))
            .unwrap()
    }

    fn status(&self, id: &str) -> SubmissionStatus {
        self.store.get_submission(id).unwrap().status
    }
}

/// Deterministic, poorly compressible payload.
fn payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xff) as u8
        })
        .collect()
}

fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}

#[test]
fn test_single_part_ten_megabytes() {
    let f = fixture();
    let dir = f.create("s1");
    let weights = payload(10 * 1024 * 1024);
    let archive = tar_gz(&[("model/weights.bin", &weights), ("model/README", b"hello")]);
    let hash = checksum::hash_bytes(Algorithm::Md5, &archive);

    f.handler.register_single(&dir, &hash).unwrap();
    let progress = f
        .handler
        .add_content(&dir, "model.tar.gz", &archive, Some(&hash.to_uppercase()))
        .unwrap();

    assert!(progress.completed);
    assert_eq!(f.status("s1"), SubmissionStatus::Uploaded);
    assert!(!dir.has_lock(LockKind::Upload));
    let extracted = fs::read(dir.content_dir().join("model/weights.bin")).unwrap();
    assert_eq!(extracted.len(), weights.len());
    assert_eq!(
        checksum::hash_bytes(Algorithm::Md5, &extracted),
        checksum::hash_bytes(Algorithm::Md5, &weights)
    );
    assert!(!dir.path().join("model.tar.gz").exists(), "archive removed after extraction");
}

#[test]
fn test_single_part_corrupt_bytes_rejected_then_accepted() {
    let f = fixture();
    let dir = f.create("s1");
    let archive = tar_gz(&[("a.txt", b"answer")]);
    let hash = checksum::hash_bytes(Algorithm::Md5, &archive);
    f.handler.register_single(&dir, &hash).unwrap();

    let mut corrupt = archive.clone();
    corrupt[10] ^= 0xff;
    let err = f.handler.add_content(&dir, "sub.tar.gz", &corrupt, None).unwrap_err();
    assert!(matches!(err, UploadError::HashMismatch { .. }));
    assert_eq!(f.status("s1"), SubmissionStatus::Uploading);
    assert!(dir.has_lock(LockKind::Upload));

    f.handler.add_content(&dir, "sub.tar.gz", &archive, None).unwrap();
    assert_eq!(fs::read_to_string(dir.content_dir().join("a.txt")).unwrap(), "answer");
}

#[test]
fn test_three_parts_with_bad_second_part_retried() {
    let f = fixture();
    let dir = f.create("s1");
    let scratch = TempDir::new().unwrap();
    let archive = tar_gz(&[("preds.jsonl", &payload(300_000))]);
    let path = write_archive(scratch.path(), "preds.tar.gz", &archive);
    let chunk = (archive.len() as u64 + 2) / 3;
    let plan = split_archive(&path, chunk).unwrap();
    assert_eq!(plan.manifest.parts.len(), 3);

    f.handler.register_multipart(&dir, &plan.manifest).unwrap();

    let mut corrupted_once = false;
    let report = PartUploader::new(3).upload(&plan, &[], |part, bytes| {
        let mut bytes = bytes.to_vec();
        if part.name == "part-0001" && !corrupted_once {
            corrupted_once = true;
            bytes[0] ^= 0xff;
        }
        f.handler
            .add_content(&dir, &part.name, &bytes, Some(&part.hash))
            .map(|_| ())
    });

    assert!(report.is_success(), "failed parts: {:?}", report.failed);
    assert_eq!(report.attempts["part-0000"], 1);
    assert_eq!(report.attempts["part-0001"], 2);
    assert_eq!(report.attempts["part-0002"], 1);
    assert_eq!(f.status("s1"), SubmissionStatus::Uploaded);
    assert!(!dir.has_lock(LockKind::Upload));
    assert_eq!(
        fs::read(dir.content_dir().join("preds.jsonl")).unwrap().len(),
        300_000
    );
}

#[test]
fn test_resume_skips_received_parts() {
    let f = fixture();
    let dir = f.create("s1");
    let scratch = TempDir::new().unwrap();
    let archive = tar_gz(&[("x.bin", &payload(50_000))]);
    let path = write_archive(scratch.path(), "x.tar.gz", &archive);
    let plan = split_archive(&path, 16 * 1024).unwrap();
    f.handler.register_multipart(&dir, &plan.manifest).unwrap();

    // First session dies after one part.
    let first = &plan.manifest.parts[0];
    f.handler
        .add_content(&dir, &first.name, &plan.read_chunk(0).unwrap(), None)
        .unwrap();

    let manifest = UploadManifest::load(&dir.manifest_path()).unwrap();
    let received: Vec<String> = manifest.received.iter().map(|p| p.name.clone()).collect();
    assert_eq!(manifest.remaining_items().len(), plan.manifest.parts.len() - 1);

    let mut sent = Vec::new();
    let report = PartUploader::default().upload(&plan, &received, |part, bytes| {
        sent.push(part.name.clone());
        f.handler.add_content(&dir, &part.name, bytes, None).map(|_| ())
    });

    assert!(report.is_success());
    assert!(!sent.contains(&first.name));
    assert_eq!(f.status("s1"), SubmissionStatus::Uploaded);
}

#[test]
fn test_merge_integrity_failure_sets_error_lock() {
    let f = fixture();
    let dir = f.create("s1");
    let scratch = TempDir::new().unwrap();
    let archive = tar_gz(&[("x.bin", &payload(40_000))]);
    let path = write_archive(scratch.path(), "x.tar.gz", &archive);
    let plan = split_archive(&path, 16 * 1024).unwrap();

    // Whole-archive hash recorded at creation disagrees with the parts.
    let mut manifest = plan.manifest.clone();
    manifest.archive_hash = checksum::hash_bytes(Algorithm::Md5, b"something else");
    f.handler.register_multipart(&dir, &manifest).unwrap();

    let mut last = None;
    for (index, part) in plan.manifest.parts.iter().enumerate() {
        last = Some(f.handler.add_content(&dir, &part.name, &plan.read_chunk(index).unwrap(), None));
    }

    assert!(matches!(last, Some(Err(UploadError::Merge(_)))));
    assert!(dir.has_lock(LockKind::Error));
    assert_eq!(f.status("s1"), SubmissionStatus::Uploading);
    let log = fs::read_to_string(dir.log_path(LogFile::Submission)).unwrap();
    assert!(log.contains("integrity"));

    let err = f
        .handler
        .add_content(&dir, "part-0000", &plan.read_chunk(0).unwrap(), None)
        .unwrap_err();
    assert!(matches!(err, UploadError::NotAccepting { .. }));
}
