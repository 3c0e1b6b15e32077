//! Single- and multi-part submission uploads
//!
//! - [`manifest`]: expected vs. received parts, persisted after every change
//! - [`handler`]: server-side acceptance of part bytes
//! - [`merge`]: verified reconstruction of the archive
//! - [`archive`]: extraction into `content/`
//! - [`client`]: chunking and bounded per-part retries for uploaders

pub mod archive;
pub mod client;
pub mod handler;
pub mod manifest;
pub mod merge;

pub use archive::{ArchiveError, ArchiveFormat};
pub use client::{split_archive, ChunkPlan, ChunkRange, PartUploader, UploadReport};
pub use handler::{UploadError, UploadHandler, UploadProgress};
pub use manifest::{ManifestError, PartEntry, UploadManifest};
pub use merge::{ArchiveMerger, MergeError};
