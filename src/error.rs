//! Crate-level error aggregation
//!
//! Each component keeps its own error enum. `RelayError` wraps them for
//! callers that only need to classify a failure and map it to a response
//! code for the web collaborator.

use std::io;

use relay_protocol::ProtocolError;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::remote::SyncError;
use crate::state::{StoreError, TransitionError};
use crate::submission::{DirectoryError, LockError};
use crate::update::UpdateError;
use crate::upload::{ArchiveError, ManifestError, MergeError, UploadError};
use crate::worker::WorkerError;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller sent something wrong or out of order
    ClientProtocol,
    /// Data on disk does not match its declared hash
    Integrity,
    /// Store, broker, remote host or filesystem failure
    Infrastructure,
    /// Path escape or script outside its allow-list
    Security,
    /// Programming defect such as an illegal status transition
    Internal,
}

impl ErrorClass {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Infrastructure)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Upload(e) => upload_class(e),
            RelayError::Manifest(e) => manifest_class(e),
            RelayError::Merge(e) => merge_class(e),
            RelayError::Dispatch(e) => dispatch_class(e),
            RelayError::Update(e) => match e {
                UpdateError::UnknownKind(_) | UpdateError::NotEvaluating { .. } => {
                    ErrorClass::ClientProtocol
                }
                UpdateError::Store(e) => store_class(e),
                UpdateError::Lock(e) => lock_class(e),
                UpdateError::Sync(_) | UpdateError::Directory(_) | UpdateError::Busy(_) => {
                    ErrorClass::Infrastructure
                }
            },
            RelayError::Store(e) => store_class(e),
            RelayError::Transition(_) => ErrorClass::Internal,
            RelayError::Lock(e) => lock_class(e),
            RelayError::Directory(e) => directory_class(e),
            RelayError::Protocol(_) => ErrorClass::ClientProtocol,
            RelayError::Config(_) => ErrorClass::Internal,
            RelayError::Worker(WorkerError::PathMismatch { .. } | WorkerError::WrongHost { .. }) => {
                ErrorClass::Internal
            }
            RelayError::Worker(WorkerError::AlreadyRunning(_)) => ErrorClass::ClientProtocol,
            RelayError::Worker(_) | RelayError::Sync(_) | RelayError::Broker(_) | RelayError::Io(_) => {
                ErrorClass::Infrastructure
            }
        }
    }

    /// HTTP-class status code for the web collaborator.
    pub fn status_code(&self) -> u16 {
        match self.class() {
            ErrorClass::ClientProtocol if self.is_not_found() => 404,
            ErrorClass::ClientProtocol if self.is_conflict() => 409,
            ErrorClass::ClientProtocol => 400,
            ErrorClass::Integrity => 422,
            ErrorClass::Security => 403,
            ErrorClass::Infrastructure => 503,
            ErrorClass::Internal => 500,
        }
    }

    fn is_not_found(&self) -> bool {
        match self {
            RelayError::Upload(
                UploadError::PartNotExpected { .. } | UploadError::NotRegistered(_),
            ) => true,
            RelayError::Upload(UploadError::Directory(DirectoryError::NotFound(_)))
            | RelayError::Dispatch(DispatchError::Directory(DirectoryError::NotFound(_)))
            | RelayError::Directory(DirectoryError::NotFound(_)) => true,
            RelayError::Store(e)
            | RelayError::Upload(UploadError::Store(e))
            | RelayError::Dispatch(DispatchError::Store(e))
            | RelayError::Update(UpdateError::Store(e)) => {
                matches!(e, StoreError::NotFound(_) | StoreError::EvaluatorNotFound(_))
            }
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        matches!(
            self,
            RelayError::Upload(
                UploadError::NotAccepting { .. }
                    | UploadError::AlreadyRegistered(_)
                    | UploadError::Lock(LockError::Held(_))
            ) | RelayError::Dispatch(
                DispatchError::AlreadyDispatched(_)
                    | DispatchError::Blocked { .. }
                    | DispatchError::NotDispatchable { .. }
                    | DispatchError::NotEvaluating { .. }
            ) | RelayError::Update(UpdateError::NotEvaluating { .. })
                | RelayError::Lock(LockError::Held(_))
                | RelayError::Directory(DirectoryError::AlreadyExists(_) | DirectoryError::NotTerminal(_))
        )
    }
}

fn lock_class(e: &LockError) -> ErrorClass {
    match e {
        LockError::Held(_) => ErrorClass::ClientProtocol,
        LockError::Io(_) => ErrorClass::Infrastructure,
    }
}

fn directory_class(e: &DirectoryError) -> ErrorClass {
    match e {
        DirectoryError::InvalidId(_)
        | DirectoryError::NotFound(_)
        | DirectoryError::AlreadyExists(_)
        | DirectoryError::NotTerminal(_) => ErrorClass::ClientProtocol,
        DirectoryError::Lock(e) => lock_class(e),
        DirectoryError::Io(_) => ErrorClass::Infrastructure,
    }
}

fn store_class(e: &StoreError) -> ErrorClass {
    match e {
        StoreError::NotFound(_) | StoreError::EvaluatorNotFound(_) => ErrorClass::ClientProtocol,
        StoreError::Transition(_) => ErrorClass::Internal,
        StoreError::Unavailable(_) | StoreError::Io(_) | StoreError::Json(_) => {
            ErrorClass::Infrastructure
        }
    }
}

fn archive_class(e: &ArchiveError) -> ErrorClass {
    match e {
        ArchiveError::UnsafeEntry(_) => ErrorClass::Security,
        ArchiveError::Unsupported(_) => ErrorClass::ClientProtocol,
        ArchiveError::Zip(_) => ErrorClass::Integrity,
        ArchiveError::Io(_) => ErrorClass::Infrastructure,
    }
}

fn manifest_class(e: &ManifestError) -> ErrorClass {
    match e {
        ManifestError::LockTimeout(_) | ManifestError::Io(_) => ErrorClass::Infrastructure,
        ManifestError::Json(_) => ErrorClass::Integrity,
        _ => ErrorClass::ClientProtocol,
    }
}

fn merge_class(e: &MergeError) -> ErrorClass {
    match e {
        MergeError::NotComplete { .. } => ErrorClass::Internal,
        MergeError::PartMissing { .. }
        | MergeError::PartCorrupted { .. }
        | MergeError::MergeIntegrity { .. } => ErrorClass::Integrity,
        MergeError::Extract(e) => match archive_class(e) {
            ErrorClass::Security => ErrorClass::Security,
            ErrorClass::Infrastructure => ErrorClass::Infrastructure,
            _ => ErrorClass::Integrity,
        },
        MergeError::Io(_) => ErrorClass::Infrastructure,
    }
}

fn upload_class(e: &UploadError) -> ErrorClass {
    match e {
        UploadError::PartNotExpected { .. }
        | UploadError::HashMismatch { .. }
        | UploadError::NotAccepting { .. }
        | UploadError::NotRegistered(_)
        | UploadError::AlreadyRegistered(_)
        | UploadError::InvalidName(_)
        | UploadError::InvalidHash(_) => ErrorClass::ClientProtocol,
        UploadError::Manifest(e) => manifest_class(e),
        UploadError::Merge(e) => merge_class(e),
        UploadError::Archive(e) => archive_class(e),
        UploadError::Directory(e) => directory_class(e),
        UploadError::Lock(e) => lock_class(e),
        UploadError::Store(e) => store_class(e),
        UploadError::Io(_) => ErrorClass::Infrastructure,
    }
}

fn dispatch_class(e: &DispatchError) -> ErrorClass {
    match e {
        DispatchError::NotDispatchable { .. }
        | DispatchError::AlreadyDispatched(_)
        | DispatchError::NotEvaluating { .. }
        | DispatchError::NoEvaluator(_)
        | DispatchError::Blocked { .. } => ErrorClass::ClientProtocol,
        DispatchError::ScriptOutsideRoot { .. } => ErrorClass::Security,
        DispatchError::UnknownHost { .. } | DispatchError::ScriptNotFound(_) => ErrorClass::Internal,
        DispatchError::Sync(_) | DispatchError::Broker(_) => ErrorClass::Infrastructure,
        DispatchError::Store(e) => store_class(e),
        DispatchError::Directory(e) => directory_class(e),
        DispatchError::Lock(e) => lock_class(e),
    }
}
