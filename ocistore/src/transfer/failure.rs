use std::error::Error;
use std::fmt;

use ocispec::{DigestMismatch, ManifestError, OciDigest};
use thiserror::Error;
use uuid::Uuid;

use super::job::JobState;
use crate::storage::StorageError;

/// Storage operation a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CheckBlob,
    UploadBlob,
    FetchBlob,
    FetchManifest,
    CommitManifest,
    ListManifests,
    DeleteManifest,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CheckBlob => "check blob",
            Operation::UploadBlob => "upload blob",
            Operation::FetchBlob => "fetch blob",
            Operation::FetchManifest => "fetch manifest",
            Operation::CommitManifest => "commit manifest",
            Operation::ListManifests => "list manifests",
            Operation::DeleteManifest => "delete manifest",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    /// Failures that are never retried (auth, not found, fatal)
    #[error(transparent)]
    Storage(StorageError),

    #[error("fatal transfer error after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StorageError },

    #[error(transparent)]
    DigestMismatch(#[from] DigestMismatch),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A tag resolved to a manifest that is not stored under its digest
    #[error("manifest {digest} is not committed under its digest")]
    UncommittedManifest { digest: OciDigest },

    #[error("transfer task ended unexpectedly: {0}")]
    Task(String),
}

impl OperationError {
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            OperationError::Storage(err) => Some(err),
            OperationError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

/// One failed storage operation, naming the key it was working on.
#[derive(Debug, Error)]
#[error("failed to {operation} {key}: {cause}")]
pub struct OperationFailure {
    pub operation: Operation,
    pub key: String,
    pub cause: OperationError,
}

impl OperationFailure {
    pub fn new(operation: Operation, key: impl Into<String>, cause: OperationError) -> Self {
        Self {
            operation,
            key: key.into(),
            cause,
        }
    }
}

/// Every failure observed by a job before it stopped, plus the keys it
/// had already transferred.
#[derive(Debug)]
pub struct JobFailure {
    pub job_id: Uuid,
    /// State the job was in when it failed
    pub state: JobState,
    pub failures: Vec<OperationFailure>,
    pub completed: Vec<String>,
}

impl JobFailure {
    pub fn digest_mismatch(&self) -> Option<&DigestMismatch> {
        self.failures.iter().find_map(|failure| match &failure.cause {
            OperationError::DigestMismatch(mismatch) => Some(mismatch),
            _ => None,
        })
    }

    pub fn storage_error(&self) -> Option<&StorageError> {
        self.failures.iter().find_map(|failure| failure.cause.storage())
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer job {} failed while {}", self.job_id, self.state)?;
        if let Some(first) = self.failures.first() {
            write!(f, ": {}", first)?;
        }
        if self.failures.len() > 1 {
            write!(f, " (and {} more)", self.failures.len() - 1)?;
        }
        if !self.completed.is_empty() {
            write!(f, "; {} object(s) already transferred", self.completed.len())?;
        }
        Ok(())
    }
}

impl Error for JobFailure {}
