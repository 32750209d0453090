//! Backend adapters.
//!
//! Every provider implements [`BlobStore`] over abstract keys:
//!
//! - blobs: `blobs/<algorithm>/<hex>`
//! - manifests: `manifests/<repository>/<tag>` or
//!   `manifests/<repository>/<algorithm>:<hex>`
//!
//! Adapters translate keys into their provider's addressing, normalize
//! provider errors into [`StorageError`] and never retry.

mod azure;
mod azure_sas;
mod gcs;
mod memory;
mod ops;
mod s3;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ocispec::OciDigest;
use opendal::ErrorKind;
use thiserror::Error;

use crate::error::{AppError, Result};
use crate::validate::BackendConfig;

pub use azure::AzureStore;
pub use gcs::GcsStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

/// Provider failures, normalized across backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("access denied: {0}")]
    Auth(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl StorageError {
    /// Throttling and transient network failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Throttled(_) | StorageError::Transient(_))
    }
}

/// Uniform content-addressed storage operations.
///
/// `put` must be idempotent: writing identical bytes to a key twice is
/// indistinguishable from writing them once.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Native address of `key`, for diagnostics
    fn locate(&self, key: &str) -> String;

    async fn exists(&self, key: &str) -> std::result::Result<bool, StorageError>;

    async fn get(&self, key: &str) -> std::result::Result<Bytes, StorageError>;

    async fn put(&self, key: &str, content: Bytes) -> std::result::Result<(), StorageError>;

    /// Keys of every object below `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError>;

    async fn delete(&self, key: &str) -> std::result::Result<(), StorageError>;
}

/// Open a session against the bucket or container named `location`.
pub fn open_store(config: &BackendConfig, location: &str) -> Result<Arc<dyn BlobStore>> {
    let backend = config.backend();
    let configure_error =
        |err: opendal::Error| AppError::Config(format!("Failed to configure {} storage: {}", backend, err));

    let store: Arc<dyn BlobStore> = match config {
        BackendConfig::S3(s3) => Arc::new(S3Store::new(s3, location).map_err(configure_error)?),
        BackendConfig::Gcs(gcs) => Arc::new(GcsStore::new(gcs, location).map_err(configure_error)?),
        BackendConfig::Azure(azure) => {
            Arc::new(AzureStore::new(azure, location).map_err(configure_error)?)
        }
    };
    Ok(store)
}

pub fn blob_key(digest: &OciDigest) -> String {
    format!("blobs/{}/{}", digest.algorithm(), digest.hex())
}

pub fn manifest_key(repository: &str, reference: &str) -> String {
    format!("manifests/{}/{}", repository, reference)
}

pub fn manifest_prefix(repository: &str) -> String {
    format!("manifests/{}/", repository)
}

/// Provider-specific error codes that opendal reports as generic failures.
pub(crate) struct ProviderSignals {
    pub throttled: &'static [&'static str],
    pub auth: &'static [&'static str],
}

/// Map an opendal error into the shared taxonomy, consulting the
/// provider's own error codes first.
pub(crate) fn classify(err: &opendal::Error, signals: &ProviderSignals) -> StorageError {
    let message = err.to_string();

    if err.kind() == ErrorKind::NotFound {
        return StorageError::NotFound;
    }
    if signals.auth.iter().any(|code| message.contains(code)) {
        return StorageError::Auth(message);
    }
    if signals.throttled.iter().any(|code| message.contains(code)) {
        return StorageError::Throttled(message);
    }

    match err.kind() {
        ErrorKind::RateLimited => StorageError::Throttled(message),
        ErrorKind::PermissionDenied => StorageError::Auth(message),
        _ if err.is_temporary() => StorageError::Transient(message),
        _ => StorageError::Fatal(message),
    }
}

/// Join an optional root directory and a key into an object name.
pub(crate) fn object_name(root: Option<&str>, key: &str) -> String {
    match root.map(|r| r.trim_matches('/')).filter(|r| !r.is_empty()) {
        Some(root) => format!("{}/{}", root, key),
        None => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNALS: ProviderSignals = ProviderSignals {
        throttled: &["SlowDown"],
        auth: &["InvalidAccessKeyId"],
    };

    #[test]
    fn test_keys() {
        let digest = OciDigest::compute(b"hello");
        assert_eq!(
            blob_key(&digest),
            "blobs/sha256/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(manifest_key("team/app", "v1"), "manifests/team/app/v1");
        assert_eq!(manifest_prefix("team/app"), "manifests/team/app/");
    }

    #[test]
    fn test_classify_kinds() {
        let not_found = opendal::Error::new(ErrorKind::NotFound, "missing");
        assert_eq!(classify(&not_found, &SIGNALS), StorageError::NotFound);

        let denied = opendal::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(matches!(classify(&denied, &SIGNALS), StorageError::Auth(_)));

        let limited = opendal::Error::new(ErrorKind::RateLimited, "slow");
        assert!(classify(&limited, &SIGNALS).is_retryable());

        let flaky = opendal::Error::new(ErrorKind::Unexpected, "connection reset").set_temporary();
        assert!(matches!(classify(&flaky, &SIGNALS), StorageError::Transient(_)));

        let broken = opendal::Error::new(ErrorKind::Unexpected, "bad response");
        let classified = classify(&broken, &SIGNALS);
        assert!(matches!(classified, StorageError::Fatal(_)));
        assert!(!classified.is_retryable());
    }

    #[test]
    fn test_classify_provider_codes() {
        let slow = opendal::Error::new(ErrorKind::Unexpected, "<Code>SlowDown</Code>");
        assert!(matches!(classify(&slow, &SIGNALS), StorageError::Throttled(_)));

        // Provider auth codes win even when opendal marks the error temporary
        let key = opendal::Error::new(ErrorKind::Unexpected, "InvalidAccessKeyId").set_temporary();
        assert!(matches!(classify(&key, &SIGNALS), StorageError::Auth(_)));
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name(None, "blobs/sha256/ab"), "blobs/sha256/ab");
        assert_eq!(object_name(Some("/registry/"), "blobs/sha256/ab"), "registry/blobs/sha256/ab");
        assert_eq!(object_name(Some(""), "k"), "k");
    }
}
