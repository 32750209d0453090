use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ocispec::models::{MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP};
use ocispec::serialize_manifest;

use ocistore::config::{StorageBackend, TransferSettings};
use ocistore::error::{AppError, Result};
use ocistore::layout::{self, Blob, LocalImage};
use ocistore::operations::{
    delete_image_with, list_tags_with, pull_image_with, push_image_with, ImageSource, PullRequest,
    PushRequest,
};
use ocistore::storage::{blob_key, manifest_key, BlobStore, MemoryStore, StorageError};
use ocistore::transfer::{JobState, OperationError, PulledImage, PushReport};
use ocistore::validate::{BackendConfig, RawBackendConfig};

// Memory store that counts writes and injects provider failures
#[derive(Debug)]
struct InstrumentedStore {
    inner: MemoryStore,
    puts: AtomicUsize,
    throttle_puts: AtomicUsize,
    deny_blob_puts: AtomicBool,
}

impl InstrumentedStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new().unwrap(),
            puts: AtomicUsize::new(0),
            throttle_puts: AtomicUsize::new(0),
            deny_blob_puts: AtomicBool::new(false),
        })
    }

    fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for InstrumentedStore {
    fn locate(&self, key: &str) -> String {
        self.inner.locate(key)
    }

    async fn exists(&self, key: &str) -> std::result::Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> std::result::Result<Bytes, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, content: Bytes) -> std::result::Result<(), StorageError> {
        if key.starts_with("blobs/") && self.deny_blob_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Auth("AccessDenied".to_string()));
        }
        let throttled = self
            .throttle_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(StorageError::Throttled("SlowDown".to_string()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, content).await
    }

    async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

fn settings() -> TransferSettings {
    TransferSettings {
        concurrency: 3,
        max_attempts: 4,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
    }
}

fn s3_config() -> RawBackendConfig {
    RawBackendConfig {
        region: Some("us-east-1".to_string()),
        ..Default::default()
    }
}

fn sample_image() -> LocalImage {
    LocalImage::new(
        Blob::new(MEDIA_TYPE_OCI_CONFIG, &b"{\"architecture\":\"amd64\",\"os\":\"linux\"}"[..]),
        vec![
            Blob::new(MEDIA_TYPE_OCI_LAYER_GZIP, &b"base layer"[..]),
            Blob::new(MEDIA_TYPE_OCI_LAYER_GZIP, &b"app layer"[..]),
        ],
    )
}

async fn push(store: &Arc<InstrumentedStore>, reference: &str, image: LocalImage) -> Result<PushReport> {
    let request = PushRequest {
        backend: StorageBackend::S3,
        config: s3_config(),
        reference: reference.to_string(),
        source: ImageSource::Image(image),
    };
    push_image_with(request, &settings(), |_: &BackendConfig, _: &str| {
        Ok(Arc::clone(store) as Arc<dyn BlobStore>)
    })
    .await
}

async fn pull(store: &Arc<InstrumentedStore>, reference: &str) -> Result<PulledImage> {
    let request = PullRequest {
        backend: StorageBackend::S3,
        config: s3_config(),
        reference: reference.to_string(),
    };
    pull_image_with(request, &settings(), |_: &BackendConfig, _: &str| {
        Ok(Arc::clone(store) as Arc<dyn BlobStore>)
    })
    .await
}

async fn tags(store: &Arc<InstrumentedStore>, repository: &str) -> Vec<String> {
    list_tags_with(StorageBackend::S3, &s3_config(), repository, &settings(), |_: &BackendConfig, _: &str| {
        Ok(Arc::clone(store) as Arc<dyn BlobStore>)
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_push_then_pull_round_trip() {
    let store = InstrumentedStore::new();
    let image = sample_image();

    let report = push(&store, "bucket/team/app:v1", image.clone()).await.unwrap();
    assert_eq!(report.uploaded.len(), 3);
    assert!(report.skipped.is_empty());

    let pulled = pull(&store, "bucket/team/app:v1").await.unwrap();
    assert_eq!(pulled.manifest_digest, report.manifest_digest);
    assert_eq!(pulled.config, image.config.data);
    assert_eq!(
        pulled.layers,
        image.layers.iter().map(|b| b.data.clone()).collect::<Vec<_>>()
    );

    // The same manifest is reachable by digest
    let by_digest = format!("bucket/team/app@{}", report.manifest_digest);
    let pulled_by_digest = pull(&store, &by_digest).await.unwrap();
    assert_eq!(pulled_by_digest.manifest_bytes, pulled.manifest_bytes);
}

#[tokio::test]
async fn test_repush_uploads_no_blobs() {
    let store = InstrumentedStore::new();
    push(&store, "bucket/app:v1", sample_image()).await.unwrap();
    let before = store.puts();

    let report = push(&store, "bucket/app:v1", sample_image()).await.unwrap();
    assert!(report.uploaded.is_empty());
    assert_eq!(report.skipped.len(), 3);
    // Only the digest and tag manifest entries are rewritten
    assert_eq!(store.puts() - before, 2);
}

#[tokio::test]
async fn test_shared_layers_upload_once() {
    let store = InstrumentedStore::new();
    let layer = Blob::new(MEDIA_TYPE_OCI_LAYER_GZIP, &b"same bytes"[..]);
    let image = LocalImage::new(
        Blob::new(MEDIA_TYPE_OCI_CONFIG, &b"{}"[..]),
        vec![layer.clone(), layer],
    );

    let report = push(&store, "bucket/app:dup", image).await.unwrap();
    assert_eq!(report.uploaded.len(), 2);

    let pulled = pull(&store, "bucket/app:dup").await.unwrap();
    assert_eq!(pulled.layers.len(), 2);
    assert_eq!(pulled.layers[0], pulled.layers[1]);
}

#[tokio::test]
async fn test_concurrent_pushes_both_succeed() {
    let store = InstrumentedStore::new();

    let (first, second) = tokio::join!(
        push(&store, "bucket/app:v1", sample_image()),
        push(&store, "bucket/app:v1", sample_image())
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.manifest_digest, second.manifest_digest);

    let pulled = pull(&store, "bucket/app:v1").await.unwrap();
    assert_eq!(pulled.manifest_digest, first.manifest_digest);
}

#[tokio::test]
async fn test_tampered_blob_fails_pull() {
    let store = InstrumentedStore::new();
    let image = sample_image();
    push(&store, "bucket/app:v1", image.clone()).await.unwrap();

    let layer = image.layers[1].descriptor();
    store
        .inner
        .put(&blob_key(&layer.digest), Bytes::from_static(b"tampered"))
        .await
        .unwrap();

    let err = pull(&store, "bucket/app:v1").await.unwrap_err();
    assert!(err.digest_mismatch().is_some(), "{:?}", err);
    match err {
        AppError::Transfer(failure) => assert_eq!(failure.state, JobState::FetchingBlobs),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_tampered_manifest_fails_pull_by_digest() {
    let store = InstrumentedStore::new();
    let report = push(&store, "bucket/app:v1", sample_image()).await.unwrap();

    let digest_key = manifest_key("app", &report.manifest_digest.to_string());
    let mut bytes = store.inner.get(&digest_key).await.unwrap().to_vec();
    bytes.push(b' ');
    store.inner.put(&digest_key, Bytes::from(bytes)).await.unwrap();

    let reference = format!("bucket/app@{}", report.manifest_digest);
    let err = pull(&store, &reference).await.unwrap_err();
    let mismatch = err.digest_mismatch().expect("digest mismatch");
    assert_eq!(mismatch.expected, report.manifest_digest);
    assert_eq!(mismatch.expected_size, None);
    match err {
        AppError::Transfer(failure) => assert_eq!(failure.state, JobState::FetchingManifest),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_tag_without_digest_copy_fails_pull() {
    let store = InstrumentedStore::new();
    push(&store, "bucket/app:v1", sample_image()).await.unwrap();

    // Repoint the tag at a manifest that was never pushed
    let other = LocalImage::new(
        Blob::new(MEDIA_TYPE_OCI_CONFIG, &b"{\"os\":\"windows\"}"[..]),
        vec![Blob::new(MEDIA_TYPE_OCI_LAYER_GZIP, &b"other layer"[..])],
    );
    let (bytes, digest) = serialize_manifest(&other.manifest()).unwrap();
    store.inner.put(&manifest_key("app", "v1"), bytes).await.unwrap();

    let err = pull(&store, "bucket/app:v1").await.unwrap_err();
    match err {
        AppError::Transfer(failure) => {
            assert_eq!(failure.state, JobState::FetchingManifest);
            match &failure.failures[0].cause {
                OperationError::UncommittedManifest { digest: uncommitted } => {
                    assert_eq!(*uncommitted, digest)
                }
                other => panic!("unexpected cause {:?}", other),
            }
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_throttling_is_retried() {
    let store = InstrumentedStore::new();
    store.throttle_puts.store(2, Ordering::SeqCst);

    let report = push(&store, "bucket/app:v1", sample_image()).await.unwrap();
    assert_eq!(report.uploaded.len(), 3);
    assert_eq!(store.throttle_puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exhausted_retries_name_the_key() {
    let store = InstrumentedStore::new();
    store.throttle_puts.store(1_000, Ordering::SeqCst);

    let err = push(&store, "bucket/app:v1", sample_image()).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("after 4 attempts"), "{}", message);
    assert!(message.contains("memory:///blobs/sha256/"), "{}", message);
}

#[tokio::test]
async fn test_blob_failure_never_commits_manifest() {
    let store = InstrumentedStore::new();
    store.deny_blob_puts.store(true, Ordering::SeqCst);
    let image = sample_image();

    let err = push(&store, "bucket/app:v1", image.clone()).await.unwrap_err();
    match &err {
        AppError::Transfer(failure) => {
            assert_eq!(failure.state, JobState::TransferringBlobs);
            assert!(matches!(failure.storage_error(), Some(StorageError::Auth(_))));
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert!(!store.inner.exists(&manifest_key("app", "v1")).await.unwrap());
    assert!(tags(&store, "bucket/app").await.is_empty());
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_push_by_digest_must_match() {
    let store = InstrumentedStore::new();
    let reference = format!("bucket/app@sha256:{}", "0".repeat(64));

    let err = push(&store, &reference, sample_image()).await.unwrap_err();
    assert!(matches!(err, AppError::DigestMismatch { .. }), "{:?}", err);
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_pull_missing_manifest() {
    let store = InstrumentedStore::new();
    let err = pull(&store, "bucket/app:missing").await.unwrap_err();
    match err {
        AppError::Transfer(failure) => {
            assert_eq!(failure.state, JobState::FetchingManifest);
            assert_eq!(failure.storage_error(), Some(&StorageError::NotFound));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_tags_and_delete() {
    let store = InstrumentedStore::new();
    push(&store, "bucket/team/app:v1", sample_image()).await.unwrap();
    push(&store, "bucket/team/app:v2", sample_image()).await.unwrap();
    push(&store, "bucket/team/app/nested:v3", sample_image()).await.unwrap();

    assert_eq!(tags(&store, "bucket/team/app").await, vec!["v1", "v2"]);

    delete_image_with(
        StorageBackend::S3,
        &s3_config(),
        "bucket/team/app:v1",
        &settings(),
        |_: &BackendConfig, _: &str| Ok(Arc::clone(&store) as Arc<dyn BlobStore>),
    )
    .await
    .unwrap();

    assert_eq!(tags(&store, "bucket/team/app").await, vec!["v2"]);
    assert!(pull(&store, "bucket/team/app:v1").await.is_err());
    // Shared blobs stay for the remaining tag
    pull(&store, "bucket/team/app:v2").await.unwrap();
}

#[tokio::test]
async fn test_push_from_layout_directory() {
    let store = InstrumentedStore::new();
    let report = push(&store, "bucket/app:v1", sample_image()).await.unwrap();
    let pulled = pull(&store, "bucket/app:v1").await.unwrap();

    let scratch = tempfile::tempdir().unwrap();
    let dir = scratch.path().join("app");
    layout::write_image(&dir, &pulled, Some("v1")).await.unwrap();

    let request = PushRequest {
        backend: StorageBackend::S3,
        config: s3_config(),
        reference: "bucket/copy:v1".to_string(),
        source: ImageSource::Layout {
            path: Some(dir),
            tag: None,
        },
    };
    let copied = push_image_with(request, &settings(), |_: &BackendConfig, _: &str| {
        Ok(Arc::clone(&store) as Arc<dyn BlobStore>)
    })
    .await
    .unwrap();

    assert_eq!(copied.manifest_digest, report.manifest_digest);
    assert!(copied.uploaded.is_empty());
}
