//! Transfer engine: moves images between local bytes and a [`BlobStore`].
//!
//! Blobs go through a bounded worker pool. The manifest is written only
//! after every blob it references is known to be present, so a failed push
//! never leaves a reachable manifest pointing at missing content.

mod failure;
mod job;
mod pool;
mod retry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use ocispec::{parse_manifest, serialize_manifest, Descriptor, DigestMismatch, ImageManifest, OciDigest};
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub use failure::{JobFailure, Operation, OperationError, OperationFailure};
pub use job::{Direction, JobState, TransferJob};
pub use retry::RetryPolicy;

use crate::config::TransferSettings;
use crate::error::{AppError, Result};
use crate::layout::LocalImage;
use crate::reference::{ImageReference, RepositoryReference};
use crate::storage::{blob_key, manifest_key, BlobStore};

/// Outcome of a successful push.
#[derive(Debug, Clone)]
pub struct PushReport {
    pub job_id: Uuid,
    pub reference: ImageReference,
    pub manifest_digest: OciDigest,
    /// Blobs written by this job
    pub uploaded: Vec<OciDigest>,
    /// Blobs that were already present
    pub skipped: Vec<OciDigest>,
}

/// A fully fetched and verified image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    pub manifest: ImageManifest,
    pub manifest_digest: OciDigest,
    /// Manifest exactly as stored
    pub manifest_bytes: Bytes,
    pub config: Bytes,
    /// Layer contents in manifest order
    pub layers: Vec<Bytes>,
}

struct BlobUpload {
    digest: OciDigest,
    uploaded: bool,
}

/// Runs push and pull jobs against one storage session.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn BlobStore>, settings: &TransferSettings) -> Self {
        Self::with_policy(store, settings.retry_policy(), settings.concurrency)
    }

    pub fn with_policy(store: Arc<dyn BlobStore>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            store,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload every missing blob of `image`, then commit its manifest.
    ///
    /// `job` must have finished parsing the reference.
    #[instrument(skip(self, job, image), fields(job_id = %job.id()))]
    pub async fn push(
        &self,
        job: &mut TransferJob,
        reference: &ImageReference,
        image: &LocalImage,
    ) -> Result<PushReport> {
        let manifest = image.manifest();
        let (manifest_bytes, manifest_digest) =
            serialize_manifest(&manifest).map_err(|err| job.fail(err.into()))?;

        // A digest reference must name exactly the manifest we are about to write
        if let Some(expected) = reference.digest() {
            if *expected != manifest_digest {
                return Err(job.fail(AppError::DigestMismatch {
                    key: reference.manifest_key(),
                    source: DigestMismatch {
                        expected: expected.clone(),
                        expected_size: None,
                        actual: manifest_digest,
                        actual_size: manifest_bytes.len() as u64,
                    },
                }));
            }
        }

        job.advance(JobState::TransferringBlobs)?;

        let mut seen = HashSet::new();
        let blobs: Vec<(OciDigest, Bytes)> = manifest
            .blobs()
            .zip(image.blobs())
            .filter(|(descriptor, _)| seen.insert(descriptor.digest.clone()))
            .map(|(descriptor, blob)| (descriptor.digest.clone(), blob.data.clone()))
            .collect();
        job.track(blobs.iter().map(|(digest, _)| blob_key(digest)));
        info!("Pushing {} blob(s) for {}", blobs.len(), reference);

        let items = blobs
            .into_iter()
            .map(|(digest, data)| (blob_key(&digest), (digest, data)))
            .collect();
        let outcome = pool::run_bounded(self.concurrency, Operation::UploadBlob, items, |(digest, data)| {
            let store = Arc::clone(&self.store);
            let retry = self.retry.clone();
            upload_blob(store, retry, digest, data)
        })
        .await;

        let uploads = match outcome {
            Ok(uploads) => uploads,
            Err(batch) => {
                for key in &batch.completed {
                    job.mark_done(key);
                }
                return Err(job.fail_with(batch.failures));
            }
        };

        let mut uploaded = Vec::new();
        let mut skipped = Vec::new();
        for (key, upload) in uploads {
            job.mark_done(&key);
            if upload.uploaded {
                uploaded.push(upload.digest);
            } else {
                skipped.push(upload.digest);
            }
        }

        job.advance(JobState::CommittingManifest)?;

        // Digest copy first so a tag never names a manifest that is not
        // also reachable by its digest
        let digest_key = manifest_key(&reference.repository, &manifest_digest.to_string());
        self.commit(&digest_key, &manifest_bytes)
            .await
            .map_err(|failure| job.fail_with(vec![failure]))?;
        if let Some(tag) = reference.tag() {
            let tag_key = manifest_key(&reference.repository, tag);
            self.commit(&tag_key, &manifest_bytes)
                .await
                .map_err(|failure| job.fail_with(vec![failure]))?;
        }

        job.complete()?;
        info!(
            "Pushed {} as {} ({} uploaded, {} already present)",
            reference,
            manifest_digest,
            uploaded.len(),
            skipped.len()
        );

        Ok(PushReport {
            job_id: job.id(),
            reference: reference.clone(),
            manifest_digest,
            uploaded,
            skipped,
        })
    }

    async fn commit(&self, key: &str, manifest: &Bytes) -> std::result::Result<(), OperationFailure> {
        self.retry
            .run(key, || self.store.put(key, manifest.clone()))
            .await
            .map_err(|cause| OperationFailure::new(Operation::CommitManifest, self.store.locate(key), cause))?;
        debug!("Committed manifest {}", key);
        Ok(())
    }

    /// Fetch the manifest `reference` names and every blob it references.
    ///
    /// Nothing is returned unless every blob matched its descriptor.
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub async fn pull(&self, job: &mut TransferJob, reference: &ImageReference) -> Result<PulledImage> {
        job.advance(JobState::FetchingManifest)?;

        let key = reference.manifest_key();
        let (manifest, manifest_digest, manifest_bytes) = self
            .fetch_manifest(&reference.repository, &key, reference.digest())
            .await
            .map_err(|cause| {
                job.fail_with(vec![OperationFailure::new(
                    Operation::FetchManifest,
                    self.store.locate(&key),
                    cause,
                )])
            })?;
        debug!("Fetched manifest {} ({})", key, manifest_digest);

        job.advance(JobState::FetchingBlobs)?;

        let mut seen = HashSet::new();
        let wanted: Vec<Descriptor> = manifest
            .blobs()
            .filter(|descriptor| seen.insert(descriptor.digest.clone()))
            .cloned()
            .collect();
        job.track(wanted.iter().map(|descriptor| blob_key(&descriptor.digest)));
        info!("Fetching {} blob(s) for {}", wanted.len(), reference);

        let items = wanted
            .into_iter()
            .map(|descriptor| (blob_key(&descriptor.digest), descriptor))
            .collect();
        let outcome = pool::run_bounded(self.concurrency, Operation::FetchBlob, items, |descriptor| {
            let store = Arc::clone(&self.store);
            let retry = self.retry.clone();
            fetch_blob(store, retry, descriptor)
        })
        .await;

        let fetched = match outcome {
            Ok(fetched) => fetched,
            Err(batch) => {
                for key in &batch.completed {
                    job.mark_done(key);
                }
                return Err(job.fail_with(batch.failures));
            }
        };

        let mut blobs: HashMap<OciDigest, Bytes> = HashMap::with_capacity(fetched.len());
        for (key, (digest, data)) in fetched {
            job.mark_done(&key);
            blobs.insert(digest, data);
        }

        let mut assemble = |descriptor: &Descriptor| {
            blobs.get(&descriptor.digest).cloned().ok_or_else(|| {
                AppError::Internal(format!("blob {} missing after fetch", descriptor.digest))
            })
        };
        let config = assemble(&manifest.config).map_err(|err| job.fail(err))?;
        let layers = manifest
            .layers
            .iter()
            .map(&mut assemble)
            .collect::<Result<Vec<_>>>()
            .map_err(|err| job.fail(err))?;

        job.complete()?;
        info!("Pulled {} ({})", reference, manifest_digest);

        Ok(PulledImage {
            manifest,
            manifest_digest,
            manifest_bytes,
            config,
            layers,
        })
    }

    async fn fetch_manifest(
        &self,
        repository: &str,
        key: &str,
        expected: Option<&OciDigest>,
    ) -> std::result::Result<(ImageManifest, OciDigest, Bytes), OperationError> {
        let content = self.retry.run(key, || self.store.get(key)).await?;

        // A digest must match the stored bytes; a tag takes their digest
        let digest = match expected {
            Some(expected) if !expected.matches(&content) => {
                return Err(OperationError::DigestMismatch(DigestMismatch {
                    expected: expected.clone(),
                    expected_size: None,
                    actual: OciDigest::compute_with(expected.algorithm(), &content),
                    actual_size: content.len() as u64,
                }));
            }
            Some(expected) => expected.clone(),
            None => OciDigest::compute(&content),
        };

        let manifest = parse_manifest(&content)?;

        // Push writes the digest copy before the tag, so a tag whose bytes
        // have no digest copy was not written by a push
        if expected.is_none() {
            let digest_key = manifest_key(repository, &digest.to_string());
            if !self.retry.run(&digest_key, || self.store.exists(&digest_key)).await? {
                return Err(OperationError::UncommittedManifest { digest });
            }
        }
        Ok((manifest, digest, content))
    }

    /// Tags in a repository, sorted. Digest-addressed entries are not tags.
    #[instrument(skip(self))]
    pub async fn list_tags(&self, repository: &RepositoryReference) -> Result<Vec<String>> {
        let prefix = repository.manifest_prefix();
        let keys = self
            .retry
            .run(&prefix, || self.store.list(&prefix))
            .await
            .map_err(|cause| {
                OperationFailure::new(Operation::ListManifests, self.store.locate(&prefix), cause)
            })?;

        let mut tags: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|name| !name.is_empty() && !name.contains('/') && !name.contains(':'))
            .map(str::to_string)
            .collect();
        tags.sort();
        tags.dedup();
        debug!("Found {} tag(s) under {}", tags.len(), prefix);
        Ok(tags)
    }

    /// Remove the manifest entry `reference` names. Blobs stay; other
    /// manifests may share them.
    #[instrument(skip(self))]
    pub async fn delete_manifest(&self, reference: &ImageReference) -> Result<()> {
        let key = reference.manifest_key();
        let location = self.store.locate(&key);

        let exists = self
            .retry
            .run(&key, || self.store.exists(&key))
            .await
            .map_err(|cause| OperationFailure::new(Operation::DeleteManifest, location.clone(), cause))?;
        if !exists {
            return Err(AppError::NotFound(format!("manifest {} ({})", reference, location)));
        }

        self.retry
            .run(&key, || self.store.delete(&key))
            .await
            .map_err(|cause| OperationFailure::new(Operation::DeleteManifest, location.clone(), cause))?;
        info!("Deleted {}", reference);
        Ok(())
    }
}

async fn upload_blob(
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    digest: OciDigest,
    data: Bytes,
) -> std::result::Result<BlobUpload, OperationFailure> {
    let key = blob_key(&digest);

    let present = retry
        .run(&key, || store.exists(&key))
        .await
        .map_err(|cause| OperationFailure::new(Operation::CheckBlob, store.locate(&key), cause))?;
    if present {
        debug!("Blob {} already present, skipping upload", digest);
        return Ok(BlobUpload { digest, uploaded: false });
    }

    retry
        .run(&key, || store.put(&key, data.clone()))
        .await
        .map_err(|cause| OperationFailure::new(Operation::UploadBlob, store.locate(&key), cause))?;
    debug!("Uploaded blob {} ({} bytes)", digest, data.len());
    Ok(BlobUpload { digest, uploaded: true })
}

async fn fetch_blob(
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    descriptor: Descriptor,
) -> std::result::Result<(OciDigest, Bytes), OperationFailure> {
    let key = blob_key(&descriptor.digest);

    let data = retry
        .run(&key, || store.get(&key))
        .await
        .map_err(|cause| OperationFailure::new(Operation::FetchBlob, store.locate(&key), cause))?;

    // Integrity failures are never retried
    descriptor.verify(&data).map_err(|mismatch| {
        OperationFailure::new(Operation::FetchBlob, store.locate(&key), mismatch.into())
    })?;

    Ok((descriptor.digest, data))
}
