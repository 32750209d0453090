//! Entry points for one invocation: validate, parse, open a session, run.
//!
//! Validation always comes first, so a missing region is reported even when
//! the reference is malformed too. Each call opens its own storage session
//! and drops it before returning.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::{StorageBackend, TransferSettings};
use crate::error::Result;
use crate::layout::{self, LocalImage};
use crate::reference::{ImageReference, RepositoryReference};
use crate::storage::{open_store, BlobStore};
use crate::transfer::{Direction, JobState, PulledImage, PushReport, TransferEngine, TransferJob};
use crate::validate::{validate, BackendConfig, RawBackendConfig};

/// Where a push takes its image from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// An OCI image layout on disk. Without a path, a directory named after
    /// the repository is used; without a tag, the reference's own tag.
    Layout {
        path: Option<PathBuf>,
        tag: Option<String>,
    },
    Image(LocalImage),
}

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub backend: StorageBackend,
    pub config: RawBackendConfig,
    pub reference: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub backend: StorageBackend,
    pub config: RawBackendConfig,
    pub reference: String,
}

pub async fn push_image(request: PushRequest, settings: &TransferSettings) -> Result<PushReport> {
    push_image_with(request, settings, open_store).await
}

/// Push through a session produced by `open`.
#[instrument(skip_all, fields(backend = %request.backend, reference = %request.reference))]
pub async fn push_image_with<O>(
    request: PushRequest,
    settings: &TransferSettings,
    open: O,
) -> Result<PushReport>
where
    O: FnOnce(&BackendConfig, &str) -> Result<Arc<dyn BlobStore>>,
{
    let mut job = TransferJob::new(Direction::Push);
    info!("Starting push job {}", job.id());

    job.advance(JobState::Validating)?;
    let config = validate(request.backend, &request.config).map_err(|err| job.fail(err.into()))?;

    job.advance(JobState::ParsingReference)?;
    let reference = ImageReference::parse(request.backend, &request.reference)
        .map_err(|err| job.fail(err.into()))?;

    let image = match request.source {
        ImageSource::Image(image) => image,
        ImageSource::Layout { path, tag } => {
            let path = path.unwrap_or_else(|| PathBuf::from(&reference.repository));
            let tag = tag.or_else(|| reference.tag().map(str::to_string));
            layout::read_image(&path, tag.as_deref())
                .await
                .map_err(|err| job.fail(err.into()))?
        }
    };

    let store = open(&config, &reference.location).map_err(|err| job.fail(err))?;
    TransferEngine::new(store, settings)
        .push(&mut job, &reference, &image)
        .await
}

pub async fn pull_image(request: PullRequest, settings: &TransferSettings) -> Result<PulledImage> {
    pull_image_with(request, settings, open_store).await
}

/// Pull through a session produced by `open`.
#[instrument(skip_all, fields(backend = %request.backend, reference = %request.reference))]
pub async fn pull_image_with<O>(
    request: PullRequest,
    settings: &TransferSettings,
    open: O,
) -> Result<PulledImage>
where
    O: FnOnce(&BackendConfig, &str) -> Result<Arc<dyn BlobStore>>,
{
    let mut job = TransferJob::new(Direction::Pull);
    info!("Starting pull job {}", job.id());

    job.advance(JobState::Validating)?;
    let config = validate(request.backend, &request.config).map_err(|err| job.fail(err.into()))?;

    job.advance(JobState::ParsingReference)?;
    let reference = ImageReference::parse(request.backend, &request.reference)
        .map_err(|err| job.fail(err.into()))?;

    let store = open(&config, &reference.location).map_err(|err| job.fail(err))?;
    TransferEngine::new(store, settings).pull(&mut job, &reference).await
}

pub async fn list_tags(
    backend: StorageBackend,
    config: &RawBackendConfig,
    repository: &str,
    settings: &TransferSettings,
) -> Result<Vec<String>> {
    list_tags_with(backend, config, repository, settings, open_store).await
}

#[instrument(skip(config, settings, open))]
pub async fn list_tags_with<O>(
    backend: StorageBackend,
    config: &RawBackendConfig,
    repository: &str,
    settings: &TransferSettings,
    open: O,
) -> Result<Vec<String>>
where
    O: FnOnce(&BackendConfig, &str) -> Result<Arc<dyn BlobStore>>,
{
    let config = validate(backend, config)?;
    let repository = RepositoryReference::parse(backend, repository)?;
    let store = open(&config, &repository.location)?;
    TransferEngine::new(store, settings).list_tags(&repository).await
}

pub async fn delete_image(
    backend: StorageBackend,
    config: &RawBackendConfig,
    reference: &str,
    settings: &TransferSettings,
) -> Result<()> {
    delete_image_with(backend, config, reference, settings, open_store).await
}

#[instrument(skip(config, settings, open))]
pub async fn delete_image_with<O>(
    backend: StorageBackend,
    config: &RawBackendConfig,
    reference: &str,
    settings: &TransferSettings,
    open: O,
) -> Result<()>
where
    O: FnOnce(&BackendConfig, &str) -> Result<Arc<dyn BlobStore>>,
{
    let config = validate(backend, config)?;
    let reference = ImageReference::parse(backend, reference)?;
    let store = open(&config, &reference.location)?;
    TransferEngine::new(store, settings).delete_manifest(&reference).await
}
