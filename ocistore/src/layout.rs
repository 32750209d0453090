//! Local OCI image layout directories.
//!
//! Push reads its image from one, pull writes into a fresh one. A layout is
//! an `oci-layout` marker, an `index.json` and content-addressed files under
//! `blobs/<algorithm>/<hex>`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use ocispec::{
    parse_manifest, Descriptor, DigestMismatch, ImageIndex, ImageManifest, ManifestError,
    OciDigest,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transfer::PulledImage;

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is not an OCI image layout (missing oci-layout file)")]
    NotALayout(PathBuf),

    #[error("unsupported image layout version '{0}'")]
    UnsupportedVersion(String),

    #[error("no manifest tagged '{0}' in the image index")]
    TagNotFound(String),

    #[error("image index holds {0} manifests; pick one with --source-tag")]
    AmbiguousIndex(usize),

    #[error("image index is empty")]
    EmptyIndex,

    #[error("{path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: DigestMismatch,
    },

    #[error("manifest {digest}: {source}")]
    Manifest {
        digest: OciDigest,
        #[source]
        source: ManifestError,
    },

    #[error("output directory {0} already exists and is not empty")]
    OutputNotEmpty(PathBuf),

    #[error("invalid output directory {0}")]
    InvalidOutput(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// Blob bytes and the media type they are published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub media_type: String,
    pub data: Bytes,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Blob {
    pub fn new(media_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
            annotations: None,
        }
    }

    /// Descriptor computed from the bytes themselves.
    pub fn descriptor(&self) -> Descriptor {
        let mut descriptor = Descriptor::from_bytes(self.media_type.clone(), &self.data);
        descriptor.annotations = self.annotations.clone();
        descriptor
    }
}

/// Image held in memory, ready to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub config: Blob,
    /// Layers in application order
    pub layers: Vec<Blob>,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl LocalImage {
    pub fn new(config: Blob, layers: Vec<Blob>) -> Self {
        Self {
            config,
            layers,
            annotations: None,
        }
    }

    /// Manifest over descriptors computed from local bytes.
    pub fn manifest(&self) -> ImageManifest {
        let mut manifest = ImageManifest::new(
            self.config.descriptor(),
            self.layers.iter().map(Blob::descriptor).collect(),
        );
        manifest.annotations = self.annotations.clone();
        manifest
    }

    pub(crate) fn blobs(&self) -> impl Iterator<Item = &Blob> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Read the image tagged `tag` from the layout at `dir`.
///
/// An index with a single manifest is used whatever its tag. Every blob is
/// verified against the descriptor that names it.
pub async fn read_image(dir: &Path, tag: Option<&str>) -> Result<LocalImage, LayoutError> {
    let marker_path = dir.join(LAYOUT_FILE);
    let marker: LayoutMarker = match fs::read(&marker_path).await {
        Ok(content) => parse_json(&marker_path, &content)?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LayoutError::NotALayout(dir.to_path_buf()))
        }
        Err(source) => return Err(LayoutError::Io { path: marker_path, source }),
    };
    if marker.image_layout_version != LAYOUT_VERSION {
        return Err(LayoutError::UnsupportedVersion(marker.image_layout_version));
    }

    let index_path = dir.join(INDEX_FILE);
    let index: ImageIndex = parse_json(&index_path, &read_file(&index_path).await?)?;
    let selected = select_manifest(&index, tag)?;
    debug!("Reading manifest {} from {}", selected.digest, dir.display());

    let manifest_bytes = read_blob(dir, selected).await?;
    let manifest = parse_manifest(&manifest_bytes).map_err(|source| LayoutError::Manifest {
        digest: selected.digest.clone(),
        source,
    })?;

    let config = load_blob(dir, &manifest.config).await?;
    let mut layers = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        layers.push(load_blob(dir, layer).await?);
    }

    Ok(LocalImage {
        config,
        layers,
        annotations: manifest.annotations,
    })
}

fn select_manifest<'a>(index: &'a ImageIndex, tag: Option<&str>) -> Result<&'a Descriptor, LayoutError> {
    if let [only] = index.manifests.as_slice() {
        return Ok(only);
    }
    if index.manifests.is_empty() {
        return Err(LayoutError::EmptyIndex);
    }
    match tag {
        Some(tag) => index
            .manifests
            .iter()
            .find(|desc| desc.annotation(ocispec::models::ANNOTATION_REF_NAME) == Some(tag))
            .ok_or_else(|| LayoutError::TagNotFound(tag.to_string())),
        None => Err(LayoutError::AmbiguousIndex(index.manifests.len())),
    }
}

async fn load_blob(dir: &Path, descriptor: &Descriptor) -> Result<Blob, LayoutError> {
    let data = read_blob(dir, descriptor).await?;
    Ok(Blob {
        media_type: descriptor.media_type.clone(),
        data,
        annotations: descriptor.annotations.clone(),
    })
}

async fn read_blob(dir: &Path, descriptor: &Descriptor) -> Result<Bytes, LayoutError> {
    let path = blob_path(dir, &descriptor.digest);
    let data = read_file(&path).await?;
    descriptor
        .verify(&data)
        .map_err(|source| LayoutError::Corrupt { path, source })?;
    Ok(Bytes::from(data))
}

/// Write `image` as a new layout at `dir`, tagging it `tag` in the index.
///
/// Everything is written to a sibling staging directory first and renamed
/// into place at the end, so `dir` either holds the whole image or nothing.
pub async fn write_image(dir: &Path, image: &PulledImage, tag: Option<&str>) -> Result<(), LayoutError> {
    let name = dir
        .file_name()
        .ok_or_else(|| LayoutError::InvalidOutput(dir.to_path_buf()))?
        .to_string_lossy()
        .into_owned();
    let parent = match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let existing_empty = match fs::read_dir(dir).await {
        Ok(mut entries) => match entries.next_entry().await {
            Ok(None) => true,
            Ok(Some(_)) => return Err(LayoutError::OutputNotEmpty(dir.to_path_buf())),
            Err(source) => return Err(LayoutError::Io { path: dir.to_path_buf(), source }),
        },
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(source) => return Err(LayoutError::Io { path: dir.to_path_buf(), source }),
    };

    // A nested repository name defaults to a nested output directory
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| LayoutError::Io { path: parent.clone(), source })?;

    let staging = parent.join(format!(".{}.partial-{}", name, Uuid::new_v4()));
    if let Err(err) = stage(&staging, image, tag).await {
        discard(&staging).await;
        return Err(err);
    }

    if existing_empty {
        if let Err(source) = fs::remove_dir(dir).await {
            discard(&staging).await;
            return Err(LayoutError::Io { path: dir.to_path_buf(), source });
        }
    }
    if let Err(source) = fs::rename(&staging, dir).await {
        discard(&staging).await;
        return Err(LayoutError::Io { path: dir.to_path_buf(), source });
    }

    debug!("Wrote image layout to {}", dir.display());
    Ok(())
}

async fn stage(staging: &Path, image: &PulledImage, tag: Option<&str>) -> Result<(), LayoutError> {
    create_dir(staging).await?;

    let marker = LayoutMarker {
        image_layout_version: LAYOUT_VERSION.to_string(),
    };
    write_json(&staging.join(LAYOUT_FILE), &marker).await?;

    let config = &image.manifest.config;
    write_blob(staging, &config.digest, &image.config).await?;
    for (descriptor, data) in image.manifest.layers.iter().zip(&image.layers) {
        write_blob(staging, &descriptor.digest, data).await?;
    }
    write_blob(staging, &image.manifest_digest, &image.manifest_bytes).await?;

    let media_type = image
        .manifest
        .media_type
        .clone()
        .unwrap_or_else(|| ocispec::models::MEDIA_TYPE_OCI_MANIFEST.to_string());
    let mut descriptor = Descriptor {
        media_type,
        digest: image.manifest_digest.clone(),
        size: image.manifest_bytes.len() as u64,
        annotations: None,
        platform: None,
    };
    if let Some(tag) = tag {
        descriptor = descriptor.with_annotation(ocispec::models::ANNOTATION_REF_NAME, tag);
    }
    write_json(&staging.join(INDEX_FILE), &ImageIndex::new(vec![descriptor])).await
}

async fn write_blob(root: &Path, digest: &OciDigest, data: &[u8]) -> Result<(), LayoutError> {
    let path = blob_path(root, digest);
    if let Some(parent) = path.parent() {
        create_dir(parent).await?;
    }
    fs::write(&path, data)
        .await
        .map_err(|source| LayoutError::Io { path, source })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LayoutError> {
    let content = serde_json::to_vec_pretty(value).map_err(|source| LayoutError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, content).await.map_err(|source| LayoutError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn create_dir(path: &Path) -> Result<(), LayoutError> {
    fs::create_dir_all(path).await.map_err(|source| LayoutError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn read_file(path: &Path) -> Result<Vec<u8>, LayoutError> {
    fs::read(path).await.map_err(|source| LayoutError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn discard(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging).await {
        if err.kind() != ErrorKind::NotFound {
            warn!("Failed to remove staging directory {}: {}", staging.display(), err);
        }
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(path: &Path, content: &[u8]) -> Result<T, LayoutError> {
    serde_json::from_slice(content).map_err(|source| LayoutError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn blob_path(root: &Path, digest: &OciDigest) -> PathBuf {
    root.join("blobs")
        .join(digest.algorithm().as_str())
        .join(digest.hex())
}
