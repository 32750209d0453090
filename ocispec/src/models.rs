use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::OciDigest;

/// Media type of an OCI image manifest
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// Media type of a Docker schema 2 manifest, accepted when reading
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Media type of an OCI image index
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Media type of an OCI image config
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// Media type of a gzip compressed layer tarball
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation naming the tag of a manifest inside an image layout index
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Fetched bytes do not hash to (or are not the size of) the descriptor that addressed them.
///
/// `expected_size` is only known when a descriptor declared one; content
/// addressed by a bare digest has no declared size.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("digest mismatch: expected {expected}{}, got {actual} ({actual_size} bytes)", declared_size(.expected_size))]
pub struct DigestMismatch {
    pub expected: OciDigest,
    pub expected_size: Option<u64>,
    pub actual: OciDigest,
    pub actual_size: u64,
}

fn declared_size(size: &Option<u64>) -> String {
    size.map(|size| format!(" ({} bytes)", size)).unwrap_or_default()
}

/// Represents a descriptor for a content blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Digest of the referenced content
    pub digest: OciDigest,
    /// Size of the referenced content in bytes
    pub size: u64,
    /// Optional annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Optional platform information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Describe `content` under the canonical digest algorithm.
    pub fn from_bytes(media_type: impl Into<String>, content: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: OciDigest::compute(content),
            size: content.len() as u64,
            annotations: None,
            platform: None,
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Check that `content` is exactly the blob this descriptor addresses.
    pub fn verify(&self, content: &[u8]) -> Result<(), DigestMismatch> {
        let actual_size = content.len() as u64;
        if actual_size == self.size && self.digest.matches(content) {
            return Ok(());
        }
        Err(DigestMismatch {
            expected: self.digest.clone(),
            expected_size: Some(self.size),
            actual: OciDigest::compute_with(self.digest.algorithm(), content),
            actual_size,
        })
    }
}

/// Represents platform information for a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub architecture: String,
    /// Optional variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Represents an OCI image manifest.
///
/// Field order is the serialization order; see [`crate::manifest`] for the
/// canonical encoding the manifest digest is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version of the manifest
    pub schema_version: u32,
    /// Media type of the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Descriptor for the config blob
    pub config: Descriptor,
    /// Descriptors for the layer blobs
    pub layers: Vec<Descriptor>,
    /// Optional annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageManifest {
    /// Build a schema 2 OCI manifest over a config and ordered layers.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config,
            layers,
            annotations: None,
        }
    }

    /// Config first, then layers in manifest order.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Represents an OCI image index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version of the index
    pub schema_version: u32,
    /// Media type of the index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// List of manifests
    pub manifests: Vec<Descriptor>,
    /// Optional annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageIndex {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests,
            annotations: None,
        }
    }
}
