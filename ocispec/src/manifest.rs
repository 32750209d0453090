//! Canonical manifest encoding.
//!
//! A manifest is stored under the digest of its serialized bytes, so the
//! encoding must be stable: compact JSON, struct fields in declaration
//! order, annotation maps sorted by key. Parsing accepts any whitespace
//! but never re-encodes; callers verify the bytes they fetched.

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::digest::OciDigest;
use crate::models::{
    Descriptor, ImageManifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_MANIFEST,
};

/// Schema version every supported manifest declares.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Unsupported manifest schema version: {0}")]
    UnsupportedSchemaVersion(u32),

    #[error("Unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Incomplete manifest: missing {0}")]
    MissingField(&'static str),

    #[error("Incomplete manifest: {0}")]
    IncompleteDescriptor(String),

    #[error("Malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
}

/// Loose shape used for parsing so a missing field is reported by name
/// rather than as a generic deserialization error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: Option<u32>,
    media_type: Option<String>,
    config: Option<Descriptor>,
    layers: Option<Vec<Descriptor>>,
    #[serde(default)]
    annotations: Option<std::collections::BTreeMap<String, String>>,
}

/// Encode `manifest` canonically and return the bytes with their digest.
pub fn serialize_manifest(manifest: &ImageManifest) -> Result<(Bytes, OciDigest), ManifestError> {
    let encoded = serde_json::to_vec(manifest)?;
    let digest = OciDigest::compute(&encoded);
    Ok((Bytes::from(encoded), digest))
}

/// Parse and validate manifest bytes.
pub fn parse_manifest(content: &[u8]) -> Result<ImageManifest, ManifestError> {
    let raw: RawManifest = serde_json::from_slice(content)?;

    let schema_version = raw
        .schema_version
        .ok_or(ManifestError::MissingField("schemaVersion"))?;
    if schema_version != SCHEMA_VERSION {
        return Err(ManifestError::UnsupportedSchemaVersion(schema_version));
    }

    if let Some(media_type) = &raw.media_type {
        if media_type != MEDIA_TYPE_OCI_MANIFEST && media_type != MEDIA_TYPE_DOCKER_MANIFEST {
            return Err(ManifestError::UnsupportedMediaType(media_type.clone()));
        }
    }

    let config = raw.config.ok_or(ManifestError::MissingField("config"))?;
    let layers = raw.layers.ok_or(ManifestError::MissingField("layers"))?;
    if layers.is_empty() {
        return Err(ManifestError::IncompleteDescriptor(
            "manifest references no layers".to_string(),
        ));
    }

    for (position, descriptor) in std::iter::once(&config).chain(layers.iter()).enumerate() {
        if descriptor.media_type.trim().is_empty() {
            let what = if position == 0 {
                "config descriptor".to_string()
            } else {
                format!("layer descriptor {}", position - 1)
            };
            return Err(ManifestError::IncompleteDescriptor(format!(
                "{} {} has no media type",
                what, descriptor.digest
            )));
        }
    }

    Ok(ImageManifest {
        schema_version,
        media_type: raw.media_type,
        config,
        layers,
        annotations: raw.annotations,
    })
}
