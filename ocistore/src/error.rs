use config::ConfigError;
use ocispec::{DigestMismatch, ManifestError};
use thiserror::Error;

use crate::layout::LayoutError;
use crate::reference::ReferenceError;
use crate::transfer::{JobFailure, OperationFailure};
use crate::validate::ValidationError;

#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or conflicting backend configuration. The message is part of
    /// the CLI contract and is printed as-is.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("Digest mismatch for {key}: {source}")]
    DigestMismatch {
        key: String,
        #[source]
        source: DigestMismatch,
    },

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Transfer(#[from] JobFailure),

    #[error(transparent)]
    Operation(#[from] OperationFailure),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Image layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// The integrity violation behind this error, if there is one.
    pub fn digest_mismatch(&self) -> Option<&DigestMismatch> {
        match self {
            AppError::DigestMismatch { source, .. } => Some(source),
            AppError::Transfer(failure) => failure.digest_mismatch(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
