use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::transfer::RetryPolicy;
use crate::validate::RawBackendConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub s3: RawBackendConfig,
    #[serde(default)]
    pub gcs: RawBackendConfig,
    #[serde(default)]
    pub azure: RawBackendConfig,
}

/// Tuning for the transfer engine's worker pool and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferSettings {
    /// Maximum number of blob transfers in flight per job
    pub concurrency: usize,
    /// Attempts per storage call, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Gcs,
    Azure,
}

impl StorageBackend {
    /// Human readable name of the storage domain
    pub fn domain(&self) -> &'static str {
        match self {
            StorageBackend::S3 => "S3",
            StorageBackend::Gcs => "Google Cloud Storage",
            StorageBackend::Azure => "Azure Blob Storage",
        }
    }

    fn section(&self) -> &'static str {
        match self {
            StorageBackend::S3 => "s3",
            StorageBackend::Gcs => "gcs",
            StorageBackend::Azure => "azure",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

impl AppConfig {
    /// Layer built-in defaults, an optional TOML file and `OCI_STORE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = TransferSettings::default();
        let mut builder = Config::builder()
            // Start with default values
            .set_default("transfer.concurrency", defaults.concurrency as u64)?
            .set_default("transfer.max_attempts", defaults.max_attempts as u64)?
            .set_default("transfer.initial_backoff_ms", defaults.initial_backoff_ms)?
            .set_default("transfer.max_backoff_ms", defaults.max_backoff_ms)?
            .set_default("transfer.backoff_multiplier", defaults.backoff_multiplier)?;

        // An explicitly named file must exist
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Add environment variables with prefix OCI_STORE, e.g. OCI_STORE__TRANSFER__CONCURRENCY
        builder = builder.add_source(
            Environment::with_prefix("OCI_STORE")
                .separator("__")
                .try_parsing(true),
        );

        // Transfer settings are checked by the caller, after backend validation
        builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }

    /// Backend section from the configuration file for `backend`.
    pub fn backend(&self, backend: StorageBackend) -> &RawBackendConfig {
        match backend {
            StorageBackend::S3 => &self.s3,
            StorageBackend::Gcs => &self.gcs,
            StorageBackend::Azure => &self.azure,
        }
    }
}

impl TransferSettings {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(AppError::Config(
                "transfer.concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(AppError::Config(
                "transfer.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(AppError::Config(
                "transfer.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}
