use async_trait::async_trait;
use bytes::Bytes;
use opendal::services::Gcs;
use opendal::Operator;
use tracing::debug;

use super::{object_name, ops, BlobStore, ProviderSignals, StorageError};
use crate::validate::GcsConfig;

const SIGNALS: ProviderSignals = ProviderSignals {
    throttled: &["rateLimitExceeded", "userRateLimitExceeded", "429 Too Many Requests"],
    auth: &[
        "invalid_grant",
        "userProjectMissing",
        "UNAUTHENTICATED",
        "accessNotConfigured",
        "insufficientPermissions",
    ],
};

/// Objects in a Google Cloud Storage bucket of one project.
#[derive(Debug)]
pub struct GcsStore {
    operator: Operator,
    project_id: String,
    bucket: String,
    root: Option<String>,
}

impl GcsStore {
    pub fn new(config: &GcsConfig, bucket: &str) -> opendal::Result<Self> {
        let mut builder = Gcs::default();
        builder.bucket(bucket);

        if let Some(root) = &config.root_dir {
            builder.root(root);
        }

        if let Some(endpoint) = &config.endpoint {
            builder.endpoint(endpoint);
        }

        // Without a key file the ambient Google credentials are used
        if let Some(path) = &config.credential_path {
            builder.credential_path(path);
        }

        let operator = Operator::new(builder)?.finish();

        Ok(Self {
            operator,
            project_id: config.project_id.clone(),
            bucket: bucket.to_string(),
            root: config.root_dir.clone(),
        })
    }
}

#[async_trait]
impl BlobStore for GcsStore {
    fn locate(&self, key: &str) -> String {
        format!(
            "gs://{}/{} (project {})",
            self.bucket,
            object_name(self.root.as_deref(), key),
            self.project_id
        )
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        ops::exists(&self.operator, &SIGNALS, key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        ops::get(&self.operator, &SIGNALS, key).await
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), StorageError> {
        debug!("Uploading object {} ({} bytes)", self.locate(key), content.len());
        ops::put(&self.operator, &SIGNALS, key, content).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        ops::list(&self.operator, &SIGNALS, prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        ops::delete(&self.operator, &SIGNALS, key).await
    }
}
