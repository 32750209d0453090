use async_trait::async_trait;
use bytes::Bytes;
use opendal::services::S3;
use opendal::Operator;
use tracing::debug;

use super::{object_name, ops, BlobStore, ProviderSignals, StorageError};
use crate::validate::S3Config;

const SIGNALS: ProviderSignals = ProviderSignals {
    throttled: &["SlowDown", "RequestLimitExceeded", "ThrottlingException", "503 Service Unavailable"],
    auth: &[
        "InvalidAccessKeyId",
        "SignatureDoesNotMatch",
        "ExpiredToken",
        "AccessDenied",
        "InvalidToken",
    ],
};

/// Objects in an S3 (or S3-compatible) bucket.
#[derive(Debug)]
pub struct S3Store {
    operator: Operator,
    bucket: String,
    region: String,
    root: Option<String>,
}

impl S3Store {
    pub fn new(config: &S3Config, bucket: &str) -> opendal::Result<Self> {
        let mut builder = S3::default();
        builder.bucket(bucket);
        builder.region(&config.region);

        if let Some(root) = &config.root_dir {
            builder.root(root);
        }

        if let Some(endpoint) = &config.endpoint {
            builder.endpoint(endpoint);
        }

        if let Some(access_key) = &config.access_key_id {
            builder.access_key_id(access_key);
        }

        if let Some(secret_key) = &config.secret_access_key {
            builder.secret_access_key(secret_key);
        }

        let operator = Operator::new(builder)?.finish();

        Ok(Self {
            operator,
            bucket: bucket.to_string(),
            region: config.region.clone(),
            root: config.root_dir.clone(),
        })
    }
}

#[async_trait]
impl BlobStore for S3Store {
    fn locate(&self, key: &str) -> String {
        format!(
            "s3://{}/{} ({})",
            self.bucket,
            object_name(self.root.as_deref(), key),
            self.region
        )
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        ops::exists(&self.operator, &SIGNALS, key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        ops::get(&self.operator, &SIGNALS, key).await
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), StorageError> {
        debug!("PUT {} ({} bytes)", self.locate(key), content.len());
        ops::put(&self.operator, &SIGNALS, key, content).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        ops::list(&self.operator, &SIGNALS, prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        ops::delete(&self.operator, &SIGNALS, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::classify;
    use opendal::ErrorKind;

    #[test]
    fn test_s3_error_codes() {
        let slow = opendal::Error::new(ErrorKind::Unexpected, "S3Error { code: \"SlowDown\" }");
        assert!(matches!(classify(&slow, &SIGNALS), StorageError::Throttled(_)));

        let skew = opendal::Error::new(ErrorKind::Unexpected, "SignatureDoesNotMatch");
        assert!(matches!(classify(&skew, &SIGNALS), StorageError::Auth(_)));
    }

    #[test]
    fn test_s3_locate_includes_root() {
        let config = S3Config {
            region: "us-east-1".to_string(),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            access_key_id: Some("minio".to_string()),
            secret_access_key: Some("minio123".to_string()),
            root_dir: Some("registry".to_string()),
        };
        let store = S3Store::new(&config, "images").unwrap();
        assert_eq!(
            store.locate("blobs/sha256/ab"),
            "s3://images/registry/blobs/sha256/ab (us-east-1)"
        );
    }
}
