use async_trait::async_trait;
use bytes::Bytes;
use opendal::services::Memory;
use opendal::Operator;

use super::{ops, BlobStore, ProviderSignals, StorageError};

const SIGNALS: ProviderSignals = ProviderSignals {
    throttled: &[],
    auth: &[],
};

/// Process-local store. Clones share the same contents.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    operator: Operator,
}

impl MemoryStore {
    pub fn new() -> opendal::Result<Self> {
        let builder = Memory::default();
        let operator = Operator::new(builder)?.finish();
        Ok(Self { operator })
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn locate(&self, key: &str) -> String {
        format!("memory:///{}", key)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        ops::exists(&self.operator, &SIGNALS, key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        ops::get(&self.operator, &SIGNALS, key).await
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), StorageError> {
        ops::put(&self.operator, &SIGNALS, key, content).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        ops::list(&self.operator, &SIGNALS, prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        ops::delete(&self.operator, &SIGNALS, key).await
    }
}
