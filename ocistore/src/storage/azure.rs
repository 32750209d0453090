use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use opendal::services::Azblob;
use opendal::Operator;
use tokio::sync::OnceCell;
use tracing::debug;

use super::azure_sas::{user_delegation_sas, SasScope, ServicePrincipal};
use super::{classify, object_name, ops, BlobStore, ProviderSignals, StorageError};
use crate::validate::{AzureConfig, AzureCredential};

const SIGNALS: ProviderSignals = ProviderSignals {
    throttled: &["ServerBusy", "OperationTimedOut", "IngressOverAccountLimit", "EgressOverAccountLimit"],
    auth: &[
        "AuthenticationFailed",
        "AuthorizationFailure",
        "AuthorizationPermissionMismatch",
        "InvalidAuthenticationInfo",
        "AccountIsDisabled",
    ],
};

/// Block blobs in an Azure storage container.
#[derive(Debug)]
pub struct AzureStore {
    /// Built on first use for service principal sessions
    operator: OnceCell<Operator>,
    credential: AzureCredential,
    account: String,
    endpoint: String,
    container: String,
    root: Option<String>,
}

impl AzureStore {
    pub fn new(config: &AzureConfig, container: &str) -> opendal::Result<Self> {
        let mut store = Self {
            operator: OnceCell::new(),
            credential: config.credential.clone(),
            account: config.account_name.clone(),
            endpoint: config.endpoint(),
            container: container.to_string(),
            root: config.root_dir.clone(),
        };

        // Without an account key the ambient Azure credentials are used
        match &config.credential {
            AzureCredential::SharedKey(account_key) => {
                let mut builder = store.builder();
                builder.account_key(account_key);
                store.operator = OnceCell::from(Operator::new(builder)?.finish());
            }
            AzureCredential::Ambient => {
                store.operator = OnceCell::from(Operator::new(store.builder())?.finish());
            }
            AzureCredential::ServicePrincipal { .. } => {}
        }
        Ok(store)
    }

    fn builder(&self) -> Azblob {
        let mut builder = Azblob::default();
        builder.container(&self.container);
        builder.endpoint(&self.endpoint);
        builder.account_name(&self.account);

        if let Some(root) = &self.root {
            builder.root(root);
        }
        builder
    }

    async fn operator(&self) -> Result<&Operator, StorageError> {
        self.operator
            .get_or_try_init(|| async {
                let principal = match &self.credential {
                    AzureCredential::ServicePrincipal {
                        tenant_id,
                        client_id,
                        client_secret,
                    } => ServicePrincipal {
                        tenant_id: tenant_id.as_str(),
                        client_id: client_id.as_str(),
                        client_secret: client_secret.as_str(),
                    },
                    // Other sessions are built eagerly
                    _ => return Err(StorageError::Fatal("Azure session has no operator".to_string())),
                };
                let scope = SasScope {
                    endpoint: &self.endpoint,
                    account: &self.account,
                    container: &self.container,
                };
                let sas = user_delegation_sas(&principal, &scope, Utc::now()).await?;

                let mut builder = self.builder();
                builder.sas_token(&sas);
                let operator = Operator::new(builder)
                    .map_err(|err| classify(&err, &SIGNALS))?
                    .finish();
                debug!("Authenticated to {} as a service principal", self.endpoint);
                Ok(operator)
            })
            .await
    }
}

#[async_trait]
impl BlobStore for AzureStore {
    fn locate(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.container,
            object_name(self.root.as_deref(), key)
        )
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        ops::exists(self.operator().await?, &SIGNALS, key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        ops::get(self.operator().await?, &SIGNALS, key).await
    }

    async fn put(&self, key: &str, content: Bytes) -> Result<(), StorageError> {
        debug!("Writing blob {} ({} bytes)", self.locate(key), content.len());
        ops::put(self.operator().await?, &SIGNALS, key, content).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        ops::list(self.operator().await?, &SIGNALS, prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        ops::delete(self.operator().await?, &SIGNALS, key).await
    }
}
