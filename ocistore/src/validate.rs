//! Pre-flight validation of backend configuration.
//!
//! Runs before the reference is parsed and before any adapter exists, so a
//! missing region, project or account is reported even when the rest of
//! the invocation is also wrong. Required fields are never defaulted.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::config::StorageBackend;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("S3 requires region to be specified via --region or AWS_REGION env var")]
    MissingRegion,

    #[error("GCS requires project ID to be specified via --project or GOOGLE_CLOUD_PROJECT env var")]
    MissingProjectId,

    #[error("Azure requires account name to be specified via --account-name or AZURE_STORAGE_ACCOUNT env var")]
    MissingAccountName,

    #[error("Azure credential type '{0}' is not supported (expected client_secret or default_credentials)")]
    UnsupportedCredentialType(String),

    #[error("Azure client_secret credentials require --client-id, --tenant-id and --secret (missing {0})")]
    IncompleteServicePrincipal(&'static str),

    #[error("{backend} option '{option}' does not apply to this backend")]
    UnsupportedOption {
        backend: StorageBackend,
        option: &'static str,
    },
}

/// Unvalidated backend options as collected from flags, provider
/// environment variables and the configuration file.
#[derive(Clone, Default, Deserialize)]
pub struct RawBackendConfig {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub project_id: Option<String>,
    pub keyfile: Option<String>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub credential_type: Option<String>,
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_secret: Option<String>,
    pub root_dir: Option<String>,
}

impl RawBackendConfig {
    /// Fill every unset field from `fallback`.
    pub fn or(self, fallback: &RawBackendConfig) -> Self {
        let pick = |value: Option<String>, other: &Option<String>| {
            present(value).or_else(|| present(other.clone()))
        };
        Self {
            region: pick(self.region, &fallback.region),
            endpoint: pick(self.endpoint, &fallback.endpoint),
            access_key: pick(self.access_key, &fallback.access_key),
            secret_key: pick(self.secret_key, &fallback.secret_key),
            project_id: pick(self.project_id, &fallback.project_id),
            keyfile: pick(self.keyfile, &fallback.keyfile),
            account_name: pick(self.account_name, &fallback.account_name),
            account_key: pick(self.account_key, &fallback.account_key),
            credential_type: pick(self.credential_type, &fallback.credential_type),
            client_id: pick(self.client_id, &fallback.client_id),
            tenant_id: pick(self.tenant_id, &fallback.tenant_id),
            client_secret: pick(self.client_secret, &fallback.client_secret),
            root_dir: pick(self.root_dir, &fallback.root_dir),
        }
    }
}

impl fmt::Debug for RawBackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBackendConfig")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &redacted(&self.secret_key))
            .field("project_id", &self.project_id)
            .field("keyfile", &self.keyfile)
            .field("account_name", &self.account_name)
            .field("account_key", &redacted(&self.account_key))
            .field("credential_type", &self.credential_type)
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("root_dir", &self.root_dir)
            .finish()
    }
}

/// Validated, backend-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
}

impl BackendConfig {
    pub fn backend(&self) -> StorageBackend {
        match self {
            BackendConfig::S3(_) => StorageBackend::S3,
            BackendConfig::Gcs(_) => StorageBackend::Gcs,
            BackendConfig::Azure(_) => StorageBackend::Azure,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    pub region: String,
    /// S3-compatible endpoint
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub root_dir: Option<String>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redacted(&self.secret_access_key))
            .field("root_dir", &self.root_dir)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsConfig {
    pub project_id: String,
    /// Service account key file; ambient credentials are used when unset
    pub credential_path: Option<String>,
    pub endpoint: Option<String>,
    pub root_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub account_name: String,
    pub credential: AzureCredential,
    pub endpoint: Option<String>,
    pub root_dir: Option<String>,
}

/// How an Azure session authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum AzureCredential {
    /// Storage account key
    SharedKey(String),
    /// Microsoft Entra application with a client secret
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// Whatever the environment provides (managed identity)
    Ambient,
}

impl AzureConfig {
    /// Blob service endpoint, derived from the account name unless overridden.
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", self.account_name))
    }
}

impl fmt::Debug for AzureCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AzureCredential::SharedKey(_) => f.debug_tuple("SharedKey").field(&"<redacted>").finish(),
            AzureCredential::ServicePrincipal {
                tenant_id, client_id, ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            AzureCredential::Ambient => f.write_str("Ambient"),
        }
    }
}

/// Check the required field for `backend` and build its configuration.
///
/// Pure: no I/O, no environment lookups. Blank values count as absent.
pub fn validate(
    backend: StorageBackend,
    raw: &RawBackendConfig,
) -> Result<BackendConfig, ValidationError> {
    let raw = raw.clone().or(&RawBackendConfig::default());
    match backend {
        StorageBackend::S3 => {
            let region = raw.region.ok_or(ValidationError::MissingRegion)?;
            reject(backend, "project-id", &raw.project_id)?;
            reject(backend, "account-name", &raw.account_name)?;
            Ok(BackendConfig::S3(S3Config {
                region,
                endpoint: raw.endpoint,
                access_key_id: raw.access_key,
                secret_access_key: raw.secret_key,
                root_dir: raw.root_dir,
            }))
        }
        StorageBackend::Gcs => {
            let project_id = raw.project_id.ok_or(ValidationError::MissingProjectId)?;
            reject(backend, "region", &raw.region)?;
            reject(backend, "account-name", &raw.account_name)?;
            Ok(BackendConfig::Gcs(GcsConfig {
                project_id,
                credential_path: raw.keyfile,
                endpoint: raw.endpoint,
                root_dir: raw.root_dir,
            }))
        }
        StorageBackend::Azure => {
            let account_name = raw.account_name.clone().ok_or(ValidationError::MissingAccountName)?;
            reject(backend, "region", &raw.region)?;
            reject(backend, "project-id", &raw.project_id)?;
            let credential = azure_credential(&raw)?;
            Ok(BackendConfig::Azure(AzureConfig {
                account_name,
                credential,
                endpoint: raw.endpoint,
                root_dir: raw.root_dir,
            }))
        }
    }
}

/// An account key always wins; otherwise the credential type decides.
fn azure_credential(raw: &RawBackendConfig) -> Result<AzureCredential, ValidationError> {
    if let Some(key) = &raw.account_key {
        return Ok(AzureCredential::SharedKey(key.clone()));
    }

    match raw.credential_type.as_deref().unwrap_or("client_secret") {
        "default_credentials" => Ok(AzureCredential::Ambient),
        "client_secret" => match (&raw.client_id, &raw.tenant_id, &raw.client_secret) {
            (None, None, None) => Ok(AzureCredential::Ambient),
            (Some(client_id), Some(tenant_id), Some(client_secret)) => {
                Ok(AzureCredential::ServicePrincipal {
                    tenant_id: tenant_id.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                })
            }
            (None, _, _) => Err(ValidationError::IncompleteServicePrincipal("client ID")),
            (_, None, _) => Err(ValidationError::IncompleteServicePrincipal("tenant ID")),
            (_, _, None) => Err(ValidationError::IncompleteServicePrincipal("secret")),
        },
        other => Err(ValidationError::UnsupportedCredentialType(other.to_string())),
    }
}

fn reject(
    backend: StorageBackend,
    option: &'static str,
    value: &Option<String>,
) -> Result<(), ValidationError> {
    match value {
        Some(_) => Err(ValidationError::UnsupportedOption { backend, option }),
        None => Ok(()),
    }
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn redacted(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "<redacted>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_requires_region() {
        let err = validate(StorageBackend::S3, &RawBackendConfig::default()).unwrap_err();
        assert_eq!(err, ValidationError::MissingRegion);
        assert!(err.to_string().contains("requires region"));
    }

    #[test]
    fn test_gcs_requires_project_id() {
        let raw = RawBackendConfig {
            keyfile: Some("/tmp/key.json".to_string()),
            ..Default::default()
        };
        let err = validate(StorageBackend::Gcs, &raw).unwrap_err();
        assert!(err.to_string().contains("requires project ID"));
    }

    #[test]
    fn test_azure_requires_account_name() {
        let raw = RawBackendConfig {
            account_key: Some("secret".to_string()),
            ..Default::default()
        };
        let err = validate(StorageBackend::Azure, &raw).unwrap_err();
        assert!(err.to_string().contains("requires account name"));
    }

    #[test]
    fn test_blank_values_are_absent() {
        let raw = RawBackendConfig {
            region: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            validate(StorageBackend::S3, &raw).unwrap_err(),
            ValidationError::MissingRegion
        );
    }

    #[test]
    fn test_valid_configs() {
        let raw = RawBackendConfig {
            region: Some(" us-east-1 ".to_string()),
            root_dir: Some("registry".to_string()),
            ..Default::default()
        };
        match validate(StorageBackend::S3, &raw).unwrap() {
            BackendConfig::S3(config) => {
                assert_eq!(config.region, "us-east-1");
                assert_eq!(config.root_dir.as_deref(), Some("registry"));
            }
            other => panic!("unexpected config {:?}", other),
        }

        let raw = RawBackendConfig {
            account_name: Some("acct".to_string()),
            ..Default::default()
        };
        match validate(StorageBackend::Azure, &raw).unwrap() {
            BackendConfig::Azure(config) => {
                assert_eq!(config.endpoint(), "https://acct.blob.core.windows.net");
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_azure_credential_selection() {
        let base = RawBackendConfig {
            account_name: Some("acct".to_string()),
            ..Default::default()
        };
        let credential = |raw: &RawBackendConfig| match validate(StorageBackend::Azure, raw) {
            Ok(BackendConfig::Azure(config)) => Ok(config.credential),
            Ok(other) => panic!("unexpected config {:?}", other),
            Err(err) => Err(err),
        };

        assert_eq!(credential(&base), Ok(AzureCredential::Ambient));

        let principal = RawBackendConfig {
            client_id: Some("app".to_string()),
            tenant_id: Some("tenant".to_string()),
            client_secret: Some("s3cr3t".to_string()),
            ..base.clone()
        };
        assert_eq!(
            credential(&principal),
            Ok(AzureCredential::ServicePrincipal {
                tenant_id: "tenant".to_string(),
                client_id: "app".to_string(),
                client_secret: "s3cr3t".to_string(),
            })
        );

        let keyed = RawBackendConfig {
            account_key: Some("key".to_string()),
            ..principal.clone()
        };
        assert_eq!(credential(&keyed), Ok(AzureCredential::SharedKey("key".to_string())));

        let ambient = RawBackendConfig {
            credential_type: Some("default_credentials".to_string()),
            ..principal
        };
        assert_eq!(credential(&ambient), Ok(AzureCredential::Ambient));
    }

    #[test]
    fn test_azure_rejects_partial_service_principal() {
        let raw = RawBackendConfig {
            account_name: Some("acct".to_string()),
            client_id: Some("app".to_string()),
            client_secret: Some("s3cr3t".to_string()),
            ..Default::default()
        };
        assert_eq!(
            validate(StorageBackend::Azure, &raw).unwrap_err(),
            ValidationError::IncompleteServicePrincipal("tenant ID")
        );

        let raw = RawBackendConfig {
            account_name: Some("acct".to_string()),
            credential_type: Some("managed_identity".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            validate(StorageBackend::Azure, &raw),
            Err(ValidationError::UnsupportedCredentialType(_))
        ));

        // The account name is still checked first
        let raw = RawBackendConfig {
            client_id: Some("app".to_string()),
            ..Default::default()
        };
        assert_eq!(
            validate(StorageBackend::Azure, &raw).unwrap_err(),
            ValidationError::MissingAccountName
        );
    }

    #[test]
    fn test_rejects_foreign_options() {
        let raw = RawBackendConfig {
            project_id: Some("proj".to_string()),
            region: Some("us-east-1".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            validate(StorageBackend::Gcs, &raw),
            Err(ValidationError::UnsupportedOption { option: "region", .. })
        ));
    }

    #[test]
    fn test_flag_values_win_over_file_values() {
        let file = RawBackendConfig {
            region: Some("eu-west-1".to_string()),
            endpoint: Some("http://minio:9000".to_string()),
            ..Default::default()
        };
        let flags = RawBackendConfig {
            region: Some("us-west-2".to_string()),
            ..Default::default()
        };
        let merged = flags.or(&file);
        assert_eq!(merged.region.as_deref(), Some("us-west-2"));
        assert_eq!(merged.endpoint.as_deref(), Some("http://minio:9000"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let raw = RawBackendConfig {
            secret_key: Some("hunter2".to_string()),
            client_secret: Some("hunter3".to_string()),
            account_name: Some("acct".to_string()),
            client_id: Some("app".to_string()),
            tenant_id: Some("tenant".to_string()),
            ..Default::default()
        };
        let printed = format!("{:?}", raw);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("hunter3"));

        let config = validate(StorageBackend::Azure, &RawBackendConfig { secret_key: None, ..raw }).unwrap();
        let printed = format!("{:?}", config);
        assert!(printed.contains("ServicePrincipal"));
        assert!(!printed.contains("hunter3"));
    }
}
