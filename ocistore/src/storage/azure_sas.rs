//! Service principal sessions for Azure Blob Storage.
//!
//! opendal's Azure service signs requests with an account key, a SAS token
//! or instance metadata credentials. A service principal is exchanged for a
//! user delegation key once per session, and the key signs a SAS scoped to
//! the session's container.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration as Span, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use super::StorageError;

const AUTHORITY: &str = "https://login.microsoftonline.com";
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
const SERVICE_VERSION: &str = "2022-11-02";
/// Read, add, create, write, delete, list
const PERMISSIONS: &str = "racwdl";

/// Tolerated clock skew between us and the storage service
const CLOCK_SKEW: i64 = 5;
const SESSION_HOURS: i64 = 12;

/// Application credentials of a Microsoft Entra service principal.
pub(crate) struct ServicePrincipal<'a> {
    pub tenant_id: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

/// Container a SAS grants access to.
pub(crate) struct SasScope<'a> {
    pub endpoint: &'a str,
    pub account: &'a str,
    pub container: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Answer of the Get User Delegation Key call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DelegationKey {
    pub signed_oid: String,
    pub signed_tid: String,
    pub signed_start: String,
    pub signed_expiry: String,
    pub signed_service: String,
    pub signed_version: String,
    /// Base64 signing key
    pub value: String,
}

impl DelegationKey {
    fn parse(xml: &str) -> Result<Self, StorageError> {
        let field = |name: &str| {
            element(xml, name)
                .map(str::to_string)
                .ok_or_else(|| StorageError::Fatal(format!("user delegation key response lacks <{}>", name)))
        };
        Ok(Self {
            signed_oid: field("SignedOid")?,
            signed_tid: field("SignedTid")?,
            signed_start: field("SignedStart")?,
            signed_expiry: field("SignedExpiry")?,
            signed_service: field("SignedService")?,
            signed_version: field("SignedVersion")?,
            value: field("Value")?,
        })
    }
}

/// Authenticate `principal` and return a SAS query string for `scope`,
/// valid from a little before `now` for the length of a session.
pub(crate) async fn user_delegation_sas(
    principal: &ServicePrincipal<'_>,
    scope: &SasScope<'_>,
    now: DateTime<Utc>,
) -> Result<String, StorageError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|err| StorageError::Fatal(format!("Failed to create HTTP client: {}", err)))?;

    let start = now - Span::minutes(CLOCK_SKEW);
    let expiry = now + Span::hours(SESSION_HOURS);

    let token = access_token(&client, principal).await?;
    let key = delegation_key(&client, scope.endpoint, &token, start, expiry).await?;
    debug!(
        "Obtained user delegation key for {} valid until {}",
        scope.account, key.signed_expiry
    );
    sign(&key, scope, &timestamp(start), &timestamp(expiry))
}

async fn access_token(client: &Client, principal: &ServicePrincipal<'_>) -> Result<String, StorageError> {
    let url = format!("{}/{}/oauth2/v2.0/token", AUTHORITY, principal.tenant_id);
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", principal.client_id),
        ("client_secret", principal.client_secret),
        ("scope", STORAGE_SCOPE),
    ];

    let response = client.post(&url).form(&form).send().await.map_err(transport)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        // Entra reports bad client credentials as 400 invalid_client
        if status == StatusCode::BAD_REQUEST && body.contains("invalid_client") {
            return Err(StorageError::Auth(format!("token request rejected: {}", body)));
        }
        return Err(from_status("token request", status, body));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|err| StorageError::Fatal(format!("invalid token response: {}", err)))?;
    Ok(token.access_token)
}

async fn delegation_key(
    client: &Client,
    endpoint: &str,
    token: &str,
    start: DateTime<Utc>,
    expiry: DateTime<Utc>,
) -> Result<DelegationKey, StorageError> {
    let url = format!(
        "{}/?restype=service&comp=userdelegationkey",
        endpoint.trim_end_matches('/')
    );
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><KeyInfo><Start>{}</Start><Expiry>{}</Expiry></KeyInfo>",
        timestamp(start),
        timestamp(expiry)
    );

    let response = client
        .post(&url)
        .bearer_auth(token)
        .header("x-ms-version", SERVICE_VERSION)
        .header("x-ms-date", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .header("Content-Type", "application/xml")
        .body(body)
        .send()
        .await
        .map_err(transport)?;

    let status = response.status();
    let text = response.text().await.map_err(transport)?;
    if !status.is_success() {
        return Err(from_status("user delegation key request", status, text));
    }
    DelegationKey::parse(&text)
}

/// Build the container SAS query for `key`.
fn sign(key: &DelegationKey, scope: &SasScope<'_>, start: &str, expiry: &str) -> Result<String, StorageError> {
    let resource = format!("/blob/{}/{}", scope.account, scope.container);
    let fields: [&str; 24] = [
        PERMISSIONS,
        start,
        expiry,
        resource.as_str(),
        key.signed_oid.as_str(),
        key.signed_tid.as_str(),
        key.signed_start.as_str(),
        key.signed_expiry.as_str(),
        key.signed_service.as_str(),
        key.signed_version.as_str(),
        // authorized and unauthorized object IDs, correlation ID, IP range, protocol
        "",
        "",
        "",
        "",
        "",
        SERVICE_VERSION,
        "c",
        // snapshot time, encryption scope, then the five response header overrides
        "",
        "",
        "",
        "",
        "",
        "",
        "",
    ];
    let string_to_sign = fields.join("\n");

    let secret = STANDARD
        .decode(&key.value)
        .map_err(|err| StorageError::Fatal(format!("user delegation key is not base64: {}", err)))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&secret)
        .map_err(|err| StorageError::Fatal(format!("unusable user delegation key: {}", err)))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let query: [(&str, &str); 12] = [
        ("sp", PERMISSIONS),
        ("st", start),
        ("se", expiry),
        ("skoid", key.signed_oid.as_str()),
        ("sktid", key.signed_tid.as_str()),
        ("skt", key.signed_start.as_str()),
        ("ske", key.signed_expiry.as_str()),
        ("sks", key.signed_service.as_str()),
        ("skv", key.signed_version.as_str()),
        ("sv", SERVICE_VERSION),
        ("sr", "c"),
        ("sig", signature.as_str()),
    ];
    let url = Url::parse_with_params("https://sas.invalid/", &query)
        .map_err(|err| StorageError::Fatal(format!("failed to encode SAS: {}", err)))?;
    Ok(url.query().unwrap_or_default().to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Text of the first `<name>` element in `xml`.
fn element<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(xml[start..end].trim())
}

fn transport(err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() {
        StorageError::Transient(err.to_string())
    } else {
        StorageError::Fatal(err.to_string())
    }
}

fn from_status(what: &str, status: StatusCode, body: String) -> StorageError {
    let message = format!("{} failed with {}: {}", what, status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => StorageError::Throttled(message),
        status if status.is_server_error() => StorageError::Transient(message),
        _ => StorageError::Fatal(message),
    }
}
