//! Object operations shared by every opendal-backed adapter.
//!
//! Adapters differ only in how they build their [`Operator`] and which
//! provider codes they recognize; the calls themselves are the same.

use bytes::Bytes;
use opendal::{ErrorKind, Operator};

use super::{classify, ProviderSignals, StorageError};

pub(crate) async fn exists(
    operator: &Operator,
    signals: &ProviderSignals,
    key: &str,
) -> Result<bool, StorageError> {
    operator.is_exist(key).await.map_err(|err| classify(&err, signals))
}

pub(crate) async fn get(
    operator: &Operator,
    signals: &ProviderSignals,
    key: &str,
) -> Result<Bytes, StorageError> {
    let data = operator.read(key).await.map_err(|err| classify(&err, signals))?;
    Ok(Bytes::from(data))
}

pub(crate) async fn put(
    operator: &Operator,
    signals: &ProviderSignals,
    key: &str,
    content: Bytes,
) -> Result<(), StorageError> {
    operator
        .write(key, content)
        .await
        .map_err(|err| classify(&err, signals))
}

/// Every object below `prefix`. A prefix nothing was written under is empty,
/// not missing.
pub(crate) async fn list(
    operator: &Operator,
    signals: &ProviderSignals,
    prefix: &str,
) -> Result<Vec<String>, StorageError> {
    let entries = match operator.list_with(&list_dir(prefix)).recursive(true).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(classify(&err, signals)),
    };

    Ok(entries
        .into_iter()
        .filter(|entry| !entry.metadata().is_dir())
        .map(|entry| entry.path().to_string())
        .collect())
}

pub(crate) async fn delete(
    operator: &Operator,
    signals: &ProviderSignals,
    key: &str,
) -> Result<(), StorageError> {
    operator.delete(key).await.map_err(|err| classify(&err, signals))
}

/// opendal list paths are directories; make sure the prefix is one.
fn list_dir(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}
