//! Image reference parsing.
//!
//! Parses references like `my-bucket/team/app:v1.0` or
//! `my-bucket/app@sha256:…` into the storage location (bucket or
//! container), the repository path and exactly one selector.

use std::fmt;
use std::str::FromStr;

use ocispec::{DigestError, OciDigest};
use thiserror::Error;

use crate::config::StorageBackend;
use crate::storage::{manifest_key, manifest_prefix};

/// Longest tag a registry accepts.
const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("invalid {backend} reference '{input}', expected: {expected}")]
    InvalidFormat {
        backend: StorageBackend,
        input: String,
        expected: &'static str,
    },

    #[error("empty storage location in reference '{0}'")]
    EmptyLocation(String),

    #[error("empty repository path in reference '{0}'")]
    EmptyRepository(String),

    #[error("invalid repository path '{0}': components must be non-empty lowercase [a-z0-9._-] and not '.' or '..'")]
    InvalidRepository(String),

    #[error("missing tag or digest in reference '{0}'")]
    MissingSelector(String),

    #[error("reference '{0}' has both a tag and a digest")]
    AmbiguousSelector(String),

    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    #[error("invalid digest in reference '{input}': {source}")]
    InvalidDigest {
        input: String,
        #[source]
        source: DigestError,
    },
}

/// Exactly one of a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Tag(String),
    Digest(OciDigest),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Tag(tag) => write!(f, ":{}", tag),
            Selector::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}

/// A repository inside a storage location, without a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryReference {
    pub backend: StorageBackend,
    /// Bucket or container name
    pub location: String,
    /// Repository path, e.g. `team/app`
    pub repository: String,
}

impl RepositoryReference {
    /// Parse `<location>/<repository-path>`.
    pub fn parse(backend: StorageBackend, input: &str) -> Result<Self, ReferenceError> {
        let (location, repository) = split_location(backend, input, "location/repository")?;
        if repository.contains(':') || repository.contains('@') {
            return Err(ReferenceError::InvalidFormat {
                backend,
                input: input.to_string(),
                expected: "location/repository (without tag or digest)",
            });
        }
        validate_repository(repository)?;
        Ok(Self {
            backend,
            location: location.to_string(),
            repository: repository.to_string(),
        })
    }

    pub(crate) fn manifest_prefix(&self) -> String {
        manifest_prefix(&self.repository)
    }
}

impl fmt::Display for RepositoryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.backend, self.location, self.repository)
    }
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub backend: StorageBackend,
    /// Bucket or container name
    pub location: String,
    /// Repository path, e.g. `team/app`
    pub repository: String,
    pub selector: Selector,
}

impl ImageReference {
    /// Parse `<location>/<repository-path>[:<tag>|@<digest>]`.
    ///
    /// Exactly one of tag or digest must be present; there is no default tag.
    pub fn parse(backend: StorageBackend, input: &str) -> Result<Self, ReferenceError> {
        let (location, rest) = split_location(backend, input, "location/path:tag")?;

        // Split off digest first (@ separator)
        let (name, digest) = match rest.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (rest, None),
        };

        // Repository paths never contain ':', so the last one starts the tag
        let (repository, tag) = match name.rsplit_once(':') {
            Some((repository, tag)) => (repository, Some(tag)),
            None => (name, None),
        };

        validate_repository(repository)?;

        let selector = match (tag, digest) {
            (Some(_), Some(_)) => return Err(ReferenceError::AmbiguousSelector(input.to_string())),
            (None, None) => return Err(ReferenceError::MissingSelector(input.to_string())),
            (Some(tag), None) => {
                if !is_valid_tag(tag) {
                    return Err(ReferenceError::InvalidTag(tag.to_string()));
                }
                Selector::Tag(tag.to_string())
            }
            (None, Some(digest)) => {
                let digest = OciDigest::from_str(digest).map_err(|source| {
                    ReferenceError::InvalidDigest {
                        input: input.to_string(),
                        source,
                    }
                })?;
                Selector::Digest(digest)
            }
        };

        Ok(Self {
            backend,
            location: location.to_string(),
            repository: repository.to_string(),
            selector,
        })
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.selector {
            Selector::Tag(tag) => Some(tag),
            Selector::Digest(_) => None,
        }
    }

    pub fn digest(&self) -> Option<&OciDigest> {
        match &self.selector {
            Selector::Tag(_) => None,
            Selector::Digest(digest) => Some(digest),
        }
    }

    /// Storage key of the manifest this reference names.
    pub fn manifest_key(&self) -> String {
        match &self.selector {
            Selector::Tag(tag) => manifest_key(&self.repository, tag),
            Selector::Digest(digest) => manifest_key(&self.repository, &digest.to_string()),
        }
    }

    pub fn repository_reference(&self) -> RepositoryReference {
        RepositoryReference {
            backend: self.backend,
            location: self.location.clone(),
            repository: self.repository.clone(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}{}",
            self.backend, self.location, self.repository, self.selector
        )
    }
}

fn split_location<'a>(
    backend: StorageBackend,
    input: &'a str,
    expected: &'static str,
) -> Result<(&'a str, &'a str), ReferenceError> {
    let (location, rest) = input
        .split_once('/')
        .ok_or_else(|| ReferenceError::InvalidFormat {
            backend,
            input: input.to_string(),
            expected,
        })?;
    if location.trim().is_empty() {
        return Err(ReferenceError::EmptyLocation(input.to_string()));
    }
    if location.chars().any(|c| c.is_whitespace() || c == ':' || c == '@') {
        return Err(ReferenceError::InvalidFormat {
            backend,
            input: input.to_string(),
            expected,
        });
    }
    Ok((location, rest))
}

fn validate_repository(repository: &str) -> Result<(), ReferenceError> {
    if repository.is_empty() {
        return Err(ReferenceError::EmptyRepository(repository.to_string()));
    }
    let valid = repository.split('/').all(|component| {
        !component.is_empty()
            && component != "."
            && component != ".."
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
    });
    if !valid {
        return Err(ReferenceError::InvalidRepository(repository.to_string()));
    }
    Ok(())
}

/// `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => {}
        _ => return false,
    }
    tag.len() <= MAX_TAG_LEN && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
