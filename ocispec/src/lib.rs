pub mod digest;
pub mod manifest;
pub mod models;

// Re-export main types for convenience
pub use digest::{DigestAlgorithm, DigestError, OciDigest};
pub use manifest::{parse_manifest, serialize_manifest, ManifestError};
pub use models::{DigestMismatch, Descriptor, ImageIndex, ImageManifest, Platform};
