pub mod cli;
pub mod config;
pub mod error;
pub mod layout;
pub mod operations;
pub mod reference;
pub mod storage;
pub mod transfer;
pub mod validate;

// Re-export the types most callers need
pub use config::{AppConfig, StorageBackend, TransferSettings};
pub use error::{AppError, Result};
pub use layout::{Blob, LocalImage};
pub use operations::{
    delete_image, list_tags, pull_image, push_image, ImageSource, PullRequest, PushRequest,
};
pub use reference::{ImageReference, RepositoryReference, Selector};
pub use storage::{BlobStore, MemoryStore, StorageError};
pub use transfer::{PulledImage, PushReport, TransferEngine};
