// Shared Object Storage
//
// Abstraction over the warehouse every node writes into. Keys are
// `/`-separated paths relative to the warehouse root.
//
// The only coordination primitive required from a backend is
// `put_if_absent`: an atomic, all-or-nothing create that fails when the
// key already exists. Catalog versions and lease records are built on it.

use async_trait::async_trait;
use bytes::Bytes;

pub mod local;
pub mod memory;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("i/o error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(key.to_string()),
            _ => StorageError::Io {
                key: key.to_string(),
                source,
            },
        }
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// Storage backend for segments, pending entries, lease records and
/// table metadata.
///
/// Implementations must guarantee:
/// - `put` and `put_if_absent` never expose partially written objects
/// - `put_if_absent` succeeds for exactly one of several concurrent callers
/// - `list` returns entries sorted by key
/// - `delete` of a missing key succeeds
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Create `key` only if it does not exist yet.
    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn head(&self, key: &str) -> Result<ObjectMeta, StorageError>;

    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
