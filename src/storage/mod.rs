use async_trait::async_trait;

pub mod memory;
pub mod webdav;

pub use memory::MemoryStore;
pub use webdav::WebdavStore;

/// Flat blob store shared by every process in the pipeline. Paths are
/// `/`-separated and relative to the store root; `rename` is the only
/// primitive with atomicity guarantees and the whole queue protocol
/// leans on it.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Create or overwrite the blob at `path`.
    async fn put(&self, path: &str, body: &[u8]) -> Result<(), StorageError>;

    /// Fetch the blob at `path`, `NotFound` if absent.
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Names of the blobs directly under `prefix`, no recursion, no
    /// directory entries. A missing prefix lists as empty.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Delete the blob at `path`. Deleting an absent blob succeeds.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Atomically move `from` to `to`, failing with `AlreadyExists` if
    /// `to` is taken and `NotFound` if `from` vanished. Exactly one of
    /// any set of concurrent movers of the same `from` wins.
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Make sure `prefix` exists as a listable location. Stores without
    /// directory semantics can ignore this.
    async fn ensure_prefix(&self, _prefix: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("authentication rejected by storage")]
    Auth,
    #[error("storage returned {status} for {path}")]
    Status { status: u16, path: String },
    #[error("network error talking to storage: {0}")]
    Network(#[from] reqwest::Error),
    #[error("storage protocol error: {0}")]
    Protocol(String),
}

impl StorageError {
    /// Worth retrying after a pause: the store or the path to it
    /// hiccuped, rather than telling us something definitive.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Network(_) => true,
            StorageError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
