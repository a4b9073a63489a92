//! Ordered key/value persistence for vat state, with in-memory and
//! filesystem-backed implementations.

mod fs;
mod mem;

pub use fs::FsVatstore;
pub use mem::MemVatstore;

use std::sync::Arc;

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to a vatstore implementation.
pub type DynVatstore = Arc<dyn Vatstore>;

/// Ordered key/value contract consumed by the virtual object layer.
///
/// Keys are UTF-8 strings compared lexicographically; values are opaque
/// byte blobs. A write is durable once the call returns.
pub trait Vatstore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Deleting an absent key is a no-op.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// First entry whose key is strictly greater than `prior` and starts
    /// with `prefix`, or `None` when no such entry exists. Passing an empty
    /// `prior` starts the scan from the beginning.
    fn get_after(&self, prior: &str, prefix: &str) -> StoreResult<Option<(String, Vec<u8>)>>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("corrupt store log: {0}")]
    Corrupt(String),
}
