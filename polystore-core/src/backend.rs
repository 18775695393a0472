//! Storage backend trait

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    address::{Address, Scheme},
    entry::Entry,
    error::{StoreError, StoreResult},
    metadata::Metadata,
    operations::*,
};

/// The primitive surface every backend exposes.
///
/// Errors are classified through [`StoreError::is_transient`]; the retry
/// harness consults that classification, backends only have to map their
/// native failures onto the right variants.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Scheme this backend serves
    fn scheme(&self) -> Scheme;

    /// Registry/display name
    fn name(&self) -> &str;

    async fn stat(&self, addr: &Address) -> StoreResult<Entry>;

    async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>>;

    async fn get(&self, addr: &Address, options: &ReadOptions) -> StoreResult<Bytes>;

    async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry>;

    async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()>;

    async fn post_metadata(&self, addr: &Address, metadata: &Metadata) -> StoreResult<()>;

    /// Assembles previously staged segment objects into `dest`, consuming
    /// the parts. Backends without segmented writes keep the default.
    async fn coalesce(&self, dest: &Address, _parts: &[Address]) -> StoreResult<Entry> {
        Err(StoreError::Unsupported(format!(
            "segmented writes not supported for {dest}"
        )))
    }
}
