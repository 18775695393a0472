//! polystore Core
//!
//! Core types for the unified storage path layer: the address model, the
//! backend trait, error taxonomy, the condition-gated retry harness, and
//! the settings context.

pub mod address;
pub mod backend;
pub mod entry;
pub mod error;
pub mod metadata;
pub mod operations;
pub mod retry;
pub mod settings;

pub use address::{Address, Identity, Scheme};
pub use backend::StorageBackend;
pub use entry::{Entry, EntryKind};
pub use error::{StoreError, StoreResult, UnitFailure};
pub use metadata::Metadata;
pub use retry::RetryPolicy;
pub use settings::{Settings, TransferSettings};
