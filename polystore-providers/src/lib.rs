//! Storage providers for polystore
//!
//! Concrete backends behind the `StorageBackend` trait (local filesystem,
//! in-memory flat object store, dual-identity platform), the canonical
//! resolver, and the dispatcher that maps addresses onto backends.
//!
//! The real object-store and platform SDKs live outside this workspace;
//! the seams they plug into are the `StorageBackend` and `DualIdentityApi`
//! traits.

pub mod local;
pub mod memory;
pub mod platform;
pub mod resolver;

pub use local::LocalBackend;
pub use memory::MemoryObjectBackend;
pub use platform::{
    DualIdentityApi, DualIdentityBackend, InMemoryPlatform, ObjectRecord, ProjectRecord,
};
pub use resolver::CanonicalResolver;

use polystore_core::{Address, StorageBackend, StoreError, StoreResult};
use std::sync::Arc;

/// Claim predicate: inspects an address and accepts or declines it
pub type ClaimFn = fn(&Address) -> bool;

struct Registration {
    prefix: String,
    claim: ClaimFn,
    backend: Arc<dyn StorageBackend>,
}

/// Maps address prefixes onto registered backends.
///
/// Backends are registered once, explicitly, at setup time. Dispatch is a
/// pure lookup with no retry semantics.
pub struct BackendDispatcher {
    registrations: Vec<Registration>,
}

impl BackendDispatcher {
    pub fn new() -> Self {
        Self { registrations: Vec::new() }
    }

    /// Registers a backend under a prefix. Fails with
    /// [`StoreError::Configuration`] when the prefix is already claimed.
    pub fn register(
        &mut self,
        prefix: impl Into<String>,
        claim: ClaimFn,
        backend: Arc<dyn StorageBackend>,
    ) -> StoreResult<()> {
        let prefix = prefix.into();
        if self.registrations.iter().any(|r| r.prefix == prefix) {
            return Err(StoreError::Configuration(format!(
                "prefix already registered: {prefix}"
            )));
        }
        self.registrations.push(Registration { prefix, claim, backend });
        Ok(())
    }

    /// Resolves an address to the backend that claims it.
    pub fn resolve(&self, addr: &Address) -> StoreResult<Arc<dyn StorageBackend>> {
        self.registrations
            .iter()
            .find(|r| (r.claim)(addr))
            .map(|r| r.backend.clone())
            .ok_or_else(|| {
                StoreError::UnregisteredBackend(format!(
                    "{addr} (registered prefixes: {})",
                    self.prefixes().join(", ")
                ))
            })
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.prefix.as_str()).collect()
    }
}

impl Default for BackendDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
