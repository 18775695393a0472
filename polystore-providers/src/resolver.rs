//! Virtual ⇄ canonical identity resolution
//!
//! Names on the dual-identity platform are mutable labels over immutable
//! content ids, and nothing stops two objects from sharing a label. The
//! resolver turns a virtual address into the unique canonical one (or
//! refuses, loudly) and back again. Results are memoized per resolver
//! instance: platform ids are immutable, so entries never go stale, and a
//! fresh resolver per logical operation bounds how old the name mappings
//! can be.

use parking_lot::Mutex;
use polystore_core::{
    address::{is_canonical_id, Address, Identity, Scheme},
    error::{StoreError, StoreResult},
    retry::{self, any_result, RetryPolicy},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::platform::DualIdentityApi;

#[derive(Default)]
struct Cache {
    /// virtual address -> canonical address
    forward: HashMap<Address, Address>,
    /// canonical address -> virtual address
    reverse: HashMap<Address, Address>,
    /// project name -> project id
    projects: HashMap<String, String>,
}

/// Resolver for dual-identity addresses
pub struct CanonicalResolver {
    api: Arc<dyn DualIdentityApi>,
    policy: RetryPolicy,
    cache: Mutex<Cache>,
}

impl CanonicalResolver {
    pub fn new(api: Arc<dyn DualIdentityApi>, policy: RetryPolicy) -> Self {
        Self { api, policy, cache: Mutex::new(Cache::default()) }
    }

    /// Drops every memoized mapping. Needed after out-of-band renames.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        cache.forward.clear();
        cache.reverse.clear();
        cache.projects.clear();
    }

    fn check_scheme(addr: &Address) -> StoreResult<()> {
        if addr.scheme() != Scheme::DualIdentity {
            return Err(StoreError::Unsupported(format!(
                "resolution only applies to dual-identity addresses: {addr}"
            )));
        }
        Ok(())
    }

    /// Resolves the project component to its canonical id.
    pub async fn canonical_project(&self, addr: &Address) -> StoreResult<String> {
        Self::check_scheme(addr)?;
        let project = addr.authority();
        if is_canonical_id(project, "proj") {
            return Ok(project.to_string());
        }
        if let Some(id) = self.cache.lock().projects.get(project) {
            return Ok(id.clone());
        }

        let api = self.api.clone();
        let name = project.to_string();
        let matches = retry::execute(
            || api.find_projects(&name),
            any_result,
            &self.policy,
        )
        .await?;

        let id = match matches.len() {
            0 => {
                return Err(StoreError::NotFound(format!(
                    "no project found for name: {project}"
                )))
            }
            1 => matches[0].id.clone(),
            _ => {
                return Err(StoreError::DuplicateName(format!(
                    "found more than one project for name: {project}"
                )))
            }
        };
        self.cache.lock().projects.insert(name, id.clone());
        Ok(id)
    }

    /// Resolves a virtual address to its canonical form.
    ///
    /// Folder addresses never canonicalize: folders are metadata only on
    /// the platform. Ambiguity (several objects sharing the name) is an
    /// error the caller can only break by supplying a canonical id.
    pub async fn canonicalize(&self, addr: &Address) -> StoreResult<Address> {
        Self::check_scheme(addr)?;
        if addr.is_dir_hint() {
            return Err(StoreError::NoCanonicalForm(addr.to_string()));
        }
        if let Some(hit) = self.cache.lock().forward.get(addr) {
            return Ok(hit.clone());
        }

        let project_id = self.canonical_project(addr).await?;
        let canonical = if addr.is_root() {
            Address::dual(project_id, "")
        } else if addr.identity() == Some(Identity::Canonical) {
            addr.clone()
        } else if addr.segments().len() == 1 && is_canonical_id(&addr.resource(), "obj") {
            // Canonical resource inside a virtually-named project
            Address::dual(project_id, addr.resource())
        } else {
            let name = addr
                .name()
                .ok_or_else(|| StoreError::MalformedAddress(addr.to_string()))?
                .to_string();
            let folder = addr.folder();
            let api = self.api.clone();
            let pid = project_id.clone();
            let matches = retry::execute(
                || api.find_objects(&pid, &folder, &name),
                any_result,
                &self.policy,
            )
            .await?;

            match matches.len() {
                0 => {
                    return Err(StoreError::NotFound(format!(
                        "no object found for path: {addr}"
                    )))
                }
                1 => Address::dual(project_id, &matches[0].id),
                _ => {
                    return Err(StoreError::DuplicateName(format!(
                        "multiple objects found at path {addr}, supply a canonical id instead"
                    )))
                }
            }
        };

        debug!(virtual = %addr, canonical = %canonical, "resolved address");
        let mut cache = self.cache.lock();
        cache.forward.insert(addr.clone(), canonical.clone());
        // First mapping wins; platform ids are immutable.
        cache.reverse.entry(canonical.clone()).or_insert_with(|| addr.clone());
        Ok(canonical)
    }

    /// Resolves a canonical address back to its virtual form.
    pub async fn virtualize(&self, addr: &Address) -> StoreResult<Address> {
        Self::check_scheme(addr)?;
        if addr.identity() == Some(Identity::Virtual) {
            return Ok(addr.clone());
        }
        if let Some(hit) = self.cache.lock().reverse.get(addr) {
            return Ok(hit.clone());
        }

        let api = self.api.clone();
        let project_id = addr.authority().to_string();
        let project = retry::execute(
            || api.describe_project(&project_id),
            any_result,
            &self.policy,
        )
        .await?;

        let virtual_addr = if addr.is_root() {
            Address::dual(project.name, "")
        } else {
            let object_id = addr.resource();
            let api = self.api.clone();
            let record = retry::execute(
                || api.describe_object(&object_id),
                any_result,
                &self.policy,
            )
            .await?;
            let resource = if record.folder == "/" {
                record.name.clone()
            } else {
                format!("{}/{}", record.folder.trim_start_matches('/'), record.name)
            };
            Address::dual(project.name, resource)
        };

        let mut cache = self.cache.lock();
        cache.reverse.insert(addr.clone(), virtual_addr.clone());
        cache.forward.entry(virtual_addr.clone()).or_insert_with(|| addr.clone());
        Ok(virtual_addr)
    }
}
