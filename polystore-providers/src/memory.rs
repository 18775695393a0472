//! In-memory flat object store
//!
//! Stands in for the real object-store SDK at its interface boundary. It
//! reproduces the consistency quirk that matters to callers: listings lag
//! behind writes by a configurable number of list calls, while reads and
//! stats observe writes immediately. Backend faults can be queued to
//! exercise the retry harness.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use polystore_core::{
    address::{Address, Scheme},
    entry::{Entry, EntryKind},
    error::{StoreError, StoreResult},
    metadata::Metadata,
    operations::*,
    StorageBackend,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

struct StoredObject {
    data: Bytes,
    metadata: Metadata,
}

#[derive(Default)]
struct State {
    /// Objects by `bucket/key`
    objects: BTreeMap<String, StoredObject>,
    /// Keys not yet visible in listings, with remaining list calls to skip
    pending: HashMap<String, u32>,
    faults: VecDeque<StoreError>,
}

/// In-memory flat object backend
pub struct MemoryObjectBackend {
    name: String,
    list_lag: u32,
    state: Mutex<State>,
}

impl MemoryObjectBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            list_lag: 0,
            state: Mutex::new(State::default()),
        }
    }

    /// New writes stay invisible to the next `lag` list calls.
    pub fn with_list_lag(mut self, lag: u32) -> Self {
        self.list_lag = lag;
        self
    }

    /// Queues an error to be returned by the next backend call.
    pub fn inject_fault(&self, error: StoreError) {
        self.state.lock().faults.push_back(error);
    }

    fn take_fault(&self) -> StoreResult<()> {
        match self.state.lock().faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn full_key(addr: &Address) -> String {
        if addr.is_root() {
            addr.authority().to_string()
        } else {
            format!("{}/{}", addr.authority(), addr.key())
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryObjectBackend {
    fn scheme(&self) -> Scheme {
        Scheme::FlatObject
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, addr: &Address) -> StoreResult<Entry> {
        self.take_fault()?;
        let state = self.state.lock();
        let key = Self::full_key(addr);
        if let Some(stored) = state.objects.get(&key) {
            return Ok(Entry::file(addr.clone(), stored.metadata.clone()));
        }
        let prefix = format!("{key}/");
        if state.objects.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(Entry::directory(addr.clone(), Metadata::new()));
        }
        Err(StoreError::NotFound(addr.to_string()))
    }

    async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>> {
        self.take_fault()?;
        let mut state = self.state.lock();

        // One listing observed: age every pending write by one call.
        let visible: BTreeSet<String> = state
            .objects
            .keys()
            .filter(|k| !state.pending.contains_key(*k))
            .cloned()
            .collect();
        state.pending.retain(|_, remaining| {
            *remaining -= 1;
            *remaining > 0
        });

        let prefix = format!("{}/", Self::full_key(addr));
        let mut entries = Vec::new();
        let mut seen_dirs = BTreeSet::new();
        for key in visible.iter().filter(|k| k.starts_with(&prefix)) {
            let rel = &key[prefix.len()..];
            if options.recursive || !rel.contains('/') {
                let child = addr.join(rel);
                let metadata = state.objects[key].metadata.clone();
                entries.push(Entry::file(child, metadata));
            } else {
                // Immediate child "directory" synthesized from deeper keys
                let dir = rel.split('/').next().unwrap_or(rel);
                if seen_dirs.insert(dir.to_string()) {
                    entries.push(Entry::directory(addr.join(dir), Metadata::new()));
                }
            }
            if options.limit.is_some_and(|n| entries.len() >= n) {
                break;
            }
        }
        Ok(entries)
    }

    async fn get(&self, addr: &Address, options: &ReadOptions) -> StoreResult<Bytes> {
        self.take_fault()?;
        let state = self.state.lock();
        let stored = state
            .objects
            .get(&Self::full_key(addr))
            .ok_or_else(|| StoreError::NotFound(addr.to_string()))?;
        match options.range {
            Some((start, end)) => {
                let len = stored.data.len() as u64;
                if start > len || end > len || start > end {
                    return Err(StoreError::Other(format!(
                        "range {start}..{end} out of bounds for {addr} (len {len})"
                    )));
                }
                Ok(stored.data.slice(start as usize..end as usize))
            }
            None => Ok(stored.data.clone()),
        }
    }

    async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry> {
        self.take_fault()?;
        let mut state = self.state.lock();
        let key = Self::full_key(addr);
        if !options.overwrite && state.objects.contains_key(&key) {
            return Err(StoreError::TargetExists(addr.to_string()));
        }

        let metadata = Metadata::new()
            .with_size(data.len() as u64)
            .with_modified(Utc::now())
            .with_content_hash(blake3::hash(&data).to_hex().to_string());
        debug!(address = %addr, size = data.len(), "memory put");
        state.objects.insert(key.clone(), StoredObject { data, metadata: metadata.clone() });
        if self.list_lag > 0 {
            state.pending.insert(key, self.list_lag);
        }
        Ok(Entry::file(addr.clone(), metadata))
    }

    async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()> {
        self.take_fault()?;
        let mut state = self.state.lock();
        let key = Self::full_key(addr);
        if state.objects.remove(&key).is_some() {
            state.pending.remove(&key);
            return Ok(());
        }
        if options.recursive {
            let prefix = format!("{key}/");
            let doomed: Vec<String> = state
                .objects
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            if !doomed.is_empty() {
                for k in doomed {
                    state.objects.remove(&k);
                    state.pending.remove(&k);
                }
                return Ok(());
            }
        }
        if options.force {
            Ok(())
        } else {
            Err(StoreError::NotFound(addr.to_string()))
        }
    }

    async fn post_metadata(&self, addr: &Address, metadata: &Metadata) -> StoreResult<()> {
        self.take_fault()?;
        let mut state = self.state.lock();
        let stored = state
            .objects
            .get_mut(&Self::full_key(addr))
            .ok_or_else(|| StoreError::NotFound(addr.to_string()))?;
        if metadata.content_type.is_some() {
            stored.metadata.content_type = metadata.content_type.clone();
        }
        stored
            .metadata
            .custom
            .extend(metadata.custom.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn coalesce(&self, dest: &Address, parts: &[Address]) -> StoreResult<Entry> {
        self.take_fault()?;
        let mut assembled = Vec::new();
        {
            let state = self.state.lock();
            for part in parts {
                let stored = state
                    .objects
                    .get(&Self::full_key(part))
                    .ok_or_else(|| StoreError::NotFound(part.to_string()))?;
                assembled.extend_from_slice(&stored.data);
            }
        }
        let entry = self.put(dest, Bytes::from(assembled), &WriteOptions::default()).await?;
        for part in parts {
            self.delete(part, &DeleteOptions::default()).await?;
        }
        Ok(entry)
    }
}
