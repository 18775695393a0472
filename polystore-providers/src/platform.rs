//! Dual-identity platform backend
//!
//! The platform stores immutable objects addressed by opaque canonical ids
//! (`obj-...`) inside projects (`proj-...`), with a mutable layer of
//! human-readable folder/name labels on top. Folders are metadata only and
//! have no canonical form. A name can denote an object and a folder at the
//! same time; which interpretation applies is decided by the operation, not
//! by the name.
//!
//! The real platform SDK sits behind [`DualIdentityApi`];
//! [`InMemoryPlatform`] implements it for tests and local development.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use polystore_core::{
    address::{Address, Scheme},
    entry::{Entry, EntryKind},
    error::{StoreError, StoreResult},
    metadata::Metadata,
    operations::*,
    retry::RetryPolicy,
    StorageBackend,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::resolver::CanonicalResolver;

/// A project as the platform reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
}

/// An object as the platform reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub id: String,
    pub project: String,
    /// Containing folder, `/`-rooted (`/` for the project root)
    pub folder: String,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub content_hash: String,
}

/// SDK boundary for the dual-identity platform.
///
/// Every method maps onto one platform API call; errors come back already
/// classified into `StoreError` variants.
#[async_trait]
pub trait DualIdentityApi: Send + Sync {
    async fn find_projects(&self, name: &str) -> StoreResult<Vec<ProjectRecord>>;
    async fn describe_project(&self, id: &str) -> StoreResult<ProjectRecord>;
    /// All objects labeled `name` directly inside `folder`
    async fn find_objects(
        &self,
        project: &str,
        folder: &str,
        name: &str,
    ) -> StoreResult<Vec<ObjectRecord>>;
    async fn describe_object(&self, id: &str) -> StoreResult<ObjectRecord>;
    async fn list_folder(
        &self,
        project: &str,
        folder: &str,
        recursive: bool,
    ) -> StoreResult<Vec<ObjectRecord>>;
    async fn list_subfolders(&self, project: &str, folder: &str) -> StoreResult<Vec<String>>;
    async fn folder_exists(&self, project: &str, folder: &str) -> StoreResult<bool>;
    async fn read_object(
        &self,
        project: &str,
        id: &str,
        range: Option<(u64, u64)>,
    ) -> StoreResult<Bytes>;
    /// Writes (or replaces) the object labeled `folder`/`name`. The
    /// replacement gets a fresh canonical id; content is immutable.
    async fn write_object(
        &self,
        project: &str,
        folder: &str,
        name: &str,
        data: Bytes,
    ) -> StoreResult<ObjectRecord>;
    async fn remove_object(&self, project: &str, id: &str) -> StoreResult<()>;
    async fn set_properties(
        &self,
        project: &str,
        id: &str,
        properties: &HashMap<String, String>,
    ) -> StoreResult<()>;
}

fn norm_folder(folder: &str) -> String {
    let trimmed = folder.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

struct StoredPlatformObject {
    record: ObjectRecord,
    data: Bytes,
    properties: HashMap<String, String>,
}

#[derive(Default)]
struct PlatformState {
    projects: Vec<ProjectRecord>,
    objects: HashMap<String, StoredPlatformObject>,
    folders: HashSet<(String, String)>,
    faults: VecDeque<StoreError>,
}

/// In-memory implementation of the platform API
#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<PlatformState>,
    id_counter: AtomicU64,
    api_calls: AtomicU64,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of API-boundary calls made so far
    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::SeqCst)
    }

    /// Queues an error for the next API call
    pub fn inject_fault(&self, error: StoreError) {
        self.state.lock().faults.push_back(error);
    }

    pub fn add_project(&self, name: impl Into<String>) -> String {
        let id = self.next_id("proj");
        self.state.lock().projects.push(ProjectRecord { id: id.clone(), name: name.into() });
        id
    }

    pub fn create_folder(&self, project: &str, folder: &str) {
        let mut state = self.state.lock();
        Self::register_folders(&mut state, project, &norm_folder(folder));
    }

    /// Adds a second object under an existing label, producing the
    /// duplicate-name situation resolution must refuse to guess about.
    pub async fn write_object_duplicate(
        &self,
        project: &str,
        folder: &str,
        name: &str,
        data: Bytes,
    ) -> StoreResult<ObjectRecord> {
        self.insert_object(project, folder, name, data, false)
    }

    pub async fn write_object(
        &self,
        project: &str,
        folder: &str,
        name: &str,
        data: Bytes,
    ) -> StoreResult<ObjectRecord> {
        self.insert_object(project, folder, name, data, true)
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n:024}")
    }

    fn bump(&self) -> StoreResult<()> {
        self.api_calls.fetch_add(1, Ordering::SeqCst);
        match self.state.lock().faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn register_folders(state: &mut PlatformState, project: &str, folder: &str) {
        let mut path = String::new();
        for seg in folder.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(seg);
            state.folders.insert((project.to_string(), path.clone()));
        }
    }

    fn insert_object(
        &self,
        project: &str,
        folder: &str,
        name: &str,
        data: Bytes,
        replace: bool,
    ) -> StoreResult<ObjectRecord> {
        let folder = norm_folder(folder);
        let id = self.next_id("obj");
        let mut state = self.state.lock();
        if !state.projects.iter().any(|p| p.id == project) {
            return Err(StoreError::NotFound(format!("no such project: {project}")));
        }
        if replace {
            state.objects.retain(|_, o| {
                !(o.record.project == project && o.record.folder == folder && o.record.name == name)
            });
        }
        Self::register_folders(&mut state, project, &folder);
        let record = ObjectRecord {
            id: id.clone(),
            project: project.to_string(),
            folder,
            name: name.to_string(),
            size: data.len() as u64,
            modified: Utc::now(),
            content_hash: blake3::hash(&data).to_hex().to_string(),
        };
        state.objects.insert(
            id,
            StoredPlatformObject { record: record.clone(), data, properties: HashMap::new() },
        );
        Ok(record)
    }
}

#[async_trait]
impl DualIdentityApi for InMemoryPlatform {
    async fn find_projects(&self, name: &str) -> StoreResult<Vec<ProjectRecord>> {
        self.bump()?;
        Ok(self
            .state
            .lock()
            .projects
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect())
    }

    async fn describe_project(&self, id: &str) -> StoreResult<ProjectRecord> {
        self.bump()?;
        self.state
            .lock()
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("no such project: {id}")))
    }

    async fn find_objects(
        &self,
        project: &str,
        folder: &str,
        name: &str,
    ) -> StoreResult<Vec<ObjectRecord>> {
        self.bump()?;
        let folder = norm_folder(folder);
        Ok(self
            .state
            .lock()
            .objects
            .values()
            .filter(|o| {
                o.record.project == project && o.record.folder == folder && o.record.name == name
            })
            .map(|o| o.record.clone())
            .collect())
    }

    async fn describe_object(&self, id: &str) -> StoreResult<ObjectRecord> {
        self.bump()?;
        self.state
            .lock()
            .objects
            .get(id)
            .map(|o| o.record.clone())
            .ok_or_else(|| StoreError::NotFound(format!("no such object: {id}")))
    }

    async fn list_folder(
        &self,
        project: &str,
        folder: &str,
        recursive: bool,
    ) -> StoreResult<Vec<ObjectRecord>> {
        self.bump()?;
        let folder = norm_folder(folder);
        let prefix = if folder == "/" { "/".to_string() } else { format!("{folder}/") };
        let mut records: Vec<ObjectRecord> = self
            .state
            .lock()
            .objects
            .values()
            .filter(|o| o.record.project == project)
            .filter(|o| {
                o.record.folder == folder
                    || (recursive && o.record.folder.starts_with(prefix.as_str()))
            })
            .map(|o| o.record.clone())
            .collect();
        records.sort_by(|a, b| (&a.folder, &a.name).cmp(&(&b.folder, &b.name)));
        Ok(records)
    }

    async fn list_subfolders(&self, project: &str, folder: &str) -> StoreResult<Vec<String>> {
        self.bump()?;
        let folder = norm_folder(folder);
        let prefix = if folder == "/" { "/".to_string() } else { format!("{folder}/") };
        let mut subs: Vec<String> = self
            .state
            .lock()
            .folders
            .iter()
            .filter(|(p, f)| {
                p == project && f.starts_with(prefix.as_str()) && !f[prefix.len()..].contains('/')
            })
            .map(|(_, f)| f.clone())
            .collect();
        subs.sort();
        Ok(subs)
    }

    async fn folder_exists(&self, project: &str, folder: &str) -> StoreResult<bool> {
        self.bump()?;
        let folder = norm_folder(folder);
        if folder == "/" {
            return Ok(self.state.lock().projects.iter().any(|p| p.id == project));
        }
        Ok(self
            .state
            .lock()
            .folders
            .contains(&(project.to_string(), folder)))
    }

    async fn read_object(
        &self,
        _project: &str,
        id: &str,
        range: Option<(u64, u64)>,
    ) -> StoreResult<Bytes> {
        self.bump()?;
        let state = self.state.lock();
        let stored = state
            .objects
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("no such object: {id}")))?;
        match range {
            Some((start, end)) => {
                let len = stored.data.len() as u64;
                if start > len || end > len || start > end {
                    return Err(StoreError::Other(format!(
                        "range {start}..{end} out of bounds for {id} (len {len})"
                    )));
                }
                Ok(stored.data.slice(start as usize..end as usize))
            }
            None => Ok(stored.data.clone()),
        }
    }

    async fn write_object(
        &self,
        project: &str,
        folder: &str,
        name: &str,
        data: Bytes,
    ) -> StoreResult<ObjectRecord> {
        self.bump()?;
        self.insert_object(project, folder, name, data, true)
    }

    async fn remove_object(&self, project: &str, id: &str) -> StoreResult<()> {
        self.bump()?;
        let mut state = self.state.lock();
        match state.objects.remove(id) {
            Some(o) if o.record.project == project => Ok(()),
            Some(o) => {
                // Wrong project: put it back untouched.
                state.objects.insert(id.to_string(), o);
                Err(StoreError::NotFound(format!("object {id} not in project {project}")))
            }
            None => Err(StoreError::NotFound(format!("no such object: {id}"))),
        }
    }

    async fn set_properties(
        &self,
        project: &str,
        id: &str,
        properties: &HashMap<String, String>,
    ) -> StoreResult<()> {
        self.bump()?;
        let mut state = self.state.lock();
        let stored = state
            .objects
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("no such object: {id}")))?;
        if stored.record.project != project {
            return Err(StoreError::NotFound(format!("object {id} not in project {project}")));
        }
        stored
            .properties
            .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

fn entry_from_record(addr: Address, record: &ObjectRecord) -> Entry {
    let metadata = Metadata::new()
        .with_size(record.size)
        .with_modified(record.modified)
        .with_content_hash(record.content_hash.clone())
        .with_remote_id(record.id.clone());
    Entry { address: addr, kind: EntryKind::File, metadata }
}

/// `StorageBackend` adapter over a dual-identity platform
pub struct DualIdentityBackend {
    name: String,
    api: Arc<dyn DualIdentityApi>,
    resolver: CanonicalResolver,
}

impl DualIdentityBackend {
    pub fn new(name: impl Into<String>, api: Arc<dyn DualIdentityApi>, policy: RetryPolicy) -> Self {
        let resolver = CanonicalResolver::new(api.clone(), policy);
        Self { name: name.into(), api, resolver }
    }

    pub fn resolver(&self) -> &CanonicalResolver {
        &self.resolver
    }

    fn object_id(canonical: &Address) -> StoreResult<String> {
        canonical
            .name()
            .map(str::to_string)
            .ok_or_else(|| StoreError::MalformedAddress(canonical.to_string()))
    }
}

#[async_trait]
impl StorageBackend for DualIdentityBackend {
    fn scheme(&self) -> Scheme {
        Scheme::DualIdentity
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, addr: &Address) -> StoreResult<Entry> {
        if addr.is_root() {
            let project_id = self.resolver.canonical_project(addr).await?;
            let project = self.api.describe_project(&project_id).await?;
            let metadata = Metadata::new().with_remote_id(project.id);
            return Ok(Entry::directory(addr.clone(), metadata));
        }
        if addr.is_dir_hint() {
            // Folder interpretation: folders are metadata only.
            let project_id = self.resolver.canonical_project(addr).await?;
            let folder = format!("/{}", addr.resource());
            if self.api.folder_exists(&project_id, &folder).await? {
                return Ok(Entry::directory(addr.clone(), Metadata::new()));
            }
            return Err(StoreError::NotFound(addr.to_string()));
        }
        let canonical = self.resolver.canonicalize(addr).await?;
        let record = self.api.describe_object(&Self::object_id(&canonical)?).await?;
        Ok(entry_from_record(addr.clone(), &record))
    }

    async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>> {
        // Listing always takes the folder interpretation of the address.
        let project_id = self.resolver.canonical_project(addr).await?;
        let base = norm_folder(&addr.resource());
        let records = self.api.list_folder(&project_id, &base, options.recursive).await?;

        let mut entries = Vec::new();
        if !options.recursive {
            for sub in self.api.list_subfolders(&project_id, &base).await? {
                let name = sub.rsplit('/').next().unwrap_or(&sub);
                entries.push(Entry::directory(
                    addr.join(format!("{name}/")),
                    Metadata::new(),
                ));
            }
        }
        for record in records {
            let rel = if record.folder == base {
                record.name.clone()
            } else {
                let nested = record.folder[base.len()..].trim_start_matches('/');
                format!("{nested}/{}", record.name)
            };
            entries.push(entry_from_record(addr.join(rel), &record));
            if options.limit.is_some_and(|n| entries.len() >= n) {
                break;
            }
        }
        Ok(entries)
    }

    async fn get(&self, addr: &Address, options: &ReadOptions) -> StoreResult<Bytes> {
        let canonical = self.resolver.canonicalize(addr).await?;
        self.api
            .read_object(canonical.authority(), &Self::object_id(&canonical)?, options.range)
            .await
    }

    async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry> {
        if addr.is_root() || addr.is_dir_hint() {
            return Err(StoreError::Unsupported(format!(
                "cannot write to a folder path: {addr}"
            )));
        }
        if !options.overwrite && self.stat(addr).await.is_ok() {
            return Err(StoreError::TargetExists(addr.to_string()));
        }
        let project_id = self.resolver.canonical_project(addr).await?;
        let name = addr
            .name()
            .ok_or_else(|| StoreError::MalformedAddress(addr.to_string()))?;
        debug!(address = %addr, size = data.len(), "platform write");
        let record = self.api.write_object(&project_id, &addr.folder(), name, data).await?;
        Ok(entry_from_record(addr.clone(), &record))
    }

    async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()> {
        if addr.is_dir_hint() || addr.is_root() {
            if !options.recursive {
                return Err(StoreError::Unsupported(format!(
                    "deleting a folder requires recursive: {addr}"
                )));
            }
            let project_id = self.resolver.canonical_project(addr).await?;
            let base = norm_folder(&addr.resource());
            for record in self.api.list_folder(&project_id, &base, true).await? {
                self.api.remove_object(&project_id, &record.id).await?;
            }
            return Ok(());
        }
        let canonical = self.resolver.canonicalize(addr).await?;
        self.api
            .remove_object(canonical.authority(), &Self::object_id(&canonical)?)
            .await
    }

    async fn post_metadata(&self, addr: &Address, metadata: &Metadata) -> StoreResult<()> {
        let canonical = self.resolver.canonicalize(addr).await?;
        self.api
            .set_properties(
                canonical.authority(),
                &Self::object_id(&canonical)?,
                &metadata.custom,
            )
            .await
    }

    async fn coalesce(&self, dest: &Address, parts: &[Address]) -> StoreResult<Entry> {
        let mut assembled = Vec::new();
        for part in parts {
            let data = self.get(part, &ReadOptions::default()).await?;
            assembled.extend_from_slice(&data);
        }
        let entry = self.put(dest, Bytes::from(assembled), &WriteOptions::default()).await?;
        for part in parts {
            self.delete(part, &DeleteOptions::default()).await?;
        }
        Ok(entry)
    }
}
