//! Transfer orchestrator
//!
//! Copies files and trees between backends. A tree transfer fans out into
//! independent units gated by an object-level semaphore; a unit larger than
//! the configured segment size fans out again into ranged reads gated by a
//! segment-level semaphore, staged beside the destination and coalesced
//! once every part landed. Each unit is wrapped in the retry harness; a
//! fatal error (authorization, configuration) flips an abort flag that
//! stops units that have not started yet and fails the call with that
//! error; in-flight units finish naturally.
//!
//! Remote-to-remote transfers are not routed through this process and are
//! rejected up front.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use polystore_core::{
    address::{Address, Scheme},
    entry::Entry,
    error::{StoreError, StoreResult, UnitFailure},
    operations::*,
    retry::{self, any_result, RetryPolicy},
    Settings, StorageBackend, TransferSettings,
};
use polystore_providers::BackendDispatcher;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::manifest::{self, ManifestEntry, MANIFEST_NAME};
use crate::plan::{plan_segments, TransferUnit};
use crate::progress::{NoopProgress, ProgressSink};

/// Outcome of a successful transfer
#[derive(Debug, Default)]
pub struct TransferReport {
    /// Normalized source addresses of units that moved data
    pub transferred: Vec<String>,
    /// Normalized source addresses of units skipped by a skip policy
    pub skipped: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

/// Orchestrates copies between registered backends
pub struct TransferOrchestrator {
    dispatcher: Arc<BackendDispatcher>,
    settings: Settings,
    progress: Arc<dyn ProgressSink>,
}

struct UnitContext {
    src: Arc<dyn StorageBackend>,
    dst: Arc<dyn StorageBackend>,
    settings: TransferSettings,
    policy: RetryPolicy,
    object_permits: Arc<Semaphore>,
    segment_permits: Arc<Semaphore>,
    abort: Arc<AtomicBool>,
}

enum UnitOutcome {
    Transferred(u64),
    Skipped,
    Aborted,
}

impl TransferOrchestrator {
    pub fn new(dispatcher: Arc<BackendDispatcher>, settings: Settings) -> Self {
        Self { dispatcher, settings, progress: Arc::new(NoopProgress) }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Uploads a local tree to a remote destination.
    pub async fn upload(&self, source: &Address, dest: &Address) -> StoreResult<TransferReport> {
        if source.scheme() != Scheme::Local {
            return Err(StoreError::Unsupported(format!(
                "upload source must be local: {source}"
            )));
        }
        self.copy_tree(source, dest).await
    }

    /// Downloads a remote tree to a local destination.
    pub async fn download(&self, source: &Address, dest: &Address) -> StoreResult<TransferReport> {
        if dest.scheme() != Scheme::Local {
            return Err(StoreError::Unsupported(format!(
                "download destination must be local: {dest}"
            )));
        }
        self.copy_tree(source, dest).await
    }

    /// Copies a single file. A directory-shaped destination (trailing
    /// slash, or an existing directory) receives the file under its source
    /// name; an existing file destination is overwritten.
    pub async fn copy(&self, source: &Address, dest: &Address) -> StoreResult<TransferReport> {
        let direction = classify(source, dest)?;
        let src = self.dispatcher.resolve(source)?;
        let dst = self.dispatcher.resolve(dest)?;

        let entry = src.stat(source).await?;
        if entry.is_directory() {
            return Err(StoreError::Unsupported(format!(
                "{source} is a directory, use copy_tree"
            )));
        }

        let final_dest = if dest_is_directory(&*dst, dest).await {
            let name = source
                .name()
                .ok_or_else(|| StoreError::MalformedAddress(source.to_string()))?;
            dest.join(name)
        } else {
            dest.clone()
        };

        let unit = TransferUnit {
            source: source.clone(),
            dest: final_dest.clone(),
            size: entry.size(),
            modified: entry.metadata.modified,
            content_hash: entry.metadata.content_hash.clone(),
        };
        self.run(direction, src, dst, final_dest.parent(), vec![unit], None)
            .await
    }

    /// Copies a directory tree. Copying into an existing directory nests
    /// the tree under the source's name; a destination that exists as a
    /// single file fails with [`StoreError::TargetExists`]; otherwise the
    /// destination path is used verbatim.
    pub async fn copy_tree(&self, source: &Address, dest: &Address) -> StoreResult<TransferReport> {
        let direction = classify(source, dest)?;
        let src = self.dispatcher.resolve(source)?;
        let dst = self.dispatcher.resolve(dest)?;

        let source_entry = src.stat(source).await?;
        if source_entry.is_file() {
            return Err(StoreError::Unsupported(format!(
                "{source} is a file, use copy"
            )));
        }

        let dest_base = match dst.stat(dest).await {
            Ok(entry) if entry.is_directory() => match source.name() {
                Some(name) => dest.join(name),
                None => dest.clone(),
            },
            Ok(_) => return Err(StoreError::TargetExists(dest.to_string())),
            Err(_) if dest.is_dir_hint() => match source.name() {
                Some(name) => dest.join(name),
                None => dest.clone(),
            },
            Err(_) => dest.clone(),
        };

        let listing = src
            .list(source, &ListOptions { recursive: true, limit: None })
            .await?;
        let depth = source.segments().len();
        let mut units = Vec::new();
        let mut expected = Vec::new();
        for entry in listing.iter().filter(|e| e.is_file()) {
            let rel = entry.address.segments()[depth..].join("/");
            units.push(TransferUnit {
                source: entry.address.clone(),
                dest: dest_base.join(&rel),
                size: entry.size(),
                modified: entry.metadata.modified,
                content_hash: entry.metadata.content_hash.clone(),
            });
            expected.push(ManifestEntry {
                path: rel,
                size: entry.size().unwrap_or(0),
                checksum: entry.metadata.content_hash.clone().unwrap_or_default(),
            });
        }
        info!(source = %source, dest = %dest_base, units = units.len(), "starting tree transfer");

        let use_manifest = match direction {
            Direction::Upload => self.settings.upload.use_manifest,
            Direction::Download => self.settings.download.use_manifest,
        };
        let expected = use_manifest.then_some(expected);
        self.run(direction, src, dst, dest_base, units, expected).await
    }

    async fn run(
        &self,
        direction: Direction,
        src: Arc<dyn StorageBackend>,
        dst: Arc<dyn StorageBackend>,
        dest_base: Address,
        units: Vec<TransferUnit>,
        expected: Option<Vec<ManifestEntry>>,
    ) -> StoreResult<TransferReport> {
        let settings = match direction {
            Direction::Upload => self.settings.upload.clone(),
            Direction::Download => self.settings.download.clone(),
        };
        let policy = self.settings.retry.to_policy();

        // The manifest commits before any data moves.
        if let Some(entries) = &expected {
            let manifest_addr = dest_base.join(MANIFEST_NAME);
            let payload = Bytes::from(manifest::encode(entries));
            let write_opts = WriteOptions::default();
            retry::execute(
                || dst.put(&manifest_addr, payload.clone(), &write_opts),
                any_result,
                &policy,
            )
            .await?;
            debug!(address = %manifest_addr, entries = entries.len(), "manifest committed");
        }

        let object_permits = Arc::new(Semaphore::new(settings.object_threads.max(1)));
        let segment_permits = Arc::new(Semaphore::new(settings.segment_threads.max(1)));
        let abort = Arc::new(AtomicBool::new(false));

        let mut tasks: JoinSet<(String, StoreResult<UnitOutcome>)> = JoinSet::new();
        for unit in units {
            let ctx = UnitContext {
                src: src.clone(),
                dst: dst.clone(),
                settings: settings.clone(),
                policy: policy.clone(),
                object_permits: object_permits.clone(),
                segment_permits: segment_permits.clone(),
                abort: abort.clone(),
            };
            tasks.spawn(async move {
                let key = unit.source.to_string();
                let result = run_unit(ctx, unit).await;
                (key, result)
            });
        }

        let mut report = TransferReport::default();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((address, Ok(UnitOutcome::Transferred(bytes)))) => {
                    self.progress.on_unit_complete(&address, bytes);
                    report.transferred.push(address);
                }
                Ok((address, Ok(UnitOutcome::Skipped))) => {
                    self.progress.on_unit_skipped(&address);
                    report.skipped.push(address);
                }
                Ok((address, Ok(UnitOutcome::Aborted))) => {
                    debug!(%address, "unit refused to start after abort");
                }
                Ok((address, Err(error))) => {
                    warn!(%address, %error, "transfer unit failed");
                    failures.push(UnitFailure { address, error: Box::new(error) });
                }
                Err(join_error) => failures.push(UnitFailure {
                    address: "<task>".into(),
                    error: Box::new(StoreError::Other(join_error.to_string())),
                }),
            }
        }

        // A fatal error fails the whole call; the aggregate outcome only
        // covers unit-scoped failures.
        if let Some(pos) = failures.iter().position(|f| f.error.is_transfer_fatal()) {
            let fatal = failures.swap_remove(pos);
            warn!(address = %fatal.address, error = %fatal.error, "transfer aborted");
            return Err(*fatal.error);
        }

        // Validation runs strictly after every unit settled, so a clean
        // validation pass vouches for the whole tree.
        if expected.is_some() {
            match validate_manifest(&*dst, &dest_base, &policy).await {
                Ok(paths) if paths.is_empty() => {}
                Ok(paths) => {
                    if failures.is_empty() {
                        return Err(StoreError::InconsistentTransfer { paths });
                    }
                    warn!(?paths, "manifest divergence alongside unit failures");
                }
                Err(error) => {
                    if failures.is_empty() {
                        return Err(error);
                    }
                    warn!(%error, "manifest validation failed alongside unit failures");
                }
            }
        }

        if !failures.is_empty() {
            return Err(StoreError::PartialTransfer {
                failures,
                succeeded: report.transferred,
            });
        }
        Ok(report)
    }
}

/// Transfers move through this process, so both sides being remote means
/// the data would bounce through local memory; rejected.
fn classify(source: &Address, dest: &Address) -> StoreResult<Direction> {
    match (source.scheme() == Scheme::Local, dest.scheme() == Scheme::Local) {
        (true, false) | (true, true) => Ok(Direction::Upload),
        (false, true) => Ok(Direction::Download),
        (false, false) => Err(StoreError::Unsupported(format!(
            "remote-to-remote transfer: {source} -> {dest}"
        ))),
    }
}

async fn dest_is_directory(backend: &dyn StorageBackend, addr: &Address) -> bool {
    if addr.is_dir_hint() {
        return true;
    }
    matches!(backend.stat(addr).await, Ok(entry) if entry.is_directory())
}

async fn run_unit(ctx: UnitContext, unit: TransferUnit) -> StoreResult<UnitOutcome> {
    let _permit = ctx
        .object_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| StoreError::Other("object pool closed".into()))?;
    if ctx.abort.load(Ordering::SeqCst) {
        debug!(source = %unit.source, "abort flag set, unit not started");
        return Ok(UnitOutcome::Aborted);
    }

    if ctx.settings.skip_unchanged && unit.source.scheme() == Scheme::Local {
        if let (Some(last), Some(modified)) = (ctx.settings.last_transfer, unit.modified) {
            if modified <= last {
                debug!(source = %unit.source, "unchanged since last transfer, skipping");
                return Ok(UnitOutcome::Skipped);
            }
        }
    }

    let result = retry::execute(|| transfer_once(&ctx, &unit), any_result, &ctx.policy).await;
    if let Err(error) = &result {
        if error.is_transfer_fatal() {
            ctx.abort.store(true, Ordering::SeqCst);
        }
    }
    result
}

async fn transfer_once(ctx: &UnitContext, unit: &TransferUnit) -> StoreResult<UnitOutcome> {
    let size = match unit.size {
        Some(size) => size,
        None => ctx.src.stat(&unit.source).await?.size().unwrap_or(0),
    };

    if ctx.settings.skip_identical {
        if let Ok(existing) = ctx.dst.stat(&unit.dest).await {
            if existing.size() == Some(size) && fingerprints_match(ctx, unit, &existing).await? {
                debug!(source = %unit.source, "destination identical, skipping");
                return Ok(UnitOutcome::Skipped);
            }
        }
    }

    let segments = plan_segments(size, ctx.settings.segment_size);
    if segments.len() <= 1 {
        let data = ctx.src.get(&unit.source, &ReadOptions::default()).await?;
        ctx.dst.put(&unit.dest, data, &WriteOptions::default()).await?;
        return Ok(UnitOutcome::Transferred(size));
    }

    // Large object: stage ranged reads as part objects beside the
    // destination, then coalesce them into the final object.
    let name = unit
        .dest
        .name()
        .ok_or_else(|| StoreError::MalformedAddress(unit.dest.to_string()))?;
    let staging = unit.dest.parent().join(format!(".segments/{name}"));
    let parts: Vec<Address> = segments
        .iter()
        .map(|s| staging.join(format!("{:08}", s.index)))
        .collect();

    let mut jobs = Vec::new();
    for (segment, part) in segments.iter().copied().zip(parts.iter().cloned()) {
        let src = ctx.src.clone();
        let dst = ctx.dst.clone();
        let source = unit.source.clone();
        let permits = ctx.segment_permits.clone();
        jobs.push(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| StoreError::Other("segment pool closed".into()))?;
            let data = src
                .get(&source, &ReadOptions { range: Some(segment.range()) })
                .await?;
            dst.put(&part, data, &WriteOptions::default()).await?;
            Ok::<(), StoreError>(())
        });
    }
    stream::iter(jobs)
        .buffer_unordered(ctx.settings.segment_threads.max(1))
        .try_collect::<Vec<()>>()
        .await?;

    ctx.dst.coalesce(&unit.dest, &parts).await?;
    // Best-effort staging cleanup; the parts themselves are already gone.
    let _ = ctx
        .dst
        .delete(
            &staging.as_folder(),
            &DeleteOptions { recursive: true, force: true },
        )
        .await;
    Ok(UnitOutcome::Transferred(size))
}

async fn fingerprints_match(
    ctx: &UnitContext,
    unit: &TransferUnit,
    existing: &Entry,
) -> StoreResult<bool> {
    let Some(dest_hash) = existing.metadata.content_hash.as_deref() else {
        return Ok(false);
    };
    if let Some(src_hash) = unit.content_hash.as_deref() {
        return Ok(src_hash == dest_hash);
    }
    // The source listing carried no fingerprint; hash the bytes.
    let data = ctx.src.get(&unit.source, &ReadOptions::default()).await?;
    Ok(blake3::hash(&data).to_hex().to_string() == dest_hash)
}

async fn validate_manifest(
    dst: &dyn StorageBackend,
    dest_base: &Address,
    policy: &RetryPolicy,
) -> StoreResult<Vec<String>> {
    // The committed manifest is the source of truth, read back from the
    // destination rather than trusted from memory.
    let manifest_addr = dest_base.join(MANIFEST_NAME);
    let read_opts = ReadOptions::default();
    let raw = retry::execute(
        || dst.get(&manifest_addr, &read_opts),
        any_result,
        policy,
    )
    .await?;
    let expected = manifest::parse(std::str::from_utf8(&raw).map_err(|e| {
        StoreError::Other(format!("manifest is not valid UTF-8: {e}"))
    })?)?;

    let depth = dest_base.segments().len();
    let rel_of = |entry: &Entry| entry.address.segments()[depth..].join("/");

    // Wait out listing lag until every expected path shows up, then compare
    // the settled listing exactly. If the wait exhausts, the final listing
    // still decides which paths diverged.
    let list_opts = ListOptions { recursive: true, limit: None };
    let waited = retry::execute(
        || dst.list(dest_base, &list_opts),
        |entries: &Vec<Entry>| {
            let present: HashSet<String> =
                entries.iter().filter(|e| e.is_file()).map(|e| rel_of(e)).collect();
            expected.iter().all(|e| present.contains(&e.path))
        },
        policy,
    )
    .await;
    let listing = match waited {
        Ok(listing) => listing,
        Err(StoreError::ConditionNotMet(_)) => dst.list(dest_base, &list_opts).await?,
        Err(error) => return Err(error),
    };

    let observed: HashMap<String, (u64, Option<String>)> = listing
        .iter()
        .filter(|e| e.is_file())
        .map(|e| (rel_of(e), (e.size().unwrap_or(0), e.metadata.content_hash.clone())))
        .filter(|(rel, _)| rel != MANIFEST_NAME)
        .collect();
    Ok(manifest::divergent(&expected, &observed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use polystore_core::Metadata;
    use polystore_providers::{LocalBackend, MemoryObjectBackend};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn claims_local(addr: &Address) -> bool {
        addr.scheme() == Scheme::Local
    }

    fn claims_flat(addr: &Address) -> bool {
        addr.scheme() == Scheme::FlatObject
    }

    fn dispatcher_with(object_backend: Arc<dyn StorageBackend>) -> Arc<BackendDispatcher> {
        let mut dispatcher = BackendDispatcher::new();
        dispatcher
            .register("file", claims_local, Arc::new(LocalBackend::new("local")))
            .unwrap();
        dispatcher.register("obs", claims_flat, object_backend).unwrap();
        Arc::new(dispatcher)
    }

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.retry.initial_retry_sleep_ms = 1;
        settings
    }

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, data) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
    }

    /// Delegating backend that fails reads for a fixed set of keys
    struct FailingReads {
        inner: MemoryObjectBackend,
        fail: HashSet<String>,
    }

    #[async_trait]
    impl StorageBackend for FailingReads {
        fn scheme(&self) -> Scheme {
            self.inner.scheme()
        }
        fn name(&self) -> &str {
            "failing"
        }
        async fn stat(&self, addr: &Address) -> StoreResult<Entry> {
            self.inner.stat(addr).await
        }
        async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>> {
            self.inner.list(addr, options).await
        }
        async fn get(&self, addr: &Address, options: &ReadOptions) -> StoreResult<Bytes> {
            if self.fail.contains(&addr.key()) {
                return Err(StoreError::NotFound(addr.to_string()));
            }
            self.inner.get(addr, options).await
        }
        async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry> {
            self.inner.put(addr, data, options).await
        }
        async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()> {
            self.inner.delete(addr, options).await
        }
        async fn post_metadata(&self, addr: &Address, metadata: &Metadata) -> StoreResult<()> {
            self.inner.post_metadata(addr, metadata).await
        }
    }

    /// Delegating backend that rejects every read and counts the attempts
    struct UnauthorizedReads {
        inner: MemoryObjectBackend,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for UnauthorizedReads {
        fn scheme(&self) -> Scheme {
            self.inner.scheme()
        }
        fn name(&self) -> &str {
            "unauthorized"
        }
        async fn stat(&self, addr: &Address) -> StoreResult<Entry> {
            self.inner.stat(addr).await
        }
        async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>> {
            self.inner.list(addr, options).await
        }
        async fn get(&self, addr: &Address, _options: &ReadOptions) -> StoreResult<Bytes> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unauthorized(addr.to_string()))
        }
        async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry> {
            self.inner.put(addr, data, options).await
        }
        async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()> {
            self.inner.delete(addr, options).await
        }
        async fn post_metadata(&self, addr: &Address, metadata: &Metadata) -> StoreResult<()> {
            self.inner.post_metadata(addr, metadata).await
        }
    }

    /// Delegating backend that truncates writes to one chosen name
    struct TruncatingWrites {
        inner: MemoryObjectBackend,
        victim: String,
    }

    #[async_trait]
    impl StorageBackend for TruncatingWrites {
        fn scheme(&self) -> Scheme {
            self.inner.scheme()
        }
        fn name(&self) -> &str {
            "truncating"
        }
        async fn stat(&self, addr: &Address) -> StoreResult<Entry> {
            self.inner.stat(addr).await
        }
        async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>> {
            self.inner.list(addr, options).await
        }
        async fn get(&self, addr: &Address, options: &ReadOptions) -> StoreResult<Bytes> {
            self.inner.get(addr, options).await
        }
        async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry> {
            let data = if addr.name() == Some(self.victim.as_str()) && !data.is_empty() {
                data.slice(..data.len() - 1)
            } else {
                data
            };
            self.inner.put(addr, data, options).await
        }
        async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()> {
            self.inner.delete(addr, options).await
        }
        async fn post_metadata(&self, addr: &Address, metadata: &Metadata) -> StoreResult<()> {
            self.inner.post_metadata(addr, metadata).await
        }
    }

    /// Delegating backend that records the order of writes
    struct RecordingWrites {
        inner: MemoryObjectBackend,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StorageBackend for RecordingWrites {
        fn scheme(&self) -> Scheme {
            self.inner.scheme()
        }
        fn name(&self) -> &str {
            "recording"
        }
        async fn stat(&self, addr: &Address) -> StoreResult<Entry> {
            self.inner.stat(addr).await
        }
        async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>> {
            self.inner.list(addr, options).await
        }
        async fn get(&self, addr: &Address, options: &ReadOptions) -> StoreResult<Bytes> {
            self.inner.get(addr, options).await
        }
        async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry> {
            self.order.lock().push(addr.key());
            self.inner.put(addr, data, options).await
        }
        async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()> {
            self.inner.delete(addr, options).await
        }
        async fn post_metadata(&self, addr: &Address, metadata: &Metadata) -> StoreResult<()> {
            self.inner.post_metadata(addr, metadata).await
        }
    }

    #[tokio::test]
    async fn test_upload_tree_copies_every_file() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[("a.txt", b"one"), ("sub/b.txt", b"two"), ("sub/deep/c.txt", b"three")],
        );
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend.clone()), fast_settings());

        let source = Address::local(dir.path().to_string_lossy());
        let dest = Address::flat("bucket", "backup");
        let report = orchestrator.copy_tree(&source, &dest).await.unwrap();
        assert_eq!(report.transferred.len(), 3);
        assert!(report.skipped.is_empty());

        let entry = object_backend
            .stat(&Address::flat("bucket", "backup/sub/deep/c.txt"))
            .await
            .unwrap();
        assert_eq!(entry.size(), Some(5));
    }

    #[tokio::test]
    async fn test_copy_tree_into_existing_directory_nests() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(&dir.path().join("data"), &[("a.txt", b"x")]);
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        // An object below dest makes it an existing directory.
        object_backend
            .put(
                &Address::flat("bucket", "dest/existing.txt"),
                Bytes::from_static(b"y"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend.clone()), fast_settings());

        let source = Address::local(dir.path().join("data").to_string_lossy());
        let dest = Address::flat("bucket", "dest");
        orchestrator.copy_tree(&source, &dest).await.unwrap();

        assert!(object_backend
            .stat(&Address::flat("bucket", "dest/data/a.txt"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_copy_file_into_directory_hint() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("report.csv", b"1,2,3")]);
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend.clone()), fast_settings());

        let source = Address::local(dir.path().join("report.csv").to_string_lossy());
        let dest = Address::parse("obs://bucket/exports/").unwrap();
        orchestrator.copy(&source, &dest).await.unwrap();

        assert!(object_backend
            .stat(&Address::flat("bucket", "exports/report.csv"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_remote_to_remote_is_unsupported() {
        let orchestrator = TransferOrchestrator::new(
            dispatcher_with(Arc::new(MemoryObjectBackend::new("mem"))),
            fast_settings(),
        );
        let result = orchestrator
            .copy(&Address::flat("a", "x"), &Address::flat("b", "y"))
            .await;
        assert!(matches!(result, Err(StoreError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_segmented_upload_coalesces_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("big.bin", b"0123456789")]);
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        let mut settings = fast_settings();
        settings.upload.segment_size = 4;
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend.clone()), settings);

        let source = Address::local(dir.path().join("big.bin").to_string_lossy());
        let dest = Address::flat("bucket", "big.bin");
        orchestrator.copy(&source, &dest).await.unwrap();

        let data = object_backend.get(&dest, &ReadOptions::default()).await.unwrap();
        assert_eq!(&data[..], b"0123456789");

        let leftovers = object_backend
            .list(
                &Address::flat("bucket", ""),
                &ListOptions { recursive: true, limit: None },
            )
            .await
            .unwrap();
        assert!(leftovers.iter().all(|e| !e.address.key().contains(".segments")));
    }

    #[tokio::test]
    async fn test_skip_identical_on_second_pass() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(&dir.path().join("data"), &[("a.txt", b"same"), ("b.txt", b"bytes")]);
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        // Seed the destination so both passes nest under the same base.
        object_backend
            .put(
                &Address::flat("bucket", "mirror/seed.txt"),
                Bytes::from_static(b"s"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        let mut settings = fast_settings();
        settings.upload.skip_identical = true;
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend.clone()), settings);

        let source = Address::local(dir.path().join("data").to_string_lossy());
        let dest = Address::flat("bucket", "mirror");
        let first = orchestrator.copy_tree(&source, &dest).await.unwrap();
        assert_eq!(first.transferred.len(), 2);
        assert!(object_backend
            .stat(&Address::flat("bucket", "mirror/data/a.txt"))
            .await
            .is_ok());

        let second = orchestrator.copy_tree(&source, &dest).await.unwrap();
        assert!(second.transferred.is_empty());
        assert_eq!(second.skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_copy_tree_onto_existing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(&dir.path().join("data"), &[("a.txt", b"x")]);
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        object_backend
            .put(
                &Address::flat("bucket", "occupied"),
                Bytes::from_static(b"y"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend), fast_settings());

        let source = Address::local(dir.path().join("data").to_string_lossy());
        let result = orchestrator
            .copy_tree(&source, &Address::flat("bucket", "occupied"))
            .await;
        assert!(matches!(result, Err(StoreError::TargetExists(_))));
    }

    #[tokio::test]
    async fn test_skip_unchanged_respects_last_transfer() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("old.txt", b"x"), ("older.txt", b"y")]);
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        let mut settings = fast_settings();
        settings.upload.skip_unchanged = true;
        settings.upload.last_transfer = Some(Utc::now() + chrono::Duration::hours(1));
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend.clone()), settings);

        let source = Address::local(dir.path().to_string_lossy());
        let report = orchestrator
            .copy_tree(&source, &Address::flat("bucket", "inc"))
            .await
            .unwrap();
        assert!(report.transferred.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(object_backend
            .stat(&Address::flat("bucket", "inc/old.txt"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_partial_transfer_aggregates_unit_failures() {
        let inner = MemoryObjectBackend::new("mem");
        let mut fail = HashSet::new();
        for i in 0..10 {
            inner
                .put(
                    &Address::flat("bucket", &format!("src/f{i}.txt")),
                    Bytes::from_static(b"data"),
                    &WriteOptions::default(),
                )
                .await
                .unwrap();
        }
        fail.insert("src/f3.txt".to_string());
        fail.insert("src/f7.txt".to_string());
        let orchestrator = TransferOrchestrator::new(
            dispatcher_with(Arc::new(FailingReads { inner, fail })),
            fast_settings(),
        );

        let dir = tempfile::tempdir().unwrap();
        let dest = Address::local(dir.path().join("out").to_string_lossy());
        let result = orchestrator
            .copy_tree(&Address::flat("bucket", "src"), &dest)
            .await;
        match result {
            Err(StoreError::PartialTransfer { failures, succeeded }) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(succeeded.len(), 8);
                assert!(failures.iter().all(|f| f.address.contains("f3") || f.address.contains("f7")));
            }
            other => panic!("expected PartialTransfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_read_aborts_pending_units() {
        let inner = MemoryObjectBackend::new("mem");
        for i in 0..5 {
            inner
                .put(
                    &Address::flat("bucket", &format!("src/f{i}.txt")),
                    Bytes::from_static(b"data"),
                    &WriteOptions::default(),
                )
                .await
                .unwrap();
        }
        let backend = Arc::new(UnauthorizedReads { inner, gets: AtomicUsize::new(0) });
        let mut settings = fast_settings();
        settings.download.object_threads = 1;
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(backend.clone()), settings);

        let dir = tempfile::tempdir().unwrap();
        let dest = Address::local(dir.path().join("out").to_string_lossy());
        let result = orchestrator
            .copy_tree(&Address::flat("bucket", "src"), &dest)
            .await;
        match result {
            Err(StoreError::Unauthorized(message)) => {
                assert!(message.contains("obs://bucket/src/f"));
            }
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        // One unit hit the backend; the rest refused to start.
        assert_eq!(backend.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manifest_names_divergent_object() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("a.txt", b"aaaa"),
                ("b.txt", b"bbbb"),
                ("c.txt", b"cccc"),
                ("d.txt", b"dddd"),
                ("e.txt", b"eeee"),
            ],
        );
        let backend = TruncatingWrites {
            inner: MemoryObjectBackend::new("mem"),
            victim: "c.txt".to_string(),
        };
        let mut settings = fast_settings();
        settings.upload.use_manifest = true;
        settings.retry.num_retries = 1;
        let orchestrator = TransferOrchestrator::new(dispatcher_with(Arc::new(backend)), settings);

        let source = Address::local(dir.path().to_string_lossy());
        let result = orchestrator
            .copy_tree(&source, &Address::flat("bucket", "out"))
            .await;
        match result {
            Err(StoreError::InconsistentTransfer { paths }) => {
                assert_eq!(paths, ["c.txt"]);
            }
            other => panic!("expected InconsistentTransfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_manifest_is_committed_before_data() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("a.txt", b"1"), ("b.txt", b"2"), ("c.txt", b"3")]);
        let backend = Arc::new(RecordingWrites {
            inner: MemoryObjectBackend::new("mem"),
            order: Mutex::new(Vec::new()),
        });
        let mut settings = fast_settings();
        settings.upload.use_manifest = true;
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(backend.clone()), settings);

        let source = Address::local(dir.path().to_string_lossy());
        orchestrator
            .copy_tree(&source, &Address::flat("bucket", "out"))
            .await
            .unwrap();

        let order = backend.order.lock();
        assert_eq!(order[0], format!("out/{MANIFEST_NAME}"));
        assert_eq!(order.len(), 4);
    }

    #[tokio::test]
    async fn test_manifest_waits_out_listing_lag() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("a.txt", b"1"), ("b.txt", b"2")]);
        let object_backend = Arc::new(MemoryObjectBackend::new("mem").with_list_lag(2));
        let mut settings = fast_settings();
        settings.upload.use_manifest = true;
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend), settings);

        let source = Address::local(dir.path().to_string_lossy());
        let report = orchestrator
            .copy_tree(&source, &Address::flat("bucket", "out"))
            .await
            .unwrap();
        assert_eq!(report.transferred.len(), 2);
    }

    #[tokio::test]
    async fn test_copy_single_file_round_trip_download() {
        let object_backend = Arc::new(MemoryObjectBackend::new("mem"));
        object_backend
            .put(
                &Address::flat("bucket", "remote.txt"),
                Bytes::from_static(b"payload"),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        let orchestrator =
            TransferOrchestrator::new(dispatcher_with(object_backend), fast_settings());

        let dir = tempfile::tempdir().unwrap();
        let dest = Address::local(dir.path().join("local.txt").to_string_lossy());
        let report = orchestrator
            .copy(&Address::flat("bucket", "remote.txt"), &dest)
            .await
            .unwrap();
        assert_eq!(report.transferred.len(), 1);
        assert_eq!(std::fs::read(dir.path().join("local.txt")).unwrap(), b"payload");
    }
}
