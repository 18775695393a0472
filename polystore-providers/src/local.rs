//! Local filesystem backend

use async_trait::async_trait;
use bytes::Bytes;
use polystore_core::{
    address::{Address, Scheme},
    entry::{Entry, EntryKind},
    error::{StoreError, StoreResult},
    metadata::Metadata,
    operations::*,
    StorageBackend,
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Local filesystem backend
pub struct LocalBackend {
    name: String,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn real_path(addr: &Address) -> PathBuf {
        addr.to_path_buf()
    }

    async fn entry_from_path(&self, addr: &Address, real: &Path) -> StoreResult<Entry> {
        let meta = fs::metadata(real).await?;
        let kind = if meta.is_dir() { EntryKind::Directory } else { EntryKind::File };

        let mut metadata = Metadata::new();
        if kind == EntryKind::File {
            metadata.size = Some(meta.len());
        }
        if let Ok(modified) = meta.modified() {
            metadata.modified = Some(modified.into());
        }
        if let Ok(created) = meta.created() {
            metadata.created = Some(created.into());
        }

        Ok(Entry { address: addr.clone(), kind, metadata })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, addr: &Address) -> StoreResult<Entry> {
        let real = Self::real_path(addr);
        if !real.exists() {
            return Err(StoreError::NotFound(addr.to_string()));
        }
        self.entry_from_path(addr, &real).await
    }

    async fn list(&self, addr: &Address, options: &ListOptions) -> StoreResult<Vec<Entry>> {
        let real = Self::real_path(addr);
        if !real.is_dir() {
            return Err(StoreError::NotFound(format!("not a directory: {addr}")));
        }

        let mut entries = Vec::new();
        if options.recursive {
            // Planning-time walks are synchronous by design; walkdir keeps
            // ordering deterministic.
            for item in walkdir::WalkDir::new(&real).min_depth(1).sort_by_file_name() {
                let item = item.map_err(|e| StoreError::Other(e.to_string()))?;
                let rel = item
                    .path()
                    .strip_prefix(&real)
                    .map_err(|e| StoreError::Other(e.to_string()))?;
                let child = addr.join(rel.to_string_lossy());
                entries.push(self.entry_from_path(&child, item.path()).await?);
                if options.limit.is_some_and(|n| entries.len() >= n) {
                    break;
                }
            }
        } else {
            let mut read_dir = fs::read_dir(&real).await?;
            while let Some(item) = read_dir.next_entry().await? {
                let child = addr.join(item.file_name().to_string_lossy());
                entries.push(self.entry_from_path(&child, &item.path()).await?);
                if options.limit.is_some_and(|n| entries.len() >= n) {
                    break;
                }
            }
            entries.sort_by(|a, b| a.address.cmp(&b.address));
        }
        Ok(entries)
    }

    async fn get(&self, addr: &Address, options: &ReadOptions) -> StoreResult<Bytes> {
        let real = Self::real_path(addr);
        if !real.is_file() {
            return Err(StoreError::NotFound(addr.to_string()));
        }

        let mut file = fs::File::open(&real).await?;
        let buffer = if let Some((start, end)) = options.range {
            let len = file.metadata().await?.len();
            if start > len || end > len || start > end {
                return Err(StoreError::Other(format!(
                    "range {start}..{end} out of bounds for {addr} (len {len})"
                )));
            }
            file.seek(std::io::SeekFrom::Start(start)).await?;
            let mut buffer = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buffer).await?;
            buffer
        } else {
            let mut buffer = Vec::new();
            file.read_to_end(&mut buffer).await?;
            buffer
        };
        Ok(Bytes::from(buffer))
    }

    async fn put(&self, addr: &Address, data: Bytes, options: &WriteOptions) -> StoreResult<Entry> {
        let real = Self::real_path(addr);
        if real.exists() && !options.overwrite {
            return Err(StoreError::TargetExists(addr.to_string()));
        }
        if options.create_parents {
            if let Some(parent) = real.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(&real, &data).await?;
        self.stat(addr).await
    }

    async fn delete(&self, addr: &Address, options: &DeleteOptions) -> StoreResult<()> {
        let real = Self::real_path(addr);
        if !real.exists() {
            if options.force {
                return Ok(());
            }
            return Err(StoreError::NotFound(addr.to_string()));
        }
        if real.is_dir() {
            if options.recursive {
                fs::remove_dir_all(&real).await?;
            } else {
                fs::remove_dir(&real).await?;
            }
        } else {
            fs::remove_file(&real).await?;
        }
        Ok(())
    }

    async fn post_metadata(&self, addr: &Address, _metadata: &Metadata) -> StoreResult<()> {
        // The filesystem carries no application metadata; accepted and dropped.
        debug!(address = %addr, "post_metadata is a no-op on the local backend");
        Ok(())
    }

    async fn coalesce(&self, dest: &Address, parts: &[Address]) -> StoreResult<Entry> {
        let real = Self::real_path(dest);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut out = fs::File::create(&real).await?;
        for part in parts {
            let data = self.get(part, &ReadOptions::default()).await?;
            out.write_all(&data).await?;
        }
        out.flush().await?;
        drop(out);
        for part in parts {
            self.delete(part, &DeleteOptions::default()).await?;
        }
        self.stat(dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_for(path: &Path) -> Address {
        Address::local(path.to_string_lossy())
    }

    #[tokio::test]
    async fn test_put_stat_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local");
        let addr = addr_for(&dir.path().join("a/b.txt"));

        backend
            .put(&addr, Bytes::from_static(b"hello"), &WriteOptions::default())
            .await
            .unwrap();
        let entry = backend.stat(&addr).await.unwrap();
        assert!(entry.is_file());
        assert_eq!(entry.size(), Some(5));

        let data = backend.get(&addr, &ReadOptions::default()).await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local");
        let addr = addr_for(&dir.path().join("r.bin"));
        backend
            .put(&addr, Bytes::from_static(b"0123456789"), &WriteOptions::default())
            .await
            .unwrap();

        let data = backend
            .get(&addr, &ReadOptions { range: Some((2, 6)) })
            .await
            .unwrap();
        assert_eq!(&data[..], b"2345");

        let err = backend
            .get(&addr, &ReadOptions { range: Some((2, 16)) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Other(message) if message.contains("out of bounds")));
    }

    #[tokio::test]
    async fn test_stat_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local");
        let addr = addr_for(&dir.path().join("missing"));
        assert!(matches!(
            backend.stat(&addr).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local");
        let addr = addr_for(&dir.path().join("f.txt"));
        let opts = WriteOptions { overwrite: false, create_parents: true };
        backend.put(&addr, Bytes::from_static(b"x"), &opts).await.unwrap();
        assert!(matches!(
            backend.put(&addr, Bytes::from_static(b"y"), &opts).await,
            Err(StoreError::TargetExists(_))
        ));
    }

    #[tokio::test]
    async fn test_recursive_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local");
        let root = addr_for(dir.path());
        for name in ["a/one.txt", "a/b/two.txt", "three.txt"] {
            backend
                .put(&root.join(name), Bytes::from_static(b"x"), &WriteOptions::default())
                .await
                .unwrap();
        }

        let entries = backend
            .list(&root, &ListOptions { recursive: true, limit: None })
            .await
            .unwrap();
        let files: Vec<&Entry> = entries.iter().filter(|e| e.is_file()).collect();
        assert_eq!(files.len(), 3);
        let dirs: Vec<&Entry> = entries.iter().filter(|e| e.is_directory()).collect();
        assert_eq!(dirs.len(), 2);
    }

    #[tokio::test]
    async fn test_coalesce_concatenates_and_removes_parts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local");
        let root = addr_for(dir.path());
        let parts = vec![root.join("p0"), root.join("p1")];
        backend
            .put(&parts[0], Bytes::from_static(b"hello "), &WriteOptions::default())
            .await
            .unwrap();
        backend
            .put(&parts[1], Bytes::from_static(b"world"), &WriteOptions::default())
            .await
            .unwrap();

        let dest = root.join("joined.txt");
        let entry = backend.coalesce(&dest, &parts).await.unwrap();
        assert_eq!(entry.size(), Some(11));
        let data = backend.get(&dest, &ReadOptions::default()).await.unwrap();
        assert_eq!(&data[..], b"hello world");
        assert!(backend.stat(&parts[0]).await.is_err());
    }
}
