//! Local blob storage for flow records and chunks.
//!
//! Blobs are keyed by [`UniqId`]. Chunks are immutable, flow records are
//! overwritten as the flow grows, so `put` always replaces.
//!
//! The disk layout is two-level, like Git objects:
//!   {root}/{key[0..2]}/{full_hex_key}

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use memmap2::Mmap;

use tandem_core::UniqId;

pub trait BlobStore: Send + Sync {
    fn get(&self, key: &UniqId) -> Result<Option<Bytes>>;
    fn put(&self, key: &UniqId, data: &[u8]) -> Result<()>;
    fn contains(&self, key: &UniqId) -> bool;
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: DashMap<UniqId, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &UniqId) -> Result<Option<Bytes>> {
        Ok(self.blobs.get(key).map(|b| b.value().clone()))
    }

    fn put(&self, key: &UniqId, data: &[u8]) -> Result<()> {
        self.blobs.insert(*key, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn contains(&self, key: &UniqId) -> bool {
        self.blobs.contains_key(key)
    }
}

#[derive(Clone)]
pub struct DiskStore {
    root: PathBuf,
}

/// Distinguishes temp files of concurrent writers to the same key.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root: {}", root.display()))?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &UniqId) -> PathBuf {
        let hex = key.dht_key();
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Number of stored blobs.
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir
                        .flatten()
                        .filter(|f| f.path().extension().is_none())
                        .count();
                }
            }
        }
        total
    }

    /// Total bytes on disk.
    pub fn size(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for blob in subdir.flatten() {
                        if let Ok(meta) = blob.metadata() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }

    #[cfg(test)]
    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}

impl BlobStore for DiskStore {
    fn get(&self, key: &UniqId) -> Result<Option<Bytes>> {
        let path = self.blob_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open blob: {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat blob: {}", path.display()))?
            .len();
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Safety: read-only mapping; writers replace files by rename and
        // never modify one in place.
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap blob: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn put(&self, key: &UniqId, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }

        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("{}.{n}.tmp", std::process::id()));
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write blob")?;
            file.sync_all().context("failed to sync blob to disk")?;
        }
        fs::rename(&tmp_path, &path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;

        tracing::trace!(key = %key.short(), len = data.len(), "blob stored");
        Ok(())
    }

    fn contains(&self, key: &UniqId) -> bool {
        self.blob_path(key).exists()
    }
}
