//! Local-disk cache backend: one file per entry, atomic rename on commit.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::blob::{Blob, FileBlobStore, StorageError};

use super::{CacheBackend, CacheError, CacheKey, CacheReader, CacheStats, CacheStatsSnapshot, CacheWriter};

const PENDING_SUFFIX: &str = ".pending";

/// Disk-backed cache backend.
///
/// A pending entry is written to `<entry>.pending` and renamed into place on
/// commit, so the committed file either exists completely or not at all; no
/// explicit pending map is needed and a reader can never observe a torn
/// pending→committed transition. `create_new` on the pending file admits at
/// most one producer per key.
pub struct FileCache {
  store: FileBlobStore,
  stats: CacheStats,
}

impl FileCache {
  /// Open the cache root, creating it if needed. Stale `.pending` files
  /// left behind by interrupted builds are swept away.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
    let store = FileBlobStore::open(root)?;
    let cache = Self {
      store,
      stats: CacheStats::new(),
    };
    cache.sweep_pending()?;
    Ok(cache)
  }

  fn sweep_pending(&self) -> Result<(), StorageError> {
    let mut swept = 0usize;
    for entry in fs::read_dir(self.store.root())? {
      let entry = entry?;
      let name = entry.file_name();
      if name.to_string_lossy().ends_with(PENDING_SUFFIX) {
        fs::remove_file(entry.path()).ok();
        swept += 1;
      }
    }
    if swept > 0 {
      debug!(swept, root = %self.store.root().display(), "swept stale pending entries");
    }
    Ok(())
  }

  fn entry_file(key: &CacheKey) -> String {
    format!("{}.blob", key.entry_name())
  }

  fn pending_path(&self, key: &CacheKey) -> PathBuf {
    self.store.root().join(format!("{}{}", Self::entry_file(key), PENDING_SUFFIX))
  }

  /// Drop a pending entry so another producer may claim the key.
  pub fn abandon(&self, key: &CacheKey) -> bool {
    fs::remove_file(self.pending_path(key)).is_ok()
  }

  /// Remove committed entries last accessed before `cutoff`. Hits refresh
  /// an entry's timestamp, so this approximates least-recently-used.
  pub fn evict_older_than(&self, cutoff: SystemTime) -> usize {
    let Ok(dir) = fs::read_dir(self.store.root()) else {
      return 0;
    };

    let mut evicted = 0usize;
    for entry in dir.flatten() {
      let name = entry.file_name().to_string_lossy().to_string();
      if !name.ends_with(".blob") {
        continue;
      }
      let blob = self.store.blob(&name);
      let Ok(accessed) = blob.last_accessed() else {
        continue;
      };
      if accessed < cutoff && self.store.remove(&name) {
        debug!(entry = %name, "evicted cache entry");
        evicted += 1;
      }
    }
    evicted
  }

  pub fn committed_len(&self) -> usize {
    fs::read_dir(self.store.root())
      .map(|dir| {
        dir
          .flatten()
          .filter(|e| e.file_name().to_string_lossy().ends_with(".blob"))
          .count()
      })
      .unwrap_or(0)
  }
}

#[async_trait]
impl CacheBackend for FileCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<CacheReader>, CacheError> {
    let blob = self.store.blob(&Self::entry_file(key));
    if !blob.exists() {
      self.stats.miss();
      return Ok(None);
    }
    let reader = blob.read()?;
    // Refresh for eviction; a failed touch is not a failed hit.
    if let Err(error) = blob.touch() {
      debug!(%key, %error, "failed to refresh cache entry timestamp");
    }
    self.stats.hit();
    Ok(Some(reader))
  }

  async fn put(&self, key: &CacheKey) -> Result<Option<CacheWriter>, CacheError> {
    let path = self.pending_path(key);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
      Ok(file) => Ok(Some(Box::new(file))),
      Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(None),
      Err(error) => Err(error.into()),
    }
  }

  async fn commit(&self, key: &CacheKey) -> Result<bool, CacheError> {
    let pending = self.pending_path(key);
    let target = self.store.root().join(Self::entry_file(key));
    match fs::rename(&pending, &target) {
      Ok(()) => {
        debug!(%key, "committed cache entry");
        Ok(true)
      }
      Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
      Err(error) => {
        warn!(%key, %error, "failed to commit cache entry");
        Err(error.into())
      }
    }
  }

  fn stats(&self) -> CacheStatsSnapshot {
    self.stats.snapshot()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{Read, Write};

  use kiln_core::{Guid, hash_bytes};

  fn key(tag: &[u8]) -> CacheKey {
    CacheKey::new(Guid::generate(), hash_bytes(tag))
  }

  #[tokio::test]
  async fn entry_is_invisible_until_committed() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::open(dir.path()).unwrap();
    let key = key(b"tree");

    let mut writer = cache.put(&key).await.unwrap().unwrap();
    writer.write_all(b"compiled").unwrap();
    drop(writer);

    assert!(cache.get(&key).await.unwrap().is_none());
    assert!(cache.commit(&key).await.unwrap());

    let mut back = Vec::new();
    cache.get(&key).await.unwrap().unwrap().read_to_end(&mut back).unwrap();
    assert_eq!(back, b"compiled");
  }

  #[tokio::test]
  async fn second_put_while_pending_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::open(dir.path()).unwrap();
    let key = key(b"tree");

    let writer = cache.put(&key).await.unwrap().unwrap();
    assert!(cache.put(&key).await.unwrap().is_none());
    drop(writer);

    assert!(cache.abandon(&key));
    assert!(cache.put(&key).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn commit_without_pending_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::open(dir.path()).unwrap();
    assert!(!cache.commit(&key(b"never-put")).await.unwrap());
  }

  #[tokio::test]
  async fn duplicate_commit_from_another_session_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let key = key(b"tree");

    // Two independent sessions over the same root race to produce one key.
    let first = FileCache::open(dir.path()).unwrap();
    let second = FileCache::open(dir.path()).unwrap();

    let mut writer = first.put(&key).await.unwrap().unwrap();
    writer.write_all(b"payload").unwrap();
    drop(writer);
    assert!(first.commit(&key).await.unwrap());

    // The second session spools its own pending file and commits later.
    let mut writer = second.put(&key).await.unwrap().unwrap();
    writer.write_all(b"payload").unwrap();
    drop(writer);
    assert!(second.commit(&key).await.unwrap());

    let mut back = Vec::new();
    first.get(&key).await.unwrap().unwrap().read_to_end(&mut back).unwrap();
    assert_eq!(back, b"payload");
  }

  #[tokio::test]
  async fn open_sweeps_stale_pending_entries() {
    let dir = tempfile::tempdir().unwrap();
    let key = key(b"interrupted");

    {
      let cache = FileCache::open(dir.path()).unwrap();
      let mut writer = cache.put(&key).await.unwrap().unwrap();
      writer.write_all(b"partial").unwrap();
      // Session dies before commit.
    }

    let cache = FileCache::open(dir.path()).unwrap();
    assert!(cache.get(&key).await.unwrap().is_none());
    // The key is claimable again.
    assert!(cache.put(&key).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn eviction_removes_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::open(dir.path()).unwrap();
    let stale = key(b"stale");
    let fresh = key(b"fresh");

    for k in [&stale, &fresh] {
      let mut writer = cache.put(k).await.unwrap().unwrap();
      writer.write_all(b"x").unwrap();
      drop(writer);
      cache.commit(k).await.unwrap();
    }

    std::thread::sleep(std::time::Duration::from_millis(20));
    let cutoff = SystemTime::now();
    // A hit refreshes `fresh` past the cutoff.
    cache.get(&fresh).await.unwrap().unwrap();

    assert_eq!(cache.evict_older_than(cutoff), 1);
    assert_eq!(cache.committed_len(), 1);
    assert!(cache.get(&stale).await.unwrap().is_none());
    assert!(cache.get(&fresh).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn stats_count_hits_and_misses() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileCache::open(dir.path()).unwrap();
    let key = key(b"tree");

    assert!(cache.get(&key).await.unwrap().is_none());
    let mut writer = cache.put(&key).await.unwrap().unwrap();
    writer.write_all(b"x").unwrap();
    drop(writer);
    cache.commit(&key).await.unwrap();
    cache.get(&key).await.unwrap().unwrap();

    assert_eq!(cache.stats(), CacheStatsSnapshot { hits: 1, misses: 1 });
  }
}
