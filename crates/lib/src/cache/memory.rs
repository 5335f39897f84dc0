//! Process-local cache backend over the in-memory blob slab.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::blob::{Blob, BlobId, MemoryBlobStore};

use super::{CacheBackend, CacheError, CacheKey, CacheReader, CacheStats, CacheStatsSnapshot, CacheWriter};

#[derive(Default)]
struct Entries {
  pending: HashMap<CacheKey, BlobId>,
  committed: HashMap<CacheKey, BlobId>,
}

/// In-memory cache backend.
///
/// Pending and committed entries live in two separate maps behind one lock,
/// so a reader can never observe a half-written entry: an entry only enters
/// the committed map as a single locked move.
pub struct MemoryCache {
  entries: Mutex<Entries>,
  blobs: MemoryBlobStore,
  stats: CacheStats,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::with_capacity(None)
  }

  /// Bound total blob storage; an exhausted store fails `put`, which the
  /// scheduler degrades to an uncached build.
  pub fn with_capacity(capacity: Option<u64>) -> Self {
    Self {
      entries: Mutex::new(Entries::default()),
      blobs: MemoryBlobStore::with_capacity(capacity),
      stats: CacheStats::new(),
    }
  }

  /// Drop a pending entry so another producer may claim the key.
  pub fn abandon(&self, key: &CacheKey) -> bool {
    let mut entries = self.entries.lock().unwrap();
    match entries.pending.remove(key) {
      Some(id) => {
        self.blobs.remove(id);
        debug!(%key, "abandoned pending entry");
        true
      }
      None => false,
    }
  }

  /// Remove committed entries last accessed before `cutoff`. Returns the
  /// number of evicted entries.
  pub fn evict_older_than(&self, cutoff: SystemTime) -> usize {
    let mut entries = self.entries.lock().unwrap();
    let stale: Vec<CacheKey> = entries
      .committed
      .iter()
      .filter(|&(_, &id)| {
        self
          .blobs
          .blob(id)
          .and_then(|blob| blob.last_accessed().ok())
          .is_some_and(|at| at < cutoff)
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &stale {
      if let Some(id) = entries.committed.remove(key) {
        self.blobs.remove(id);
        debug!(%key, "evicted cache entry");
      }
    }
    stale.len()
  }

  pub fn committed_len(&self) -> usize {
    self.entries.lock().unwrap().committed.len()
  }

  pub fn pending_len(&self) -> usize {
    self.entries.lock().unwrap().pending.len()
  }
}

impl Default for MemoryCache {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl CacheBackend for MemoryCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<CacheReader>, CacheError> {
    let entries = self.entries.lock().unwrap();
    match entries.committed.get(key).and_then(|&id| self.blobs.blob(id)) {
      Some(blob) => {
        let reader = blob.read()?;
        self.stats.hit();
        Ok(Some(reader))
      }
      None => {
        self.stats.miss();
        Ok(None)
      }
    }
  }

  async fn put(&self, key: &CacheKey) -> Result<Option<CacheWriter>, CacheError> {
    let mut entries = self.entries.lock().unwrap();
    if entries.pending.contains_key(key) {
      return Ok(None);
    }

    let id = self.blobs.allocate()?;
    let blob = self.blobs.blob(id).expect("freshly allocated blob");
    let writer = blob.append().ok_or_else(|| {
      crate::blob::StorageError::Allocation("fresh blob already has an append stream".to_string())
    })?;
    entries.pending.insert(key.clone(), id);
    Ok(Some(writer))
  }

  async fn commit(&self, key: &CacheKey) -> Result<bool, CacheError> {
    let mut entries = self.entries.lock().unwrap();
    let Some(&id) = entries.pending.get(key) else {
      return Ok(false);
    };

    // A producer that is still writing has not finished the entry; there is
    // no matching pending entry to promote yet.
    if self.blobs.blob(id).is_some_and(|blob| blob.is_appending()) {
      return Ok(false);
    }

    entries.pending.remove(key);
    if let Some(previous) = entries.committed.insert(key.clone(), id) {
      self.blobs.remove(previous);
    }
    debug!(%key, "committed cache entry");
    Ok(true)
  }

  fn stats(&self) -> CacheStatsSnapshot {
    self.stats.snapshot()
  }
}
