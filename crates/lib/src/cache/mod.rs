//! Build cache: uniform get/put/commit/stats over pluggable backends.
//!
//! An entry is keyed by (output guid, fingerprint) and moves through
//! absent → pending → committed. `get` only ever observes committed
//! entries, `put` admits at most one producer per key, and `commit`
//! promotes the matching pending entry. Separating put from commit lets a
//! backend stream a large product without buffering it, and guarantees an
//! interrupted build never leaves a half-visible entry.
//!
//! Backends: process-local memory, local disk, and a remote store reached
//! over opaque request/response pairs.

pub mod file;
pub mod memory;
pub mod remote;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use kiln_core::{Fingerprint, Guid};

use crate::blob::StorageError;

pub use file::FileCache;
pub use memory::MemoryCache;
pub use remote::RemoteCache;

/// Address of one cache entry: which output, built from which exact inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub guid: Guid,
  pub fingerprint: Fingerprint,
}

impl CacheKey {
  pub fn new(guid: Guid, fingerprint: Fingerprint) -> Self {
    Self { guid, fingerprint }
  }

  /// Stable file-name form: `<guid>-<fingerprint>`.
  pub fn entry_name(&self) -> String {
    format!("{}-{}", self.guid.simple(), self.fingerprint)
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}@{}", self.guid, self.fingerprint.short())
  }
}

/// Errors from a cache backend. The scheduler degrades every one of these
/// to a miss; they never fail a build.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("remote cache transport error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("remote cache returned status {status}")]
  Remote { status: u16 },
}

/// Cumulative hit/miss counters.
#[derive(Default)]
pub struct CacheStats {
  hits: AtomicU64,
  misses: AtomicU64,
}

impl CacheStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CacheStatsSnapshot {
    CacheStatsSnapshot {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time view of a backend's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
  pub hits: u64,
  pub misses: u64,
}

/// Read stream over a committed entry.
pub type CacheReader = Box<dyn Read + Send>;

/// Write stream into a pending entry.
pub type CacheWriter = Box<dyn Write + Send>;

/// The backend contract.
///
/// `get` never blocks on a concurrent `put` for a different key; each
/// backend guards its own pending/committed state independently. Entries
/// are content-addressed and idempotent, so two sessions racing to produce
/// the same fingerprint are safe: the first commit wins and a later
/// identical commit is a harmless duplicate.
#[async_trait]
pub trait CacheBackend: Send + Sync {
  /// Stream a committed entry, or report a miss.
  async fn get(&self, key: &CacheKey) -> Result<Option<CacheReader>, CacheError>;

  /// Open a pending entry for writing. Returns `None` while a put for the
  /// same key is already pending (at most one producer per key).
  async fn put(&self, key: &CacheKey) -> Result<Option<CacheWriter>, CacheError>;

  /// Promote the matching pending entry to committed. Returns `false` when
  /// no matching pending entry exists.
  async fn commit(&self, key: &CacheKey) -> Result<bool, CacheError>;

  /// Cumulative hit/miss counters.
  fn stats(&self) -> CacheStatsSnapshot;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn entry_name_is_stable_and_filesystem_safe() {
    let key = CacheKey::new(Guid::generate(), kiln_core::hash_bytes(b"x"));
    let name = key.entry_name();
    assert_eq!(name, key.entry_name());
    assert_eq!(name.len(), 32 + 1 + 64);
    assert!(name.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
  }

  #[test]
  fn stats_accumulate() {
    let stats = CacheStats::new();
    stats.hit();
    stats.hit();
    stats.miss();
    assert_eq!(stats.snapshot(), CacheStatsSnapshot { hits: 2, misses: 1 });
  }
}
