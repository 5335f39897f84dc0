//! Chunked in-memory blobs and the slab that owns them.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::{Blob, CHUNK_SIZE, StorageError};

/// Index of a blob inside a [`MemoryBlobStore`] slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub u32);

impl std::fmt::Display for BlobId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Shared byte budget across all blobs of one store.
struct MemoryBudget {
  capacity: Option<u64>,
  used: AtomicU64,
}

impl MemoryBudget {
  fn reserve(&self, bytes: u64) -> bool {
    let prev = self.used.fetch_add(bytes, Ordering::SeqCst);
    if let Some(capacity) = self.capacity
      && prev + bytes > capacity
    {
      self.used.fetch_sub(bytes, Ordering::SeqCst);
      return false;
    }
    true
  }

  fn release(&self, bytes: u64) {
    self.used.fetch_sub(bytes, Ordering::SeqCst);
  }

  fn exhausted(&self) -> bool {
    match self.capacity {
      Some(capacity) => self.used.load(Ordering::SeqCst) >= capacity,
      None => false,
    }
  }
}

/// Fixed-size chunk list. Resizing adds or drops whole chunks so no byte is
/// ever copied on growth.
struct Chunks {
  chunks: Vec<Box<[u8]>>,
  len: u64,
  budget: Arc<MemoryBudget>,
}

impl Chunks {
  fn new(budget: Arc<MemoryBudget>) -> Self {
    Self {
      chunks: Vec::new(),
      len: 0,
      budget,
    }
  }

  /// Grow or shrink to hold `new_len` bytes, chunk by chunk.
  fn resize(&mut self, new_len: u64) -> Result<(), StorageError> {
    let needed = (new_len as usize).div_ceil(CHUNK_SIZE);
    while self.chunks.len() < needed {
      if !self.budget.reserve(CHUNK_SIZE as u64) {
        return Err(StorageError::Allocation(format!(
          "memory store capacity exceeded at {} bytes",
          self.budget.used.load(Ordering::SeqCst)
        )));
      }
      self.chunks.push(vec![0u8; CHUNK_SIZE].into_boxed_slice());
    }
    while self.chunks.len() > needed {
      self.chunks.pop();
      self.budget.release(CHUNK_SIZE as u64);
    }
    self.len = new_len;
    Ok(())
  }

  /// The readable slice starting at `offset`, bounded by both the chunk end
  /// and the blob length.
  fn chunk_at(&self, offset: u64) -> &[u8] {
    let chunk = (offset / CHUNK_SIZE as u64) as usize;
    let within = (offset % CHUNK_SIZE as u64) as usize;
    let available = (self.len - offset).min((CHUNK_SIZE - within) as u64) as usize;
    &self.chunks[chunk][within..within + available]
  }

  fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
    let mut offset = self.len;
    self.resize(self.len + data.len() as u64)?;

    let mut remaining = data;
    while !remaining.is_empty() {
      let chunk = (offset / CHUNK_SIZE as u64) as usize;
      let within = (offset % CHUNK_SIZE as u64) as usize;
      let n = remaining.len().min(CHUNK_SIZE - within);
      self.chunks[chunk][within..within + n].copy_from_slice(&remaining[..n]);
      offset += n as u64;
      remaining = &remaining[n..];
    }
    Ok(())
  }

  fn read_at(&self, mut offset: u64, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    while offset < self.len && copied < buf.len() {
      let chunk = self.chunk_at(offset);
      let n = chunk.len().min(buf.len() - copied);
      buf[copied..copied + n].copy_from_slice(&chunk[..n]);
      offset += n as u64;
      copied += n;
    }
    copied
  }
}

impl Drop for Chunks {
  fn drop(&mut self) {
    self.budget.release((self.chunks.len() * CHUNK_SIZE) as u64);
    self.chunks.clear();
  }
}

struct MemoryBlobInner {
  chunks: RwLock<Chunks>,
  writer_active: AtomicBool,
  /// Nanoseconds since the unix epoch of the last read or touch.
  last_accessed: AtomicU64,
}

/// A chunked in-memory blob. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct MemoryBlob {
  inner: Arc<MemoryBlobInner>,
}

fn now_nanos() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos() as u64
}

impl MemoryBlob {
  fn new(budget: Arc<MemoryBudget>) -> Self {
    Self {
      inner: Arc::new(MemoryBlobInner {
        chunks: RwLock::new(Chunks::new(budget)),
        writer_active: AtomicBool::new(false),
        last_accessed: AtomicU64::new(now_nanos()),
      }),
    }
  }

  /// Whether the exclusive append stream is currently open.
  pub fn is_appending(&self) -> bool {
    self.inner.writer_active.load(Ordering::SeqCst)
  }
}

impl Blob for MemoryBlob {
  fn size(&self) -> u64 {
    self.inner.chunks.read().unwrap().len
  }

  fn append(&self) -> Option<Box<dyn Write + Send>> {
    if self
      .inner
      .writer_active
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return None;
    }
    Some(Box::new(MemoryBlobWriter { blob: self.clone() }))
  }

  fn read(&self) -> Result<Box<dyn Read + Send>, StorageError> {
    if self.is_appending() {
      return Err(StorageError::AppendInProgress);
    }
    self.inner.last_accessed.store(now_nanos(), Ordering::SeqCst);
    Ok(Box::new(MemoryBlobReader {
      blob: self.clone(),
      offset: 0,
    }))
  }

  fn touch(&self) -> Result<(), StorageError> {
    self.inner.last_accessed.store(now_nanos(), Ordering::SeqCst);
    Ok(())
  }

  fn last_accessed(&self) -> Result<SystemTime, StorageError> {
    let nanos = self.inner.last_accessed.load(Ordering::SeqCst);
    Ok(UNIX_EPOCH + Duration::from_nanos(nanos))
  }
}

struct MemoryBlobWriter {
  blob: MemoryBlob,
}

impl Write for MemoryBlobWriter {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    let mut chunks = self.blob.inner.chunks.write().unwrap();
    chunks.append(buf).map_err(std::io::Error::other)?;
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

impl Drop for MemoryBlobWriter {
  fn drop(&mut self) {
    self.blob.inner.writer_active.store(false, Ordering::SeqCst);
  }
}

struct MemoryBlobReader {
  blob: MemoryBlob,
  offset: u64,
}

impl Read for MemoryBlobReader {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    let chunks = self.blob.inner.chunks.read().unwrap();
    let n = chunks.read_at(self.offset, buf);
    self.offset += n as u64;
    self.blob.inner.last_accessed.store(now_nanos(), Ordering::SeqCst);
    Ok(n)
  }
}

struct Slab {
  slots: Vec<Option<MemoryBlob>>,
  free: Vec<u32>,
}

/// Slab of memory blobs keyed by [`BlobId`].
///
/// Cache metadata maps keys to ids; removing an id drops the storage once
/// the last reader handle goes away.
pub struct MemoryBlobStore {
  slab: Mutex<Slab>,
  budget: Arc<MemoryBudget>,
}

impl MemoryBlobStore {
  pub fn new() -> Self {
    Self::with_capacity(None)
  }

  /// A store that refuses to grow past `capacity` bytes of chunk storage.
  pub fn with_capacity(capacity: Option<u64>) -> Self {
    Self {
      slab: Mutex::new(Slab {
        slots: Vec::new(),
        free: Vec::new(),
      }),
      budget: Arc::new(MemoryBudget {
        capacity,
        used: AtomicU64::new(0),
      }),
    }
  }

  /// Create a new empty blob.
  pub fn allocate(&self) -> Result<BlobId, StorageError> {
    if self.budget.exhausted() {
      return Err(StorageError::Allocation("memory store at capacity".to_string()));
    }
    let blob = MemoryBlob::new(Arc::clone(&self.budget));
    let mut slab = self.slab.lock().unwrap();
    let id = match slab.free.pop() {
      Some(slot) => {
        slab.slots[slot as usize] = Some(blob);
        BlobId(slot)
      }
      None => {
        slab.slots.push(Some(blob));
        BlobId((slab.slots.len() - 1) as u32)
      }
    };
    Ok(id)
  }

  /// Handle to a live blob.
  pub fn blob(&self, id: BlobId) -> Option<MemoryBlob> {
    let slab = self.slab.lock().unwrap();
    slab.slots.get(id.0 as usize).and_then(|slot| slot.clone())
  }

  /// Drop a blob. No-op success when the id is already gone.
  pub fn remove(&self, id: BlobId) -> bool {
    let mut slab = self.slab.lock().unwrap();
    if let Some(slot) = slab.slots.get_mut(id.0 as usize)
      && slot.take().is_some()
    {
      slab.free.push(id.0);
      debug!(blob = %id, "removed memory blob");
    }
    true
  }

  /// Bytes of chunk storage currently allocated.
  pub fn used_bytes(&self) -> u64 {
    self.budget.used.load(Ordering::SeqCst)
  }

  /// Number of live blobs.
  pub fn len(&self) -> usize {
    let slab = self.slab.lock().unwrap();
    slab.slots.iter().filter(|slot| slot.is_some()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for MemoryBlobStore {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn append_grows_one_chunk_at_a_time() {
    let store = MemoryBlobStore::new();
    let id = store.allocate().unwrap();
    let blob = store.blob(id).unwrap();

    let mut writer = blob.append().unwrap();
    writer.write_all(&[1u8; 100]).unwrap();
    drop(writer);
    assert_eq!(store.used_bytes(), CHUNK_SIZE as u64);

    let mut writer = blob.append().unwrap();
    writer.write_all(&vec![2u8; CHUNK_SIZE]).unwrap();
    drop(writer);
    assert_eq!(blob.size(), 100 + CHUNK_SIZE as u64);
    assert_eq!(store.used_bytes(), 2 * CHUNK_SIZE as u64);
  }

  #[test]
  fn shrink_releases_chunks() {
    let budget = Arc::new(MemoryBudget {
      capacity: None,
      used: AtomicU64::new(0),
    });
    let mut chunks = Chunks::new(Arc::clone(&budget));
    chunks.resize(3 * CHUNK_SIZE as u64).unwrap();
    assert_eq!(budget.used.load(Ordering::SeqCst), 3 * CHUNK_SIZE as u64);

    chunks.resize(CHUNK_SIZE as u64 / 2).unwrap();
    assert_eq!(budget.used.load(Ordering::SeqCst), CHUNK_SIZE as u64);
    assert_eq!(chunks.len, CHUNK_SIZE as u64 / 2);
  }

  #[test]
  fn second_append_stream_is_refused() {
    let store = MemoryBlobStore::new();
    let blob = store.blob(store.allocate().unwrap()).unwrap();

    let writer = blob.append().unwrap();
    assert!(blob.append().is_none());
    drop(writer);
    assert!(blob.append().is_some());
  }

  #[test]
  fn read_is_refused_while_appending() {
    let store = MemoryBlobStore::new();
    let blob = store.blob(store.allocate().unwrap()).unwrap();

    let writer = blob.append().unwrap();
    assert!(matches!(blob.read(), Err(StorageError::AppendInProgress)));
    drop(writer);
    assert!(blob.read().is_ok());
  }

  #[test]
  fn concurrent_readers_see_the_same_bytes() {
    let store = MemoryBlobStore::new();
    let blob = store.blob(store.allocate().unwrap()).unwrap();
    blob.append().unwrap().write_all(b"shared bytes").unwrap();

    let mut first = blob.read().unwrap();
    let mut second = blob.read().unwrap();
    let mut a = Vec::new();
    let mut b = Vec::new();
    first.read_to_end(&mut a).unwrap();
    second.read_to_end(&mut b).unwrap();
    assert_eq!(a, b"shared bytes");
    assert_eq!(a, b);
  }

  #[test]
  fn read_refreshes_last_accessed_but_append_does_not() {
    let store = MemoryBlobStore::new();
    let blob = store.blob(store.allocate().unwrap()).unwrap();
    blob.append().unwrap().write_all(b"x").unwrap();

    let mut reader = blob.read().unwrap();
    let mut buf = [0u8; 1];
    reader.read(&mut buf).unwrap();
    drop(reader);
    let after_read = blob.last_accessed().unwrap();

    std::thread::sleep(std::time::Duration::from_millis(5));
    blob.append().unwrap().write_all(b"y").unwrap();
    assert_eq!(blob.last_accessed().unwrap(), after_read);

    std::thread::sleep(std::time::Duration::from_millis(5));
    blob.touch().unwrap();
    assert!(blob.last_accessed().unwrap() > after_read);
  }

  #[test]
  fn capacity_exhaustion_fails_allocation_only() {
    let store = MemoryBlobStore::with_capacity(Some(CHUNK_SIZE as u64));
    let id = store.allocate().unwrap();
    let blob = store.blob(id).unwrap();

    // Fills the single permitted chunk.
    blob.append().unwrap().write_all(&vec![0u8; CHUNK_SIZE]).unwrap();

    // A second chunk cannot be reserved.
    let mut writer = blob.append().unwrap();
    assert!(writer.write_all(&[1u8]).is_err());
    drop(writer);

    // Existing data is still intact and readable.
    let mut back = Vec::new();
    blob.read().unwrap().read_to_end(&mut back).unwrap();
    assert_eq!(back.len(), CHUNK_SIZE);

    assert!(store.allocate().is_err());

    // Chunk storage is released once the last handle is gone.
    drop(blob);
    store.remove(id);
    assert!(store.allocate().is_ok());
  }

  #[test]
  fn remove_is_noop_success_when_absent() {
    let store = MemoryBlobStore::new();
    let id = store.allocate().unwrap();
    assert!(store.remove(id));
    assert!(store.remove(id));
    assert!(store.blob(id).is_none());
    assert_eq!(store.used_bytes(), 0);
  }

  #[test]
  fn slots_are_reused_after_removal() {
    let store = MemoryBlobStore::new();
    let first = store.allocate().unwrap();
    store.remove(first);
    let second = store.allocate().unwrap();
    assert_eq!(first, second);
    assert_eq!(store.len(), 1);
  }

  proptest! {
    #[test]
    fn roundtrip_any_size(data in proptest::collection::vec(any::<u8>(), 0..(3 * CHUNK_SIZE))) {
      let store = MemoryBlobStore::new();
      let blob = store.blob(store.allocate().unwrap()).unwrap();

      blob.append().unwrap().write_all(&data).unwrap();

      let mut back = Vec::new();
      blob.read().unwrap().read_to_end(&mut back).unwrap();
      prop_assert_eq!(back, data);
    }
  }
}
