//! Append-only blob storage backing the build cache.
//!
//! A blob is an opaque, appendable, readable byte sequence. Two variants
//! exist: chunked in-memory storage (`MemoryBlob`, held in a slab-style
//! `MemoryBlobStore`) and file-backed storage (`FileBlob`, one file per key
//! under a `FileBlobStore` root). Cache backends address blobs through an
//! integer id or a file name; blobs never point back at their owner.

pub mod file;
pub mod memory;

use std::io::{Read, Write};
use std::time::SystemTime;

use thiserror::Error;

pub use file::{FileBlob, FileBlobStore};
pub use memory::{BlobId, MemoryBlob, MemoryBlobStore};

/// Fixed chunk size for memory-backed blobs. Growth allocates one chunk at
/// a time so appending never triggers a large reallocation.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Errors from the blob storage layer. Fatal for the affected cache
/// operation only, never for the build.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("blob allocation failed: {0}")]
  Allocation(String),

  #[error("blob has an append stream open")]
  AppendInProgress,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// An append-only byte sequence.
///
/// At most one append stream may be open at a time; readers are independent
/// of each other but are refused while an append stream is open.
pub trait Blob: Send + Sync {
  /// Current length in bytes.
  fn size(&self) -> u64;

  /// Open the exclusive write stream, positioned at the end. Returns `None`
  /// if a stream is already open or the stream cannot be allocated.
  fn append(&self) -> Option<Box<dyn Write + Send>>;

  /// Open an independent read stream positioned at offset zero.
  fn read(&self) -> Result<Box<dyn Read + Send>, StorageError>;

  /// Refresh the last-accessed timestamp for eviction policies.
  fn touch(&self) -> Result<(), StorageError>;

  /// Timestamp of the most recent read or touch.
  fn last_accessed(&self) -> Result<SystemTime, StorageError>;
}
