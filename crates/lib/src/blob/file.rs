//! File-backed blobs: one file per key under a store root.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::{Blob, StorageError};

/// A blob stored as a single file.
///
/// Clones share the writer-exclusivity flag, so two handles to the same
/// entry cannot both open an append stream. The file's mtime doubles as the
/// last-accessed timestamp for eviction policies.
#[derive(Clone)]
pub struct FileBlob {
  path: PathBuf,
  writer_active: Arc<AtomicBool>,
}

impl FileBlob {
  fn new(path: PathBuf, writer_active: Arc<AtomicBool>) -> Self {
    Self { path, writer_active }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn exists(&self) -> bool {
    self.path.exists()
  }
}

impl Blob for FileBlob {
  fn size(&self) -> u64 {
    fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
  }

  fn append(&self) -> Option<Box<dyn Write + Send>> {
    if self
      .writer_active
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return None;
    }
    match OpenOptions::new().append(true).create(true).open(&self.path) {
      Ok(file) => Some(Box::new(FileBlobWriter {
        file,
        writer_active: Arc::clone(&self.writer_active),
      })),
      Err(error) => {
        warn!(path = %self.path.display(), %error, "failed to open append stream");
        self.writer_active.store(false, Ordering::SeqCst);
        None
      }
    }
  }

  fn read(&self) -> Result<Box<dyn Read + Send>, StorageError> {
    if self.writer_active.load(Ordering::SeqCst) {
      return Err(StorageError::AppendInProgress);
    }
    let file = fs::File::open(&self.path)?;
    Ok(Box::new(file))
  }

  fn touch(&self) -> Result<(), StorageError> {
    let file = OpenOptions::new().append(true).open(&self.path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
  }

  fn last_accessed(&self) -> Result<SystemTime, StorageError> {
    let meta = fs::metadata(&self.path)?;
    Ok(meta.modified().unwrap_or(UNIX_EPOCH))
  }
}

struct FileBlobWriter {
  file: fs::File,
  writer_active: Arc<AtomicBool>,
}

impl Write for FileBlobWriter {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.file.write(buf)
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.file.flush()
  }
}

impl Drop for FileBlobWriter {
  fn drop(&mut self) {
    self.writer_active.store(false, Ordering::SeqCst);
  }
}

/// Directory of file blobs keyed by file name.
pub struct FileBlobStore {
  root: PathBuf,
  writers: Mutex<HashMap<PathBuf, Arc<AtomicBool>>>,
}

impl FileBlobStore {
  /// Open (and create if needed) the store root.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
    let root = root.into();
    fs::create_dir_all(&root)?;
    Ok(Self {
      root,
      writers: Mutex::new(HashMap::new()),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Handle for the named entry; the file may not exist yet.
  pub fn blob(&self, name: &str) -> FileBlob {
    let path = self.root.join(name);
    let mut writers = self.writers.lock().unwrap();
    let flag = writers.entry(path.clone()).or_default();
    FileBlob::new(path, Arc::clone(flag))
  }

  /// Delete the named entry. No-op success when absent.
  pub fn remove(&self, name: &str) -> bool {
    let path = self.root.join(name);
    match fs::remove_file(&path) {
      Ok(()) => {
        debug!(path = %path.display(), "removed blob file");
        true
      }
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
      Err(error) => {
        warn!(path = %path.display(), %error, "failed to remove blob file");
        false
      }
    }
  }
}
