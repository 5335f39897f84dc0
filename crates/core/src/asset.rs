//! Source assets and the object-database contract.
//!
//! The object database is an external collaborator: the pipeline only ever
//! reads serialized source objects from it and writes built products back.
//! `MemoryObjectDatabase` is the in-process implementation used by tests and
//! by hosts that stage content entirely in memory.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::guid::Guid;
use crate::hash::{Fingerprint, FingerprintBuilder};

/// Runtime type tag of a source asset, e.g. `"texture"` or `"mesh"`.
///
/// Pipelines claim the type tags they can build; the tag is how a source
/// asset is routed to exactly one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetTypeId(pub String);

impl AssetTypeId {
  pub fn new(tag: impl Into<String>) -> Self {
    Self(tag.into())
  }
}

impl std::fmt::Display for AssetTypeId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// An immutable serialized source object, identified by guid and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAsset {
  pub guid: Guid,
  pub version: u32,
  pub type_id: AssetTypeId,
  pub name: String,
  pub data: Vec<u8>,
}

impl SourceAsset {
  /// Digest over the asset's own bytes and version, before any children or
  /// pipeline settings are folded in.
  pub fn content_fingerprint(&self) -> Fingerprint {
    FingerprintBuilder::new()
      .text(&self.type_id.0)
      .number(u64::from(self.version))
      .bytes(&self.data)
      .finish()
  }
}

/// Errors from the object database.
#[derive(Debug, Error)]
pub enum DbError {
  #[error("no instance with guid {0}")]
  NotFound(Guid),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Contract consumed by the pipeline: read sources, persist products.
///
/// The database is never used to store the build cache.
pub trait ObjectDatabase: Send + Sync {
  /// Fetch the current versioned instance of a source object.
  fn get_instance(&self, guid: Guid) -> Result<Arc<SourceAsset>, DbError>;

  /// Open a writer for a built product. The instance becomes visible (with
  /// a bumped version) once the writer is dropped.
  fn create_output_instance(&self, path: &str, guid: Guid) -> Result<Box<dyn Write + Send>, DbError>;
}

/// A built product persisted into the output database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInstance {
  pub path: String,
  pub version: u32,
  pub data: Vec<u8>,
}

/// In-process object database.
#[derive(Default)]
pub struct MemoryObjectDatabase {
  sources: RwLock<HashMap<Guid, Arc<SourceAsset>>>,
  outputs: Arc<Mutex<HashMap<Guid, OutputInstance>>>,
}

impl MemoryObjectDatabase {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert or replace a source object, bumping nothing: the caller owns
  /// versioning of sources.
  pub fn insert_source(&self, asset: SourceAsset) {
    self.sources.write().unwrap().insert(asset.guid, Arc::new(asset));
  }

  /// Replace a source's payload, bumping its version. Returns false if the
  /// guid is unknown.
  pub fn update_source(&self, guid: Guid, data: Vec<u8>) -> bool {
    let mut sources = self.sources.write().unwrap();
    match sources.get(&guid) {
      Some(existing) => {
        let mut updated = (**existing).clone();
        updated.version += 1;
        updated.data = data;
        sources.insert(guid, Arc::new(updated));
        true
      }
      None => false,
    }
  }

  /// Read back a built product.
  pub fn output(&self, guid: Guid) -> Option<OutputInstance> {
    self.outputs.lock().unwrap().get(&guid).cloned()
  }

  pub fn output_count(&self) -> usize {
    self.outputs.lock().unwrap().len()
  }
}

impl ObjectDatabase for MemoryObjectDatabase {
  fn get_instance(&self, guid: Guid) -> Result<Arc<SourceAsset>, DbError> {
    self
      .sources
      .read()
      .unwrap()
      .get(&guid)
      .cloned()
      .ok_or(DbError::NotFound(guid))
  }

  fn create_output_instance(&self, path: &str, guid: Guid) -> Result<Box<dyn Write + Send>, DbError> {
    Ok(Box::new(MemoryOutputWriter {
      outputs: Arc::clone(&self.outputs),
      path: path.to_string(),
      guid,
      buffer: Vec::new(),
    }))
  }
}

struct MemoryOutputWriter {
  outputs: Arc<Mutex<HashMap<Guid, OutputInstance>>>,
  path: String,
  guid: Guid,
  buffer: Vec<u8>,
}

impl Write for MemoryOutputWriter {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.buffer.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

impl Drop for MemoryOutputWriter {
  fn drop(&mut self) {
    let mut outputs = self.outputs.lock().unwrap();
    let version = outputs.get(&self.guid).map(|o| o.version + 1).unwrap_or(1);
    debug!(guid = %self.guid, path = %self.path, version, "persisted output instance");
    outputs.insert(
      self.guid,
      OutputInstance {
        path: std::mem::take(&mut self.path),
        version,
        data: std::mem::take(&mut self.buffer),
      },
    );
  }
}
