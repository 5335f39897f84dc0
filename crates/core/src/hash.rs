//! Content fingerprints for change detection and cache addressing.
//!
//! A fingerprint is the full 64-character SHA-256 hex digest over a source
//! asset, the fingerprints of all of its resolved children, and the settings
//! of the pipeline that builds it. Because children are folded in, any change
//! in a subtree changes every ancestor's fingerprint.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content digest identifying one exact build input state.
///
/// Lowercase hexadecimal, 64 characters. Together with an output `Guid`
/// this forms the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  /// Short prefix for log lines.
  pub fn short(&self) -> &str {
    let end = self.0.len().min(12);
    &self.0[..end]
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Incremental fingerprint computation.
///
/// Every field is written with a one-byte tag and its length so that
/// adjacent fields can never be confused for each other.
pub struct FingerprintBuilder {
  hasher: Sha256,
}

impl FingerprintBuilder {
  pub fn new() -> Self {
    Self { hasher: Sha256::new() }
  }

  fn field(&mut self, tag: u8, data: &[u8]) {
    self.hasher.update([tag]);
    self.hasher.update((data.len() as u64).to_le_bytes());
    self.hasher.update(data);
  }

  pub fn bytes(mut self, data: &[u8]) -> Self {
    self.field(b'B', data);
    self
  }

  pub fn text(mut self, text: &str) -> Self {
    self.field(b'S', text.as_bytes());
    self
  }

  pub fn number(mut self, value: u64) -> Self {
    self.field(b'N', &value.to_le_bytes());
    self
  }

  pub fn fingerprint(mut self, child: &Fingerprint) -> Self {
    self.field(b'F', child.0.as_bytes());
    self
  }

  pub fn finish(self) -> Fingerprint {
    Fingerprint(hex::encode(self.hasher.finalize()))
  }
}

impl Default for FingerprintBuilder {
  fn default() -> Self {
    Self::new()
  }
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> Fingerprint {
  let mut hasher = Sha256::new();
  hasher.update(data);
  Fingerprint(hex::encode(hasher.finalize()))
}

/// Hash a file's contents without reading it into memory at once.
pub fn hash_file(path: &Path) -> std::io::Result<Fingerprint> {
  let mut file = std::fs::File::open(path)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let n = file.read(&mut buffer)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(Fingerprint(hex::encode(hasher.finalize())))
}
