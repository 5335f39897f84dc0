//! Stable identity for source assets and build outputs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a source asset or a built output.
///
/// A `Guid` is opaque to the pipeline: it never encodes content. Within one
/// build session an output `Guid` corresponds to exactly one dependency
/// node, so diamond-shaped references collapse instead of duplicating work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Guid(pub Uuid);

impl Guid {
  /// Generate a fresh random identity.
  pub fn generate() -> Self {
    Self(Uuid::new_v4())
  }

  /// The all-zero identity. Used as a sentinel, never for real assets.
  pub fn nil() -> Self {
    Self(Uuid::nil())
  }

  /// Compact 32-character lowercase hex form, suitable for file names.
  pub fn simple(&self) -> String {
    self.0.simple().to_string()
  }
}

impl std::fmt::Display for Guid {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<Uuid> for Guid {
  fn from(value: Uuid) -> Self {
    Self(value)
  }
}
