//! Configuration surface: which cache backend, access flags, worker count.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::remote::RemoteOptions;
use crate::cache::{CacheBackend, CacheError, FileCache, MemoryCache, RemoteCache};
use crate::schedule::BuildOptions;

fn default_workers() -> usize {
  4
}

fn default_queue_capacity() -> usize {
  64
}

fn default_true() -> bool {
  true
}

fn default_max_connections() -> usize {
  8
}

/// Errors loading or parsing a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid config: {0}")]
  Parse(#[from] toml::de::Error),
}

/// Top-level build configuration, typically loaded from TOML:
///
/// ```toml
/// workers = 8
/// force = false
///
/// [cache]
/// backend = "file"
/// root = "/var/cache/kiln"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
  #[serde(default = "default_workers")]
  pub workers: usize,

  #[serde(default = "default_queue_capacity")]
  pub queue_capacity: usize,

  #[serde(default)]
  pub force: bool,

  #[serde(default)]
  pub cache: CacheConfig,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      workers: default_workers(),
      queue_capacity: default_queue_capacity(),
      force: false,
      cache: CacheConfig::default(),
    }
  }
}

/// Which cache backend to instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheConfig {
  Memory {
    #[serde(default)]
    capacity_bytes: Option<u64>,
  },
  File {
    root: PathBuf,
  },
  Remote {
    url: String,
    #[serde(default = "default_true")]
    read: bool,
    #[serde(default = "default_true")]
    write: bool,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
  },
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self::Memory { capacity_bytes: None }
  }
}

impl BuildConfig {
  pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(text)?)
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml(&text)
  }

  pub fn options(&self) -> BuildOptions {
    BuildOptions {
      workers: self.workers,
      queue_capacity: self.queue_capacity,
      force: self.force,
    }
  }

  /// Instantiate the configured cache backend.
  pub fn build_cache(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
    match &self.cache {
      CacheConfig::Memory { capacity_bytes } => Ok(Arc::new(MemoryCache::with_capacity(*capacity_bytes))),
      CacheConfig::File { root } => Ok(Arc::new(FileCache::open(root.clone())?)),
      CacheConfig::Remote {
        url,
        read,
        write,
        max_connections,
      } => Ok(Arc::new(RemoteCache::new(RemoteOptions {
        url: url.clone(),
        read: *read,
        write: *write,
        max_connections: *max_connections,
      }))),
    }
  }
}
