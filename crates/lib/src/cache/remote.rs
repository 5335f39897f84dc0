//! Remote cache backend over opaque request/response pairs.
//!
//! The wire contract is GET (bytes or miss), PUT (upload), and COMMIT
//! (promote); any framing beyond the path shape is the server's business.
//! A `put` spools locally so nothing reaches the wire until `commit`, which
//! streams the finished spool and then issues the commit request — a remote
//! reader can therefore never observe a partial entry.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{CacheBackend, CacheError, CacheKey, CacheReader, CacheStats, CacheStatsSnapshot, CacheWriter};

const DEFAULT_MAX_CONNECTIONS: usize = 8;
const UPLOAD_CHUNK: usize = 64 * 1024;

/// Connection settings for a remote cache.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
  pub url: String,
  pub read: bool,
  pub write: bool,
  pub max_connections: usize,
}

impl RemoteOptions {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      read: true,
      write: true,
      max_connections: DEFAULT_MAX_CONNECTIONS,
    }
  }
}

/// Network cache backend.
///
/// Read access and write access are independently togglable so an operator
/// can disable a misbehaving direction without losing the other. Outbound
/// requests share a pooled client and are additionally bounded by a
/// semaphore.
pub struct RemoteCache {
  client: reqwest::Client,
  base_url: String,
  read_enabled: AtomicBool,
  write_enabled: AtomicBool,
  connections: Semaphore,
  pending: Mutex<HashMap<CacheKey, NamedTempFile>>,
  stats: CacheStats,
}

impl RemoteCache {
  pub fn new(options: RemoteOptions) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: options.url.trim_end_matches('/').to_string(),
      read_enabled: AtomicBool::new(options.read),
      write_enabled: AtomicBool::new(options.write),
      connections: Semaphore::new(options.max_connections.max(1)),
      pending: Mutex::new(HashMap::new()),
      stats: CacheStats::new(),
    }
  }

  /// Connect with default access flags and connection bounds.
  pub fn connect(url: impl Into<String>) -> Self {
    Self::new(RemoteOptions::new(url))
  }

  pub fn set_read_enabled(&self, enabled: bool) {
    self.read_enabled.store(enabled, Ordering::SeqCst);
  }

  pub fn set_write_enabled(&self, enabled: bool) {
    self.write_enabled.store(enabled, Ordering::SeqCst);
  }

  pub fn read_enabled(&self) -> bool {
    self.read_enabled.load(Ordering::SeqCst)
  }

  pub fn write_enabled(&self) -> bool {
    self.write_enabled.load(Ordering::SeqCst)
  }

  /// Drop the local spool for a pending entry.
  pub fn abandon(&self, key: &CacheKey) -> bool {
    self.pending.lock().unwrap().remove(key).is_some()
  }

  fn entry_url(&self, key: &CacheKey) -> String {
    format!("{}/blob/{}/{}", self.base_url, key.guid.simple(), key.fingerprint)
  }
}

#[async_trait]
impl CacheBackend for RemoteCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<CacheReader>, CacheError> {
    if !self.read_enabled() {
      self.stats.miss();
      return Ok(None);
    }

    let _permit = self.connections.acquire().await.unwrap();
    let response = self.client.get(self.entry_url(key)).send().await?;
    match response.status() {
      StatusCode::NOT_FOUND => {
        self.stats.miss();
        Ok(None)
      }
      status if status.is_success() => {
        let bytes = response.bytes().await?;
        self.stats.hit();
        Ok(Some(Box::new(Cursor::new(bytes.to_vec()))))
      }
      status => Err(CacheError::Remote {
        status: status.as_u16(),
      }),
    }
  }

  async fn put(&self, key: &CacheKey) -> Result<Option<CacheWriter>, CacheError> {
    if !self.write_enabled() {
      return Ok(None);
    }

    let mut pending = self.pending.lock().unwrap();
    if pending.contains_key(key) {
      return Ok(None);
    }

    let spool = NamedTempFile::new()?;
    let writer = spool.as_file().try_clone()?;
    pending.insert(key.clone(), spool);
    Ok(Some(Box::new(writer)))
  }

  async fn commit(&self, key: &CacheKey) -> Result<bool, CacheError> {
    let Some(spool) = self.pending.lock().unwrap().remove(key) else {
      return Ok(false);
    };

    let _permit = self.connections.acquire().await.unwrap();

    // Stream the spool so a large product is never buffered whole.
    let file = tokio::fs::File::open(spool.path()).await?;
    let chunks = futures_util::stream::try_unfold(file, |mut file| async move {
      let mut buf = vec![0u8; UPLOAD_CHUNK];
      let n = file.read(&mut buf).await?;
      if n == 0 {
        Ok::<_, std::io::Error>(None)
      } else {
        buf.truncate(n);
        Ok(Some((buf, file)))
      }
    });

    let upload = self
      .client
      .put(self.entry_url(key))
      .body(reqwest::Body::wrap_stream(chunks))
      .send()
      .await?;
    match upload.status() {
      StatusCode::CONFLICT => {
        // Another session already holds the remote pending slot; its commit
        // will carry identical content.
        debug!(%key, "remote put busy, yielding to the other producer");
        return Ok(false);
      }
      status if !status.is_success() => {
        return Err(CacheError::Remote {
          status: status.as_u16(),
        });
      }
      _ => {}
    }

    let commit = self
      .client
      .post(format!("{}/commit", self.entry_url(key)))
      .send()
      .await?;
    match commit.status() {
      status if status.is_success() => {
        debug!(%key, "committed remote cache entry");
        Ok(true)
      }
      StatusCode::CONFLICT => {
        debug!(%key, "remote commit lost the race, duplicate content discarded");
        Ok(false)
      }
      status => {
        warn!(%key, status = status.as_u16(), "remote commit failed");
        Err(CacheError::Remote {
          status: status.as_u16(),
        })
      }
    }
  }

  fn stats(&self) -> CacheStatsSnapshot {
    self.stats.snapshot()
  }
}
