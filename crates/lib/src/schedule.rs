//! Build scheduling: a fixed worker pool walking the dependency graph.
//!
//! The graph is read-only by the time scheduling starts. A node becomes
//! ready once all of its build-required children have finished; ready nodes
//! are pushed onto one shared bounded queue that a fixed pool of workers
//! consumes. Workers block on an empty queue, the scheduler blocks on a full
//! one. Each worker consults the cache before invoking the node's pipeline,
//! and commits the product before reporting success.
//!
//! A failed node marks every transitive dependent failed without running
//! it; unrelated subtrees continue. Cache errors degrade to misses and are
//! never build failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use petgraph::graph::NodeIndex;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use kiln_core::{Guid, ObjectDatabase};

use crate::cache::{CacheBackend, CacheKey, CacheStatsSnapshot};
use crate::graph::{DependencyGraph, DependencyNode};
use crate::pipeline::{BuildContext, BuildError, BuildRequest};

/// Why a node was (or would be) rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildReason(u8);

impl BuildReason {
  pub const NONE: Self = Self(0);
  /// The session was started with force-rebuild.
  pub const FORCED: Self = Self(1);
  /// No committed cache entry existed for the node's exact key.
  pub const CACHE_MISS: Self = Self(2);
  /// A child was rebuilt, so the node rebuilds regardless of the cache.
  pub const DEPENDENCY: Self = Self(4);

  pub fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }

  pub fn insert(&mut self, other: Self) {
    self.0 |= other.0;
  }
}

impl BitOr for BuildReason {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

impl std::fmt::Display for BuildReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut parts = Vec::new();
    if self.contains(Self::FORCED) {
      parts.push("forced");
    }
    if self.contains(Self::CACHE_MISS) {
      parts.push("cache-miss");
    }
    if self.contains(Self::DEPENDENCY) {
      parts.push("dependency");
    }
    if parts.is_empty() {
      parts.push("none");
    }
    write!(f, "{}", parts.join("|"))
  }
}

/// Final state of one scheduled node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
  /// A committed cache entry matched; no pipeline work ran.
  UpToDate,
  /// The pipeline produced the output and it was persisted.
  Built,
  /// The node's own build failed, or a transitive dependency failed.
  Failed,
  /// The session was stopped before the node could run.
  Cancelled,
}

/// Per-node record in the session summary.
#[derive(Debug, Clone)]
pub struct NodeReport {
  pub name: String,
  pub guid: Guid,
  pub outcome: NodeOutcome,
  pub reason: BuildReason,
  pub error: Option<String>,
}

/// Scheduling configuration.
#[derive(Debug, Clone)]
pub struct BuildOptions {
  /// Fixed worker-pool size.
  pub workers: usize,
  /// Bound of the shared work queue.
  pub queue_capacity: usize,
  /// Rebuild every node regardless of the cache.
  pub force: bool,
}

impl Default for BuildOptions {
  fn default() -> Self {
    Self {
      workers: 4,
      queue_capacity: 64,
      force: false,
    }
  }
}

/// Outcome of one scheduling run.
#[derive(Debug)]
pub struct BuildSummary {
  pub reports: Vec<NodeReport>,
  pub built: usize,
  pub up_to_date: usize,
  pub failed: usize,
  pub cancelled: usize,
  pub cache: CacheStatsSnapshot,
}

impl BuildSummary {
  pub fn success(&self) -> bool {
    self.failed == 0 && self.cancelled == 0
  }

  pub fn total(&self) -> usize {
    self.built + self.up_to_date + self.failed + self.cancelled
  }

  pub fn report(&self, guid: Guid) -> Option<&NodeReport> {
    self.reports.iter().find(|r| r.guid == guid)
  }
}

struct WorkItem {
  idx: NodeIndex,
  reason: BuildReason,
}

enum WorkOutcome {
  UpToDate,
  Built,
  Failed(BuildError),
  Cancelled,
}

struct WorkerCtx {
  graph: Arc<DependencyGraph>,
  db: Arc<dyn ObjectDatabase>,
  cache: Arc<dyn CacheBackend>,
  stop: Arc<AtomicBool>,
}

/// Worker-pool scheduler over a finished dependency graph.
pub struct BuildScheduler {
  graph: Arc<DependencyGraph>,
  db: Arc<dyn ObjectDatabase>,
  cache: Arc<dyn CacheBackend>,
  options: BuildOptions,
  stop: Arc<AtomicBool>,
}

impl BuildScheduler {
  pub fn new(
    graph: DependencyGraph,
    db: Arc<dyn ObjectDatabase>,
    cache: Arc<dyn CacheBackend>,
    options: BuildOptions,
  ) -> Self {
    Self {
      graph: Arc::new(graph),
      db,
      cache,
      options,
      stop: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Share an externally owned stop flag (e.g. wired to a UI cancel
  /// button). Setting it stops dequeuing; in-flight builds finish.
  pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }

  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.stop)
  }

  /// Walk the graph to completion and report per-node outcomes.
  pub async fn run(&self) -> BuildSummary {
    let build_nodes = self.graph.build_nodes();
    let total = build_nodes.len();
    if total == 0 {
      info!("nothing to build");
      return self.summarize(HashMap::new());
    }

    // Readiness bookkeeping: pending child counts and reverse edges.
    let mut pending: HashMap<NodeIndex, usize> = HashMap::new();
    let mut parents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for &idx in &build_nodes {
      let children: HashSet<NodeIndex> = self
        .graph
        .children(idx)
        .filter(|&child| self.graph.node(child).flags.is_build())
        .collect();
      pending.insert(idx, children.len());
      for child in children {
        parents.entry(child).or_default().push(idx);
      }
    }

    let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(self.options.queue_capacity.max(1));
    let queue_rx = Arc::new(Mutex::new(queue_rx));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let ctx = Arc::new(WorkerCtx {
      graph: Arc::clone(&self.graph),
      db: Arc::clone(&self.db),
      cache: Arc::clone(&self.cache),
      stop: Arc::clone(&self.stop),
    });

    let workers = self.options.workers.max(1);
    info!(workers, nodes = total, "starting build scheduling");
    let mut pool = JoinSet::new();
    for id in 0..workers {
      pool.spawn(worker(id, Arc::clone(&queue_rx), done_tx.clone(), Arc::clone(&ctx)));
    }
    drop(done_tx);

    let base_reason = if self.options.force {
      BuildReason::FORCED
    } else {
      BuildReason::NONE
    };

    #[derive(Default)]
    struct ChildState {
      rebuilt: bool,
      failed: Option<(String, Guid)>,
      cancelled: bool,
    }

    let mut child_state: HashMap<NodeIndex, ChildState> = HashMap::new();
    let mut results: HashMap<NodeIndex, (NodeOutcome, BuildReason, Option<String>)> = HashMap::new();
    let mut inflight = 0usize;

    // Seed nodes with no build-required children.
    for &idx in &build_nodes {
      if pending[&idx] == 0 && queue_tx.send(WorkItem { idx, reason: base_reason }).await.is_ok() {
        inflight += 1;
      }
    }

    while results.len() < total && inflight > 0 {
      let Some((idx, reason, outcome)) = done_rx.recv().await else {
        break;
      };
      inflight -= 1;

      let mut completions = VecDeque::new();
      completions.push_back(match outcome {
        WorkOutcome::UpToDate => (idx, NodeOutcome::UpToDate, reason, None),
        WorkOutcome::Built => (idx, NodeOutcome::Built, reason, None),
        WorkOutcome::Cancelled => (idx, NodeOutcome::Cancelled, reason, None),
        WorkOutcome::Failed(err) => (idx, NodeOutcome::Failed, reason, Some(err.to_string())),
      });

      // Propagate each completion to its parents; dependency failures and
      // cancellations complete parents in turn without running them.
      while let Some((idx, outcome, reason, error)) = completions.pop_front() {
        results.insert(idx, (outcome, reason, error));
        let node = self.graph.node(idx);

        for &parent in parents.get(&idx).map(Vec::as_slice).unwrap_or(&[]) {
          {
            let state = child_state.entry(parent).or_default();
            match outcome {
              NodeOutcome::Built => state.rebuilt = true,
              NodeOutcome::Failed => {
                state.failed.get_or_insert_with(|| (node.name.clone(), node.output_guid));
              }
              NodeOutcome::Cancelled => state.cancelled = true,
              NodeOutcome::UpToDate => {}
            }
          }

          let remaining = pending.get_mut(&parent).expect("parent is a build node");
          *remaining -= 1;
          if *remaining > 0 {
            continue;
          }

          let state = child_state.remove(&parent).unwrap_or_default();
          let parent_node = self.graph.node(parent);
          if let Some((failed_name, failed_guid)) = state.failed {
            let cause = BuildError::DependencyFailed {
              name: failed_name,
              guid: failed_guid,
            };
            warn!(node = %parent_node.name, guid = %parent_node.output_guid, %cause, "marking failed");
            completions.push_back((
              parent,
              NodeOutcome::Failed,
              BuildReason::DEPENDENCY,
              Some(cause.to_string()),
            ));
          } else if state.cancelled || self.stop.load(Ordering::SeqCst) {
            completions.push_back((parent, NodeOutcome::Cancelled, BuildReason::NONE, None));
          } else {
            let mut reason = base_reason;
            if state.rebuilt {
              reason.insert(BuildReason::DEPENDENCY);
            }
            if queue_tx.send(WorkItem { idx: parent, reason }).await.is_ok() {
              inflight += 1;
            } else {
              completions.push_back((parent, NodeOutcome::Cancelled, reason, None));
            }
          }
        }
      }
    }

    // Whatever never got scheduled (stop requested, workers gone) is
    // reported cancelled rather than silently dropped.
    for &idx in &build_nodes {
      results
        .entry(idx)
        .or_insert((NodeOutcome::Cancelled, BuildReason::NONE, None));
    }

    drop(queue_tx);
    while pool.join_next().await.is_some() {}

    self.summarize(results)
  }

  fn summarize(&self, results: HashMap<NodeIndex, (NodeOutcome, BuildReason, Option<String>)>) -> BuildSummary {
    let mut summary = BuildSummary {
      reports: Vec::new(),
      built: 0,
      up_to_date: 0,
      failed: 0,
      cancelled: 0,
      cache: self.cache.stats(),
    };

    for (idx, (outcome, reason, error)) in results {
      let node = self.graph.node(idx);
      match outcome {
        NodeOutcome::Built => summary.built += 1,
        NodeOutcome::UpToDate => summary.up_to_date += 1,
        NodeOutcome::Failed => summary.failed += 1,
        NodeOutcome::Cancelled => summary.cancelled += 1,
      }
      summary.reports.push(NodeReport {
        name: node.name.clone(),
        guid: node.output_guid,
        outcome,
        reason,
        error,
      });
    }
    summary.reports.sort_by(|a, b| a.name.cmp(&b.name));

    info!(
      built = summary.built,
      up_to_date = summary.up_to_date,
      failed = summary.failed,
      cancelled = summary.cancelled,
      cache_hits = summary.cache.hits,
      cache_misses = summary.cache.misses,
      "build scheduling complete"
    );
    summary
  }
}

/// One worker of the fixed pool: block on the shared queue, process, report.
async fn worker(
  id: usize,
  queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
  done: mpsc::UnboundedSender<(NodeIndex, BuildReason, WorkOutcome)>,
  ctx: Arc<WorkerCtx>,
) {
  loop {
    let item = { queue.lock().await.recv().await };
    let Some(item) = item else {
      break;
    };

    // The stop flag is checked between nodes; in-flight work runs to
    // completion, nothing further is dequeued as building.
    if ctx.stop.load(Ordering::SeqCst) {
      if done.send((item.idx, item.reason, WorkOutcome::Cancelled)).is_err() {
        break;
      }
      continue;
    }

    let (reason, outcome) = process_node(&ctx, &item).await;
    if done.send((item.idx, reason, outcome)).is_err() {
      break;
    }
  }
  debug!(worker = id, "worker exited");
}

/// needBuild evaluation and the build itself for one node.
async fn process_node(ctx: &WorkerCtx, item: &WorkItem) -> (BuildReason, WorkOutcome) {
  let node = ctx.graph.node(item.idx);
  let key = CacheKey::new(node.output_guid, node.fingerprint.clone());
  let mut reason = item.reason;

  // needBuild: a forced session or a rebuilt child bypasses the cache;
  // otherwise only a committed entry for the exact key skips the build.
  if reason.is_empty() {
    match ctx.cache.get(&key).await {
      Ok(Some(mut reader)) => match persist_output(ctx, node, &mut reader) {
        Ok(()) => {
          debug!(node = %node.name, guid = %node.output_guid, "cache hit");
          return (reason, WorkOutcome::UpToDate);
        }
        Err(error) => {
          warn!(node = %node.name, %error, "failed to persist cached entry, rebuilding");
        }
      },
      Ok(None) => {
        debug!(node = %node.name, fingerprint = %node.fingerprint.short(), "cache miss");
      }
      Err(error) => {
        warn!(node = %node.name, %error, "cache read failed, treating as miss");
      }
    }
    reason.insert(BuildReason::CACHE_MISS);
  }

  let asset = match ctx.db.get_instance(node.source_guid) {
    Ok(asset) => asset,
    Err(error) => {
      error!(node = %node.name, guid = %node.output_guid, %error, "source asset unavailable");
      return (reason, WorkOutcome::Failed(error.into()));
    }
  };

  let build_ctx = BuildContext {
    db: &*ctx.db,
    graph: &*ctx.graph,
  };
  let request = BuildRequest {
    node,
    asset: &asset,
    reason,
  };

  info!(node = %node.name, guid = %node.output_guid, %reason, "building output");
  let product = match node.pipeline.build_output(&build_ctx, &request).await {
    Ok(product) => product,
    Err(error) => {
      error!(node = %node.name, guid = %node.output_guid, %error, "build failed");
      return (reason, WorkOutcome::Failed(error));
    }
  };

  store_in_cache(ctx, node, &key, &product).await;

  match persist_output(ctx, node, &mut product.as_slice()) {
    Ok(()) => (reason, WorkOutcome::Built),
    Err(error) => {
      error!(node = %node.name, guid = %node.output_guid, %error, "failed to persist output");
      (reason, WorkOutcome::Failed(error))
    }
  }
}

/// Best-effort cache population: put, stream, commit. Every failure here
/// degrades to an uncached build.
async fn store_in_cache(ctx: &WorkerCtx, node: &DependencyNode, key: &CacheKey, product: &[u8]) {
  match ctx.cache.put(key).await {
    Ok(Some(mut writer)) => {
      let written = writer.write_all(product).and_then(|()| writer.flush());
      drop(writer);
      match written {
        Ok(()) => match ctx.cache.commit(key).await {
          Ok(true) => debug!(node = %node.name, "cache entry committed"),
          Ok(false) => debug!(node = %node.name, "cache commit lost to another producer"),
          Err(error) => warn!(node = %node.name, %error, "cache commit failed"),
        },
        Err(error) => warn!(node = %node.name, %error, "cache write failed, entry not committed"),
      }
    }
    Ok(None) => debug!(node = %node.name, "cache put already pending elsewhere"),
    Err(error) => warn!(node = %node.name, %error, "cache write unavailable"),
  }
}

fn persist_output(ctx: &WorkerCtx, node: &DependencyNode, reader: &mut dyn std::io::Read) -> Result<(), BuildError> {
  let mut writer = ctx.db.create_output_instance(&node.output_path, node.output_guid)?;
  std::io::copy(reader, &mut writer)?;
  writer.flush()?;
  Ok(())
}
