//! Build-session orchestration: graph construction, scheduling, summary.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{error, info, warn};

use kiln_core::{Guid, ObjectDatabase};

use crate::cache::CacheBackend;
use crate::graph::{GraphBuilder, GraphError};
use crate::pipeline::PipelineSet;
use crate::schedule::{BuildOptions, BuildScheduler, BuildSummary, NodeOutcome};

/// One root asset to expand and build.
#[derive(Debug, Clone)]
pub struct RootSpec {
  pub source: Guid,
  pub name: String,
  pub output_path: String,
  pub output_guid: Guid,
}

/// A single build invocation: expand the roots into a dependency graph,
/// then schedule it against the cache.
///
/// Graph construction is single-threaded and any [`GraphError`] aborts
/// before scheduling starts. Nodes live only for the session; the cache
/// persists across sessions according to its backend.
pub struct BuildSession {
  db: Arc<dyn ObjectDatabase>,
  pipelines: Arc<PipelineSet>,
  cache: Arc<dyn CacheBackend>,
  options: BuildOptions,
  roots: Vec<RootSpec>,
  stop: Arc<AtomicBool>,
}

impl BuildSession {
  pub fn new(
    db: Arc<dyn ObjectDatabase>,
    pipelines: Arc<PipelineSet>,
    cache: Arc<dyn CacheBackend>,
    options: BuildOptions,
  ) -> Self {
    Self {
      db,
      pipelines,
      cache,
      options,
      roots: Vec::new(),
      stop: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn add_root(&mut self, source: Guid, name: &str, output_path: &str, output_guid: Guid) -> &mut Self {
    self.roots.push(RootSpec {
      source,
      name: name.to_string(),
      output_path: output_path.to_string(),
      output_guid,
    });
    self
  }

  /// Cancellation handle: set to stop dequeuing between nodes. In-flight
  /// pipeline invocations run to completion.
  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.stop)
  }

  pub async fn build(&self) -> Result<BuildSummary, GraphError> {
    info!(roots = self.roots.len(), "starting build session");

    let mut builder = GraphBuilder::new(&*self.db, &self.pipelines);
    for root in &self.roots {
      builder.add_root(root.source, &root.name, &root.output_path, root.output_guid)?;
    }
    let graph = builder.finish();

    info!(
      nodes = graph.node_count(),
      to_build = graph.build_nodes().len(),
      "dependency graph ready"
    );

    let scheduler = BuildScheduler::new(
      graph,
      Arc::clone(&self.db),
      Arc::clone(&self.cache),
      self.options.clone(),
    )
    .with_stop(Arc::clone(&self.stop));

    let summary = scheduler.run().await;

    if summary.success() {
      info!(
        built = summary.built,
        up_to_date = summary.up_to_date,
        cache_hits = summary.cache.hits,
        cache_misses = summary.cache.misses,
        "build session complete"
      );
    } else {
      warn!(
        failed = summary.failed,
        cancelled = summary.cancelled,
        built = summary.built,
        "build session finished with failures"
      );
      for report in &summary.reports {
        if report.outcome == NodeOutcome::Failed {
          error!(
            node = %report.name,
            guid = %report.guid,
            error = report.error.as_deref().unwrap_or("unknown"),
            "node failed"
          );
        }
      }
    }

    Ok(summary)
  }
}
