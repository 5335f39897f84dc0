//! The pipeline plugin contract and the type→pipeline registry.
//!
//! Per-asset-type transformation logic lives outside this crate: a
//! `Pipeline` is an opaque, potentially slow, side-effecting black box that
//! knows how to discover an asset's dependencies and produce its built
//! output. The registry is an explicit immutable map from a runtime type
//! tag to a pipeline instance, built once at startup before any graph walk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use kiln_core::{AssetTypeId, DbError, Guid, ObjectDatabase, SourceAsset};

use crate::graph::{DependencyGraph, DependencyNode, GraphBuilder, GraphError};
use crate::schedule::BuildReason;

/// A pipeline's `build_output` failure, or the infrastructure failures that
/// surface through the same path. Node-local: it fails the node and its
/// transitive dependents, never unrelated subtrees.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("pipeline {pipeline} failed on {name}: {message}")]
  Pipeline {
    pipeline: String,
    name: String,
    message: String,
  },

  #[error("dependency {name} ({guid}) failed")]
  DependencyFailed { name: String, guid: Guid },

  #[error("database error: {0}")]
  Database(#[from] DbError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Shared collaborators handed to `build_output`.
pub struct BuildContext<'a> {
  pub db: &'a dyn ObjectDatabase,
  pub graph: &'a DependencyGraph,
}

/// Everything describing the one node being built.
pub struct BuildRequest<'a> {
  pub node: &'a DependencyNode,
  pub asset: &'a SourceAsset,
  pub reason: BuildReason,
}

/// Per-asset-type build plugin.
#[async_trait]
pub trait Pipeline: Send + Sync {
  /// Name used in logs and error messages.
  fn name(&self) -> &str;

  /// The runtime types this pipeline claims. Each type must be claimed by
  /// exactly one registered pipeline.
  fn asset_types(&self) -> Vec<AssetTypeId>;

  /// Settings that influence produced outputs; folded into every
  /// fingerprint so a settings change invalidates cached entries.
  fn settings(&self) -> Vec<u8> {
    Vec::new()
  }

  /// Discover the asset's references, calling back into
  /// [`GraphBuilder::add_dependency`] for each one.
  fn build_dependencies(
    &self,
    graph: &mut GraphBuilder<'_>,
    asset: &SourceAsset,
    output_path: &str,
    output_guid: Guid,
  ) -> Result<(), GraphError>;

  /// Produce the built output for one dependency node.
  async fn build_output(&self, ctx: &BuildContext<'_>, request: &BuildRequest<'_>) -> Result<Vec<u8>, BuildError>;
}

/// Immutable map from asset type to pipeline, built once at startup.
pub struct PipelineSet {
  by_type: HashMap<AssetTypeId, Arc<dyn Pipeline>>,
}

impl PipelineSet {
  pub fn builder() -> PipelineSetBuilder {
    PipelineSetBuilder {
      by_type: HashMap::new(),
    }
  }

  /// The pipeline claiming `type_id`, if any. Zero claims is a
  /// `GraphError` raised by the graph builder at resolution time.
  pub fn get(&self, type_id: &AssetTypeId) -> Option<&Arc<dyn Pipeline>> {
    self.by_type.get(type_id)
  }

  pub fn len(&self) -> usize {
    self.by_type.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_type.is_empty()
  }
}

pub struct PipelineSetBuilder {
  by_type: HashMap<AssetTypeId, Arc<dyn Pipeline>>,
}

impl PipelineSetBuilder {
  /// Register a pipeline for every type it claims. A type claimed twice is
  /// a [`GraphError::DuplicatePipeline`].
  pub fn register(mut self, pipeline: Arc<dyn Pipeline>) -> Result<Self, GraphError> {
    for type_id in pipeline.asset_types() {
      if let Some(existing) = self.by_type.insert(type_id.clone(), Arc::clone(&pipeline)) {
        return Err(GraphError::DuplicatePipeline {
          type_id,
          first: existing.name().to_string(),
          second: pipeline.name().to_string(),
        });
      }
    }
    Ok(self)
  }

  pub fn build(self) -> PipelineSet {
    PipelineSet {
      by_type: self.by_type,
    }
  }
}
