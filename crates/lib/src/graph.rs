//! Dependency-graph construction.
//!
//! A build session expands its root assets into a deduplicated graph of
//! dependency nodes. Expansion is single-threaded and recursive: resolving
//! a node asks its pipeline to enumerate references, which calls back into
//! [`GraphBuilder::add_dependency`] for each one. Once scheduling starts the
//! graph is read-only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::{debug, warn};

use kiln_core::{AssetTypeId, DbError, Fingerprint, FingerprintBuilder, Guid, ObjectDatabase, SourceAsset, hash_file};

use crate::pipeline::{Pipeline, PipelineSet};

/// How a parent references a child: as an input that must be built, as a
/// resource walked only for fingerprinting, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyFlags(u8);

impl DependencyFlags {
  pub const BUILD: Self = Self(1);
  pub const RESOURCE: Self = Self(2);

  pub fn empty() -> Self {
    Self(0)
  }

  pub fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }

  pub fn insert(&mut self, other: Self) {
    self.0 |= other.0;
  }

  /// Whether this node must be scheduled for `build_output`.
  pub fn is_build(self) -> bool {
    self.contains(Self::BUILD)
  }
}

impl BitOr for DependencyFlags {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

impl std::fmt::Display for DependencyFlags {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut parts = Vec::new();
    if self.contains(Self::BUILD) {
      parts.push("build");
    }
    if self.contains(Self::RESOURCE) {
      parts.push("resource");
    }
    if parts.is_empty() {
      parts.push("none");
    }
    write!(f, "{}", parts.join("|"))
  }
}

/// Fatal graph-construction errors. These abort before scheduling starts.
#[derive(Debug, Error)]
pub enum GraphError {
  #[error("no pipeline claims asset type {type_id} (asset {guid})")]
  NoPipeline { type_id: AssetTypeId, guid: Guid },

  #[error("asset type {type_id} claimed by both {first} and {second}")]
  DuplicatePipeline {
    type_id: AssetTypeId,
    first: String,
    second: String,
  },

  #[error("dependency cycle through {name} ({guid})")]
  Cycle { name: String, guid: Guid },

  #[error("database error: {0}")]
  Database(#[from] DbError),
}

/// One vertex of the build graph, corresponding to exactly one output guid.
pub struct DependencyNode {
  pub name: String,
  pub pipeline: Arc<dyn Pipeline>,
  pub source_guid: Guid,
  pub source_version: u32,
  pub output_path: String,
  pub output_guid: Guid,
  pub touched_files: Vec<PathBuf>,
  pub fingerprint: Fingerprint,
  pub flags: DependencyFlags,
}

impl std::fmt::Debug for DependencyNode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DependencyNode")
      .field("name", &self.name)
      .field("output_guid", &self.output_guid)
      .field("fingerprint", &self.fingerprint.short())
      .field("flags", &self.flags)
      .finish()
  }
}

/// The finished, read-only dependency graph of one build session.
pub struct DependencyGraph {
  graph: DiGraph<DependencyNode, DependencyFlags>,
  by_guid: HashMap<Guid, NodeIndex>,
  roots: Vec<NodeIndex>,
}

impl DependencyGraph {
  pub fn node(&self, idx: NodeIndex) -> &DependencyNode {
    &self.graph[idx]
  }

  pub fn node_by_guid(&self, guid: Guid) -> Option<&DependencyNode> {
    self.by_guid.get(&guid).map(|&idx| &self.graph[idx])
  }

  pub fn index_of(&self, guid: Guid) -> Option<NodeIndex> {
    self.by_guid.get(&guid).copied()
  }

  /// Direct children of a node. May repeat an index when a pipeline added
  /// the same reference more than once.
  pub fn children(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.neighbors_directed(idx, Direction::Outgoing)
  }

  pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.node_indices()
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn roots(&self) -> &[NodeIndex] {
    &self.roots
  }

  /// Nodes that must be scheduled for `build_output`; resource-only nodes
  /// are walked for completeness but never built independently.
  pub fn build_nodes(&self) -> Vec<NodeIndex> {
    self
      .graph
      .node_indices()
      .filter(|&idx| self.graph[idx].flags.is_build())
      .collect()
  }
}

/// Recursive graph construction over an object database and a pipeline set.
pub struct GraphBuilder<'a> {
  db: &'a dyn ObjectDatabase,
  pipelines: &'a PipelineSet,
  graph: DiGraph<DependencyNode, DependencyFlags>,
  by_guid: HashMap<Guid, NodeIndex>,
  in_progress: HashSet<Guid>,
  stack: Vec<NodeIndex>,
  roots: Vec<NodeIndex>,
  read_cache: HashMap<Guid, Arc<SourceAsset>>,
}

impl<'a> GraphBuilder<'a> {
  pub fn new(db: &'a dyn ObjectDatabase, pipelines: &'a PipelineSet) -> Self {
    Self {
      db,
      pipelines,
      graph: DiGraph::new(),
      by_guid: HashMap::new(),
      in_progress: HashSet::new(),
      stack: Vec::new(),
      roots: Vec::new(),
      read_cache: HashMap::new(),
    }
  }

  /// Expand a root asset. Roots are always build-required.
  pub fn add_root(
    &mut self,
    source: Guid,
    name: &str,
    output_path: &str,
    output_guid: Guid,
  ) -> Result<NodeIndex, GraphError> {
    let idx = self.add_dependency(source, name, output_path, output_guid, DependencyFlags::BUILD)?;
    if !self.roots.contains(&idx) {
      self.roots.push(idx);
    }
    Ok(idx)
  }

  /// Resolve one referenced asset into a dependency node.
  ///
  /// Idempotent per output guid: a guid seen before returns the existing
  /// node so diamond-shaped references collapse rather than duplicate. A
  /// guid still being expanded on the current traversal stack is a cycle.
  pub fn add_dependency(
    &mut self,
    source: Guid,
    name: &str,
    output_path: &str,
    output_guid: Guid,
    flags: DependencyFlags,
  ) -> Result<NodeIndex, GraphError> {
    if self.in_progress.contains(&output_guid) {
      return Err(GraphError::Cycle {
        name: name.to_string(),
        guid: output_guid,
      });
    }

    if let Some(&idx) = self.by_guid.get(&output_guid) {
      self.graph[idx].flags.insert(flags);
      if let Some(&parent) = self.stack.last() {
        self.graph.add_edge(parent, idx, flags);
      }
      return Ok(idx);
    }

    let asset = self.load(source)?;
    let pipeline = Arc::clone(self.pipelines.get(&asset.type_id).ok_or_else(|| GraphError::NoPipeline {
      type_id: asset.type_id.clone(),
      guid: source,
    })?);

    let idx = self.graph.add_node(DependencyNode {
      name: name.to_string(),
      pipeline: Arc::clone(&pipeline),
      source_guid: source,
      source_version: asset.version,
      output_path: output_path.to_string(),
      output_guid,
      touched_files: Vec::new(),
      fingerprint: Fingerprint::default(),
      flags,
    });
    if let Some(&parent) = self.stack.last() {
      self.graph.add_edge(parent, idx, flags);
    }
    self.by_guid.insert(output_guid, idx);
    self.in_progress.insert(output_guid);
    self.stack.push(idx);

    debug!(node = %name, guid = %output_guid, pipeline = %pipeline.name(), "expanding dependencies");
    let expanded = pipeline.build_dependencies(self, &asset, output_path, output_guid);

    self.stack.pop();
    self.in_progress.remove(&output_guid);
    expanded?;

    // All children resolved: fingerprint post-order.
    let fingerprint = self.compute_fingerprint(idx, &asset, &pipeline);
    self.graph[idx].fingerprint = fingerprint;
    Ok(idx)
  }

  /// Record a loose file read while expanding the current node. Its content
  /// hash becomes part of the node's fingerprint.
  pub fn touch_file(&mut self, path: impl Into<PathBuf>) {
    if let Some(&idx) = self.stack.last() {
      self.graph[idx].touched_files.push(path.into());
    }
  }

  pub fn finish(self) -> DependencyGraph {
    DependencyGraph {
      graph: self.graph,
      by_guid: self.by_guid,
      roots: self.roots,
    }
  }

  fn load(&mut self, guid: Guid) -> Result<Arc<SourceAsset>, GraphError> {
    if let Some(asset) = self.read_cache.get(&guid) {
      return Ok(Arc::clone(asset));
    }
    let asset = self.db.get_instance(guid)?;
    self.read_cache.insert(guid, Arc::clone(&asset));
    Ok(asset)
  }

  fn compute_fingerprint(&self, idx: NodeIndex, asset: &SourceAsset, pipeline: &Arc<dyn Pipeline>) -> Fingerprint {
    let node = &self.graph[idx];
    let mut builder = FingerprintBuilder::new()
      .fingerprint(&asset.content_fingerprint())
      .bytes(&pipeline.settings());

    let mut touched = node.touched_files.clone();
    touched.sort();
    for path in &touched {
      builder = builder.text(&path.to_string_lossy());
      match hash_file(path) {
        Ok(digest) => builder = builder.fingerprint(&digest),
        Err(error) => {
          warn!(path = %path.display(), %error, "touched file unreadable, hashed as empty");
          builder = builder.fingerprint(&Fingerprint::default());
        }
      }
    }

    // Children in canonical guid order, deduplicated, so the digest does
    // not depend on reference order or repeats.
    let mut children: BTreeMap<Guid, Fingerprint> = BTreeMap::new();
    for child in self.graph.neighbors_directed(idx, Direction::Outgoing) {
      let child_node = &self.graph[child];
      children.insert(child_node.output_guid, child_node.fingerprint.clone());
    }
    for (guid, fingerprint) in &children {
      builder = builder.text(&guid.simple()).fingerprint(fingerprint);
    }

    builder.finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;

  use kiln_core::MemoryObjectDatabase;

  use crate::pipeline::{BuildContext, BuildError, BuildRequest};

  /// Pipeline whose dependency edges come from a static table keyed by
  /// source guid. Output guids equal source guids.
  struct StubPipeline {
    types: Vec<AssetTypeId>,
    deps: HashMap<Guid, Vec<(Guid, &'static str, DependencyFlags)>>,
    touches: HashMap<Guid, PathBuf>,
    settings: Vec<u8>,
  }

  impl StubPipeline {
    fn new() -> Self {
      Self {
        types: vec![AssetTypeId::new("stub")],
        deps: HashMap::new(),
        touches: HashMap::new(),
        settings: Vec::new(),
      }
    }
  }

  #[async_trait]
  impl Pipeline for StubPipeline {
    fn name(&self) -> &str {
      "stub"
    }

    fn asset_types(&self) -> Vec<AssetTypeId> {
      self.types.clone()
    }

    fn settings(&self) -> Vec<u8> {
      self.settings.clone()
    }

    fn build_dependencies(
      &self,
      graph: &mut GraphBuilder<'_>,
      asset: &SourceAsset,
      _output_path: &str,
      _output_guid: Guid,
    ) -> Result<(), GraphError> {
      if let Some(path) = self.touches.get(&asset.guid) {
        graph.touch_file(path.clone());
      }
      for (child, name, flags) in self.deps.get(&asset.guid).cloned().unwrap_or_default() {
        graph.add_dependency(child, name, &format!("/built/{name}"), child, flags)?;
      }
      Ok(())
    }

    async fn build_output(
      &self,
      _ctx: &BuildContext<'_>,
      request: &BuildRequest<'_>,
    ) -> Result<Vec<u8>, BuildError> {
      Ok(format!("built:{}", request.asset.name).into_bytes())
    }
  }

  fn asset(guid: Guid, name: &str, data: &[u8]) -> SourceAsset {
    SourceAsset {
      guid,
      version: 1,
      type_id: AssetTypeId::new("stub"),
      name: name.to_string(),
      data: data.to_vec(),
    }
  }

  fn registry(pipeline: StubPipeline) -> PipelineSet {
    PipelineSet::builder().register(Arc::new(pipeline)).unwrap().build()
  }

  fn build_graph(db: &MemoryObjectDatabase, pipelines: &PipelineSet, root: Guid) -> DependencyGraph {
    let mut builder = GraphBuilder::new(db, pipelines);
    builder.add_root(root, "root", "/built/root", root).unwrap();
    builder.finish()
  }

  #[test]
  fn diamond_references_collapse_to_one_node() {
    //     a
    //    / \
    //   b   c
    //    \ /
    //     d
    let [a, b, c, d] = std::array::from_fn(|_| Guid::generate());

    let db = MemoryObjectDatabase::new();
    for (guid, name) in [(a, "a"), (b, "b"), (c, "c"), (d, "d")] {
      db.insert_source(asset(guid, name, name.as_bytes()));
    }

    let mut pipeline = StubPipeline::new();
    pipeline.deps.insert(
      a,
      vec![(b, "b", DependencyFlags::BUILD), (c, "c", DependencyFlags::BUILD)],
    );
    pipeline.deps.insert(b, vec![(d, "d", DependencyFlags::BUILD)]);
    pipeline.deps.insert(c, vec![(d, "d", DependencyFlags::BUILD)]);

    let pipelines = registry(pipeline);
    let graph = build_graph(&db, &pipelines, a);

    assert_eq!(graph.node_count(), 4);
    assert_eq!(graph.build_nodes().len(), 4);
    assert!(graph.node_by_guid(d).is_some());
  }

  #[test]
  fn cycle_is_a_graph_error() {
    let a = Guid::generate();
    let b = Guid::generate();

    let db = MemoryObjectDatabase::new();
    db.insert_source(asset(a, "a", b"a"));
    db.insert_source(asset(b, "b", b"b"));

    let mut pipeline = StubPipeline::new();
    pipeline.deps.insert(a, vec![(b, "b", DependencyFlags::BUILD)]);
    pipeline.deps.insert(b, vec![(a, "a", DependencyFlags::BUILD)]);

    let pipelines = registry(pipeline);
    let mut builder = GraphBuilder::new(&db, &pipelines);
    let result = builder.add_root(a, "a", "/built/a", a);

    assert!(matches!(result, Err(GraphError::Cycle { guid, .. }) if guid == a));
  }

  #[test]
  fn unclaimed_asset_type_is_a_graph_error() {
    let orphan = Guid::generate();
    let db = MemoryObjectDatabase::new();
    db.insert_source(SourceAsset {
      guid: orphan,
      version: 1,
      type_id: AssetTypeId::new("unknown"),
      name: "orphan".to_string(),
      data: Vec::new(),
    });

    let pipelines = registry(StubPipeline::new());
    let mut builder = GraphBuilder::new(&db, &pipelines);
    let result = builder.add_root(orphan, "orphan", "/built/orphan", orphan);

    assert!(matches!(
      result,
      Err(GraphError::NoPipeline { type_id, guid }) if type_id == AssetTypeId::new("unknown") && guid == orphan
    ));
  }

  #[test]
  fn leaf_change_propagates_to_every_ancestor() {
    // root -> mid -> leaf, plus an unrelated sibling root.
    let [root, mid, leaf, sibling] = std::array::from_fn(|_| Guid::generate());

    let db = MemoryObjectDatabase::new();
    for (guid, name) in [(root, "root"), (mid, "mid"), (leaf, "leaf"), (sibling, "sibling")] {
      db.insert_source(asset(guid, name, name.as_bytes()));
    }

    let mut pipeline = StubPipeline::new();
    pipeline.deps.insert(root, vec![(mid, "mid", DependencyFlags::BUILD)]);
    pipeline.deps.insert(mid, vec![(leaf, "leaf", DependencyFlags::BUILD)]);
    let pipelines = registry(pipeline);

    let fingerprints = |db: &MemoryObjectDatabase| {
      let mut builder = GraphBuilder::new(db, &pipelines);
      builder.add_root(root, "root", "/built/root", root).unwrap();
      builder.add_root(sibling, "sibling", "/built/sibling", sibling).unwrap();
      let graph = builder.finish();
      [root, mid, leaf, sibling].map(|g| graph.node_by_guid(g).unwrap().fingerprint.clone())
    };

    let before = fingerprints(&db);
    db.update_source(leaf, b"edited".to_vec());
    let after = fingerprints(&db);

    assert_ne!(before[0], after[0], "root must change");
    assert_ne!(before[1], after[1], "mid must change");
    assert_ne!(before[2], after[2], "leaf must change");
    assert_eq!(before[3], after[3], "unrelated sibling must not change");
  }

  #[test]
  fn resource_only_children_are_walked_but_not_scheduled() {
    let root = Guid::generate();
    let lookup = Guid::generate();

    let db = MemoryObjectDatabase::new();
    db.insert_source(asset(root, "root", b"root"));
    db.insert_source(asset(lookup, "lookup", b"table"));

    let mut pipeline = StubPipeline::new();
    pipeline.deps.insert(root, vec![(lookup, "lookup", DependencyFlags::RESOURCE)]);
    let pipelines = registry(pipeline);

    let graph = build_graph(&db, &pipelines, root);
    assert_eq!(graph.node_count(), 2);
    let build_nodes = graph.build_nodes();
    assert_eq!(build_nodes.len(), 1);
    assert_eq!(graph.node(build_nodes[0]).output_guid, root);

    // The resource child still shapes the parent fingerprint.
    db.update_source(lookup, b"edited table".to_vec());
    let rebuilt = build_graph(&db, &pipelines, root);
    assert_ne!(
      graph.node_by_guid(root).unwrap().fingerprint,
      rebuilt.node_by_guid(root).unwrap().fingerprint
    );
  }

  #[test]
  fn build_flag_wins_when_references_disagree() {
    // One parent references the child as a resource, another as a build
    // input; the collapsed node must be scheduled.
    let [a, b, shared] = std::array::from_fn(|_| Guid::generate());

    let db = MemoryObjectDatabase::new();
    for (guid, name) in [(a, "a"), (b, "b"), (shared, "shared")] {
      db.insert_source(asset(guid, name, name.as_bytes()));
    }

    let mut pipeline = StubPipeline::new();
    pipeline.deps.insert(
      a,
      vec![
        (shared, "shared", DependencyFlags::RESOURCE),
        (b, "b", DependencyFlags::BUILD),
      ],
    );
    pipeline.deps.insert(b, vec![(shared, "shared", DependencyFlags::BUILD)]);
    let pipelines = registry(pipeline);

    let graph = build_graph(&db, &pipelines, a);
    let shared_node = graph.node_by_guid(shared).unwrap();
    assert!(shared_node.flags.is_build());
    assert!(shared_node.flags.contains(DependencyFlags::RESOURCE));
  }

  #[test]
  fn touched_file_content_shapes_the_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let table = dir.path().join("conversion-table.bin");
    std::fs::write(&table, b"v1").unwrap();

    let root = Guid::generate();
    let db = MemoryObjectDatabase::new();
    db.insert_source(asset(root, "root", b"root"));

    let mut pipeline = StubPipeline::new();
    pipeline.touches.insert(root, table.clone());
    let pipelines = registry(pipeline);

    let before = build_graph(&db, &pipelines, root).node_by_guid(root).unwrap().fingerprint.clone();
    std::fs::write(&table, b"v2").unwrap();
    let after = build_graph(&db, &pipelines, root).node_by_guid(root).unwrap().fingerprint.clone();

    assert_ne!(before, after);

    let graph = build_graph(&db, &pipelines, root);
    assert_eq!(graph.node_by_guid(root).unwrap().touched_files, vec![table]);
  }

  #[test]
  fn pipeline_settings_shape_the_fingerprint() {
    let root = Guid::generate();
    let db = MemoryObjectDatabase::new();
    db.insert_source(asset(root, "root", b"root"));

    let mut low = StubPipeline::new();
    low.settings = b"quality=low".to_vec();
    let mut high = StubPipeline::new();
    high.settings = b"quality=high".to_vec();

    let low_fp = build_graph(&db, &registry(low), root).node_by_guid(root).unwrap().fingerprint.clone();
    let high_fp = build_graph(&db, &registry(high), root)
      .node_by_guid(root)
      .unwrap()
      .fingerprint
      .clone();

    assert_ne!(low_fp, high_fp);
  }
}
