//! kiln-lib: incremental content-build pipeline.
//!
//! Turns versioned source assets from an object database into built runtime
//! resources, using a dependency graph, fingerprint-based change detection,
//! and a pluggable local/remote cache so unchanged content is never rebuilt,
//! even across machines:
//! - `blob`: append-only byte storage, memory- and file-backed
//! - `cache`: get/put/commit backends over that storage
//! - `graph`: recursive dependency-graph construction with diamond collapse
//!   and cycle detection
//! - `pipeline`: the per-asset-type plugin contract and registry
//! - `schedule`: the worker-pool scheduler
//! - `session`: one build invocation end to end
//! - `config`: backend selection and scheduling knobs

pub mod blob;
pub mod cache;
pub mod config;
pub mod graph;
pub mod pipeline;
pub mod schedule;
pub mod session;

pub use cache::{CacheBackend, CacheError, CacheKey, CacheStatsSnapshot, FileCache, MemoryCache, RemoteCache};
pub use config::{BuildConfig, CacheConfig, ConfigError};
pub use graph::{DependencyFlags, DependencyGraph, DependencyNode, GraphBuilder, GraphError};
pub use pipeline::{BuildContext, BuildError, BuildRequest, Pipeline, PipelineSet};
pub use schedule::{BuildOptions, BuildReason, BuildScheduler, BuildSummary, NodeOutcome, NodeReport};
pub use session::{BuildSession, RootSpec};
