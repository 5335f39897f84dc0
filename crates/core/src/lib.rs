//! kiln-core: identity, hashing, and source-asset primitives for kiln.
//!
//! This crate provides the types shared by every layer of the content
//! pipeline:
//! - `Guid`: stable identity of source assets and built outputs
//! - `Fingerprint`: content digest that keys the build cache
//! - `SourceAsset`: an immutable, versioned serialized object
//! - `ObjectDatabase`: the contract for reading sources and persisting
//!   built products

pub mod asset;
pub mod guid;
pub mod hash;

pub use asset::{AssetTypeId, DbError, MemoryObjectDatabase, ObjectDatabase, OutputInstance, SourceAsset};
pub use guid::Guid;
pub use hash::{Fingerprint, FingerprintBuilder, hash_bytes, hash_file};
