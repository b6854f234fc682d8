//! Graph storage engine and core data structures.
//!
//! Records live back to back in an arena, addressed by 16-byte blob indices.
//! Edges are records too; both ends of every edge keep a signed reference to it
//! in their edge lists, which spill into deferred list records when full.

/// Record model: the closed set of blob types and their encoding.
pub mod blob;

/// Derived lookup caches rebuilt by replay and shipped as diffs.
pub mod caches;

/// Edge-list segments and their overflow chains.
pub mod edges;

/// Byte layout constants and per-type record sizes.
pub mod layout;

/// Name to token mapping for entity, relation and enum types.
pub mod registry;

/// Heads and raw record access over an arena.
pub mod store;

mod graph;
mod options;
mod replay;

/// The graph handle, its guarded state and the delegate model.
pub use graph::{Delegate, DelegateKind, FrameRef, Graph, GraphState, TxGuard};

/// Graph configuration options.
pub use options::GraphOptions;

pub use blob::Blob;
pub use caches::{CacheName, CacheSet};
pub use registry::{PendingToken, PendingTokens, TokenRegistry};
pub use store::BlobStore;
