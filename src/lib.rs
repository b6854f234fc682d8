//! Strata: an append-only, versioned graph store.
//!
//! Entities, attribute entities, relations and their history are records in a
//! single growing arena. Nothing is overwritten except a few in-place fields that
//! replay can recompute, so any prefix of the arena is a consistent graph and a
//! suffix can be shipped to another replica as an [`sync::UpdatePayload`].
//!
//! ```no_run
//! use strata::storage::{Graph, GraphOptions};
//! use strata::types::EntityType;
//!
//! # fn main() -> strata::types::Result<()> {
//! let graph = Graph::create(GraphOptions::default())?;
//! {
//!     let _tx = graph.begin_tx();
//!     graph.instantiate_entity(EntityType(7), None)?;
//! }
//! strata::admin::ensure_valid(&graph)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod sync;
pub mod types;

pub use storage::{Graph, GraphOptions, TxGuard};
pub use types::{BlobIndex, Result, StrataError};
