#![forbid(unsafe_code)]

//! Replication between graph replicas.
//!
//! A sender computes [`UpdateHeads`], serializes the ranges they describe into
//! an [`UpdatePayload`] and marks them synced. A receiver appends the payload's
//! blobs and cache diffs and checks the result against the sender's graph hash.

mod exchange;
mod heads;
mod layout;
mod payload;
mod snapshot;

/// Building and applying update payloads.
///
/// Both calls take the write role for their duration.
pub use exchange::{apply_payload, serialize};

/// Sync heads: the blob and cache ranges not yet externalized.
pub use heads::{create_heads, full_graph_heads, is_up_to_date, mark_synced, BlobRange, CacheHead, UpdateHeads};

/// Data layout versions and conversion of payloads between them.
pub use layout::{convert_payload, LayoutVersion};

/// The payload model and its wire form.
pub use payload::{CacheRange, PayloadMeta, UpdatePayload};

/// Whole-graph snapshot files.
pub use snapshot::{load_snapshot, save_snapshot};

