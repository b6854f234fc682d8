use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::caches::CacheName;
use crate::storage::Graph;
use crate::types::{BlobIndex, Result};

/// Range of blob indices, `[from, to)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRange {
    /// First index, inclusive.
    pub from: i32,
    /// Last index, exclusive.
    pub to: i32,
}

/// Range of entries of one cache, tagged with the cache revision it was taken at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHead {
    /// Cache the range belongs to.
    pub name: CacheName,
    /// First entry not yet externalized.
    pub from: u64,
    /// Entry count at the time the heads were taken.
    pub to: u64,
    /// Cache revision at the time the heads were taken.
    pub revision: u64,
}

/// What a sender has not yet externalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHeads {
    /// Blob indices to send.
    pub blobs: BlobRange,
    /// One head per cache with entries to send.
    pub caches: Vec<CacheHead>,
}

impl UpdateHeads {
    /// First blob index to send.
    pub fn blob_from(&self) -> BlobIndex {
        BlobIndex(self.blobs.from)
    }

    /// Blob index just past the last one to send.
    pub fn blob_to(&self) -> BlobIndex {
        BlobIndex(self.blobs.to)
    }

    /// Head of the cache `name`, if it has one.
    pub fn cache(&self, name: CacheName) -> Option<&CacheHead> {
        self.caches.iter().find(|c| c.name == name)
    }
}

/// No stream has anything left to send.
pub fn is_up_to_date(heads: &UpdateHeads) -> bool {
    heads.blobs.from >= heads.blobs.to && heads.caches.iter().all(|c| c.from >= c.to)
}

fn heads_from(graph: &Graph, full: bool) -> Result<UpdateHeads> {
    let _tx = graph.begin_tx();
    let state = graph.write()?;
    let store = state.store();
    let from = if full { BlobIndex::ROOT } else { store.sync_head().max(BlobIndex::ROOT) };
    let caches = state
        .caches()
        .iter()
        .map(|cache| CacheHead {
            name: cache.name(),
            from: if full { 0 } else { cache.upstream_size() as u64 },
            to: cache.len() as u64,
            revision: cache.revision(),
        })
        .collect();
    let heads = UpdateHeads {
        blobs: BlobRange {
            from: from.0,
            to: store.read_head().0,
        },
        caches,
    };
    debug!(from = heads.blobs.from, to = heads.blobs.to, full, "sync.heads");
    Ok(heads)
}

/// Heads covering everything written since the last [`mark_synced`].
///
/// Takes the write role for the duration of the call.
pub fn create_heads(graph: &Graph) -> Result<UpdateHeads> {
    heads_from(graph, false)
}

/// Heads covering the whole graph, for snapshots and fresh replicas.
pub fn full_graph_heads(graph: &Graph) -> Result<UpdateHeads> {
    heads_from(graph, true)
}

/// Records the ranges in `heads` as externalized.
pub fn mark_synced(graph: &Graph, heads: &UpdateHeads) -> Result<()> {
    let _tx = graph.begin_tx();
    let mut state = graph.write()?;
    state.store.set_sync_head(heads.blob_to());
    for head in &heads.caches {
        let cache = state.caches.get_mut(head.name);
        if cache.revision() == head.revision {
            cache.mark_synced(head.to as usize);
        }
    }
    debug!(sync_head = heads.blobs.to, "sync.marked");
    Ok(())
}
