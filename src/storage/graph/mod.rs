//! The graph handle.
//!
//! A [`Graph`] is a cheap clone of an `Arc` around the arena, the heads, the derived
//! caches and the write role. Mutating operations are implemented on
//! [`GraphState`]; the `Graph` wrappers check that the calling thread holds the
//! write role (see [`Graph::begin_tx`]) before taking the state lock.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::primitives::arena::{Arena, MemArena};
use crate::primitives::concurrency::{RoleSnapshot, WriteRole};
use crate::storage::blob::{Blob, RootNode};
use crate::storage::caches::CacheSet;
use crate::storage::edges;
use crate::storage::options::GraphOptions;
use crate::storage::registry::TokenRegistry;
use crate::storage::store::BlobStore;
use crate::sync::LayoutVersion;
use crate::types::{BaseUid, BlobIndex, Result, StrataError};

mod delegate_ops;
mod record_ops;
mod tx_ops;

pub use delegate_ops::{Delegate, DelegateKind};
pub use tx_ops::{FrameRef, TxGuard};

/// Everything guarded by the graph lock.
pub struct GraphState {
    pub(crate) store: BlobStore,
    pub(crate) caches: CacheSet,
    pub(crate) delegates: LruCache<Delegate, BlobIndex>,
    pub(crate) registry: TokenRegistry,
    pub(crate) open_tx: Option<BlobIndex>,
    pub(crate) latest_complete_tx: BlobIndex,
    pub(crate) uid: BaseUid,
    rng: StdRng,
}

impl GraphState {
    fn new(arena: Box<dyn Arena>, options: &GraphOptions) -> Self {
        let memo = NonZeroUsize::new(options.delegate_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let rng = match options.uid_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store: BlobStore::new(arena),
            caches: CacheSet::default(),
            delegates: LruCache::new(memo),
            registry: TokenRegistry::new(),
            open_tx: None,
            latest_complete_tx: BlobIndex::ROOT,
            uid: BaseUid::ZERO,
            rng,
        }
    }

    /// Record store.
    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Derived lookup caches.
    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    pub(crate) fn fresh_uid(&mut self) -> BaseUid {
        BaseUid::random(&mut self.rng)
    }

    /// Appends an edge-like record and links it into the lists of both ends.
    ///
    /// A self loop may be written by passing `write_head` as both ends.
    pub(crate) fn write_edge(&mut self, blob: Blob) -> Result<BlobIndex> {
        let (source, target) = blob.source_target().ok_or_else(|| {
            StrataError::Invalid(format!("{} is not an edge record", blob.blob_type().name()))
        })?;
        let index = self.store.append_blob(&blob)?;
        edges::append(&mut self.store, source, index.0, true)?;
        edges::append(&mut self.store, target, -index.0, true)?;
        Ok(index)
    }

    /// Source and target of the edge-like record at `index`.
    pub(crate) fn ends_of(&self, index: BlobIndex) -> Result<(BlobIndex, BlobIndex)> {
        let blob = self.store.blob(index)?;
        blob.source_target()
            .ok_or_else(|| StrataError::type_mismatch(index, "edge record", blob.blob_type().name()))
    }

    /// Ends a batch: the open marker becomes the latest complete one and
    /// everything written becomes visible.
    pub(crate) fn close_tx(&mut self) {
        if let Some(tx) = self.open_tx.take() {
            self.latest_complete_tx = tx;
            debug!(tx = tx.0, write_head = self.store.write_head().0, "tx.closed");
        }
        self.store.publish();
        self.caches.settle(self.store.read_head());
    }
}

/// Shared handle to one graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

struct GraphInner {
    state: RwLock<GraphState>,
    role: WriteRole,
    options: GraphOptions,
}

impl Graph {
    /// Creates a graph holding nothing but its root record.
    pub fn create(options: GraphOptions) -> Result<Graph> {
        let graph = Self::empty(options)?;
        let uid = {
            let _tx = graph.begin_tx();
            let mut state = graph.write()?;
            let uid = state.fresh_uid();
            let root = Blob::Root(RootNode {
                uid,
                layout_version: LayoutVersion::CURRENT.as_str().to_owned(),
                revision: graph.inner.options.revision_info.clone(),
            });
            let index = state.store.append_blob(&root)?;
            if index != BlobIndex::ROOT {
                return Err(StrataError::Corruption(format!("root written at {index}")));
            }
            state.uid = uid;
            state.apply_range(BlobIndex::ROOT)?;
            uid
        };
        info!(uid = %uid, "graph.created");
        Ok(graph)
    }

    /// Creates a graph without a root, ready to receive a full payload.
    pub fn empty(options: GraphOptions) -> Result<Graph> {
        options.validate()?;
        let arena = MemArena::new(
            options.initial_capacity_bytes,
            options.growth_chunk_bytes,
            options.max_capacity_bytes,
        );
        Ok(Self::with_arena(Box::new(arena), options))
    }

    /// Adopts an arena that already holds records and rebuilds the caches.
    pub fn open_arena(arena: Box<dyn Arena>, options: GraphOptions) -> Result<Graph> {
        options.validate()?;
        let graph = Self::with_arena(arena, options);
        {
            let mut state = graph.inner.state.write();
            let head = state.store.discover_write_head()?;
            if head == BlobIndex::ROOT {
                return Err(StrataError::Corruption("arena holds no root record".into()));
            }
            let Blob::Root(root) = state.store.blob(BlobIndex::ROOT)? else {
                return Err(StrataError::Corruption("first record is not a root".into()));
            };
            LayoutVersion::parse(&root.layout_version)?;
            state.uid = root.uid;
            state.rebuild_caches()?;
            state.recompute_latest_complete_tx()?;
            info!(uid = %root.uid, write_head = head.0, "graph.opened");
        }
        Ok(graph)
    }

    fn with_arena(arena: Box<dyn Arena>, options: GraphOptions) -> Graph {
        let state = GraphState::new(arena, &options);
        Graph {
            inner: Arc::new(GraphInner {
                state: RwLock::new(state),
                role: WriteRole::new(),
                options,
            }),
        }
    }

    /// Options the graph was opened with.
    pub fn options(&self) -> &GraphOptions {
        &self.inner.options
    }

    pub(crate) fn role(&self) -> &WriteRole {
        &self.inner.role
    }

    /// Owner and depth of the write role, for diagnostics.
    pub fn role_snapshot(&self) -> RoleSnapshot {
        self.inner.role.snapshot()
    }

    /// Write access to the state; the calling thread must hold the write role.
    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, GraphState>> {
        if !self.inner.role.held_by_current_thread() {
            return Err(StrataError::ConcurrencyViolation);
        }
        Ok(self.inner.state.write())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.inner.state.read()
    }

    /// Memo updates only; never touches records.
    pub(crate) fn write_unchecked(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.inner.state.write()
    }

    /// End of the range the calling thread may look at.
    pub(crate) fn visible_head(&self, state: &GraphState) -> BlobIndex {
        if self.inner.role.held_by_current_thread() {
            state.store.write_head()
        } else {
            state.store.read_head()
        }
    }

    pub(crate) fn check_visible(&self, state: &GraphState, index: BlobIndex) -> Result<()> {
        let hi = self.visible_head(state);
        if index < BlobIndex::ROOT || index >= hi {
            return Err(StrataError::RangeError {
                index,
                lo: BlobIndex::ROOT,
                hi,
            });
        }
        Ok(())
    }

    /// Uid of the graph; zero until an empty replica receives its root.
    pub fn uid(&self) -> BaseUid {
        self.read().uid
    }

    /// End of everything written, published or not.
    pub fn write_head(&self) -> BlobIndex {
        self.read().store.write_head()
    }

    /// End of what readers see.
    pub fn read_head(&self) -> BlobIndex {
        self.read().store.read_head()
    }

    /// End of what has been shipped to replicas.
    pub fn sync_head(&self) -> BlobIndex {
        self.read().store.sync_head()
    }

    /// Latest closed tx marker, or the root when none exists.
    pub fn latest_complete_tx(&self) -> BlobIndex {
        self.read().latest_complete_tx
    }

    /// Tx marker of the batch in progress, if any.
    pub fn open_tx(&self) -> Option<BlobIndex> {
        self.read().open_tx
    }

    /// Decoded record at `index`.
    pub fn blob(&self, index: BlobIndex) -> Result<Blob> {
        let state = self.read();
        self.check_visible(&state, index)?;
        state.store.blob(index)
    }

    /// Indices of every visible record, root first.
    pub fn indices(&self) -> Result<Vec<BlobIndex>> {
        let state = self.read();
        let hi = self.visible_head(&state);
        state.store.indices(BlobIndex::ROOT, hi)
    }

    /// Signed references held by the edge list of `index`.
    pub fn edge_refs(&self, index: BlobIndex) -> Result<Vec<i32>> {
        let state = self.read();
        self.check_visible(&state, index)?;
        edges::edge_refs(&state.store, index)
    }

    /// Layout version and revision stored in the root record.
    pub fn root_info(&self) -> Result<RootNode> {
        match self.blob(BlobIndex::ROOT)? {
            Blob::Root(root) => Ok(root),
            other => Err(StrataError::type_mismatch(BlobIndex::ROOT, "root record", other.blob_type().name())),
        }
    }

    /// Name registry shared by everything that talks to this graph.
    pub fn registry(&self) -> MappedRwLockWriteGuard<'_, TokenRegistry> {
        RwLockWriteGuard::map(self.inner.state.write(), |state| &mut state.registry)
    }

    /// Copy of the published bytes, suitable for [`Graph::open_arena`].
    pub fn arena_image(&self) -> Result<Vec<u8>> {
        let state = self.read();
        let hi = state.store.read_head();
        Ok(state.store.bytes(BlobIndex(0), hi)?.to_vec())
    }

    /// Lets the arena drop bytes that are already synchronized.
    pub fn page_out(&self) {
        self.inner.state.write().store.page_out();
    }
}
