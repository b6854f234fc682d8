use time::OffsetDateTime;
use tracing::debug;

use super::{Graph, GraphState};
use crate::storage::blob::{Blob, Link, TxEventNode};
use crate::storage::edges;
use crate::storage::layout::BlobType;
use crate::types::{BlobIndex, Result, StrataError, TimeSlice, Timestamp};

/// RAII scope of the write role.
///
/// Guards nest on one thread. When the outermost guard drops, the open tx marker
/// (if any) becomes the latest complete tx and the batch is published to readers.
pub struct TxGuard {
    graph: Graph,
}

impl TxGuard {
    /// Graph the role is held on.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        let role = self.graph.role();
        if role.held_by_current_thread() && role.snapshot().depth == 1 {
            self.graph.write_unchecked().close_tx();
        }
        role.exit();
    }
}

/// A record viewed at the time slice of a tx marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRef {
    /// Record being viewed.
    pub blob: BlobIndex,
    /// Tx marker fixing the point in time.
    pub tx: BlobIndex,
    /// Slice of `tx`.
    pub time_slice: TimeSlice,
}

fn now_micros() -> Timestamp {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    Timestamp((nanos / 1_000) as i64)
}

impl GraphState {
    /// Returns the open tx marker, creating it on first use in a batch.
    pub(crate) fn get_or_open_tx(&mut self) -> Result<BlobIndex> {
        if let Some(tx) = self.open_tx {
            return Ok(tx);
        }
        let prev = self.latest_complete_tx;
        let slice = TimeSlice(self.time_slice_of(prev)?.0 + 1);
        let lo = self.store.write_head();
        let uid = self.fresh_uid();
        let tx = self.store.append_blob(&Blob::TxEvent(TxEventNode {
            time: now_micros(),
            time_slice: slice,
            uid,
        }))?;
        self.write_edge(Blob::NextTx(Link {
            source: prev,
            target: tx,
        }))?;
        self.open_tx = Some(tx);
        self.apply_range(lo)?;
        debug!(tx = tx.0, time_slice = slice.0, "tx.opened");
        Ok(tx)
    }

    /// Time slice stamped on a tx marker; the root counts as slice zero.
    pub(crate) fn time_slice_of(&self, tx: BlobIndex) -> Result<TimeSlice> {
        match self.store.blob(tx)? {
            Blob::TxEvent(t) => Ok(t.time_slice),
            Blob::Root(_) if tx == BlobIndex::ROOT => Ok(TimeSlice(0)),
            other => Err(StrataError::type_mismatch(tx, "tx marker", other.blob_type().name())),
        }
    }

    /// Slice the current batch writes at, whether or not its marker exists yet.
    pub(crate) fn pending_slice(&self) -> Result<TimeSlice> {
        match self.open_tx {
            Some(tx) => self.time_slice_of(tx),
            None => Ok(TimeSlice(self.time_slice_of(self.latest_complete_tx)?.0 + 1)),
        }
    }

    pub(crate) fn exists_at(&self, record: BlobIndex, slice: TimeSlice) -> Result<bool> {
        let blob = self.store.blob(record)?;
        match &blob {
            Blob::Root(_) if record == BlobIndex::ROOT => return Ok(true),
            Blob::Value(_) => return Ok(true),
            Blob::Root(_) | Blob::TxEvent(_) | Blob::Entity(_) | Blob::AttributeEntity(_) | Blob::Relation(_) => {}
            other => {
                return Err(StrataError::type_mismatch(record, "promotable record", other.blob_type().name()));
            }
        }
        if let Some(td) = self.incoming_to_delegate(record)? {
            return self.delegate_alive(td, slice);
        }
        Ok(match blob {
            Blob::TxEvent(t) => t.time_slice <= slice,
            other => match other.lifetime() {
                Some((inst, term)) => inst <= slice && (term.0 == 0 || slice < term),
                None => true,
            },
        })
    }

    /// Whether the delegate reached through `to_delegate` exists at `slice`: its
    /// latest instantiation at or before the slice is later than its latest
    /// retirement.
    pub(crate) fn delegate_alive(&self, to_delegate: BlobIndex, slice: TimeSlice) -> Result<bool> {
        let mut instantiated = None;
        let mut retired = None;
        for r in edges::edge_refs(&self.store, to_delegate)? {
            if r > 0 {
                continue;
            }
            let edge = BlobIndex(-r);
            let (slot, source) = match self.store.blob(edge)? {
                Blob::DelegateInstantiation(l) => (&mut instantiated, l.source),
                Blob::DelegateRetirement(l) => (&mut retired, l.source),
                _ => continue,
            };
            let at = self.time_slice_of(source)?;
            if at <= slice {
                *slot = (*slot).max(Some((at, edge)));
            }
        }
        Ok(instantiated > retired)
    }

    pub(crate) fn to_frame(&self, record: BlobIndex, tx: BlobIndex, allow_terminated: bool) -> Result<FrameRef> {
        let ty = self.store.blob_type(record)?;
        if !ty.is_promotable() {
            return Err(StrataError::type_mismatch(record, "promotable record", ty.name()));
        }
        if !matches!(self.store.blob_type(tx)?, BlobType::TxEvent | BlobType::Root) {
            return Err(StrataError::type_mismatch(tx, "tx marker", self.store.blob_type(tx)?.name()));
        }
        let time_slice = self.time_slice_of(tx)?;
        if !allow_terminated && !self.exists_at(record, time_slice)? {
            return Err(StrataError::NotAlive {
                index: record,
                time_slice,
            });
        }
        Ok(FrameRef {
            blob: record,
            tx,
            time_slice,
        })
    }

    /// Walks the tx chain from the root up to (excluding) the open marker.
    pub(crate) fn recompute_latest_complete_tx(&mut self) -> Result<()> {
        let mut cur = BlobIndex::ROOT;
        loop {
            let next = edges::linked(&self.store, cur, BlobType::NextTx, true)?
                .into_iter()
                .next()
                .map(|edge| self.ends_of(edge).map(|(_, target)| target))
                .transpose()?;
            match next {
                Some(tx) if Some(tx) != self.open_tx => cur = tx,
                _ => break,
            }
        }
        self.latest_complete_tx = cur;
        Ok(())
    }
}

impl Graph {
    /// Takes the write role, blocking while another thread holds it.
    pub fn begin_tx(&self) -> TxGuard {
        self.role().enter();
        TxGuard { graph: self.clone() }
    }

    /// Takes the write role if no other thread holds it.
    pub fn try_begin_tx(&self) -> Option<TxGuard> {
        self.role().try_enter().then(|| TxGuard { graph: self.clone() })
    }

    /// Index of the open tx marker, creating it if this batch has none yet.
    pub fn get_or_open_tx(&self) -> Result<BlobIndex> {
        self.write()?.get_or_open_tx()
    }

    /// Time slice of the tx marker `tx`.
    pub fn time_slice_of(&self, tx: BlobIndex) -> Result<TimeSlice> {
        let state = self.read();
        self.check_visible(&state, tx)?;
        state.time_slice_of(tx)
    }

    /// Whether `record` exists at `slice`.
    pub fn exists_at(&self, record: BlobIndex, slice: TimeSlice) -> Result<bool> {
        let state = self.read();
        self.check_visible(&state, record)?;
        state.exists_at(record, slice)
    }

    /// Whether `record` exists at the slice of the tx marker `tx`.
    pub fn exists_at_tx(&self, record: BlobIndex, tx: BlobIndex) -> Result<bool> {
        let state = self.read();
        self.check_visible(&state, record)?;
        self.check_visible(&state, tx)?;
        let slice = state.time_slice_of(tx)?;
        state.exists_at(record, slice)
    }

    /// Pairs `record` with the tx marker `tx` it is viewed at.
    pub fn to_frame(&self, record: BlobIndex, tx: BlobIndex, allow_terminated: bool) -> Result<FrameRef> {
        let state = self.read();
        self.check_visible(&state, record)?;
        self.check_visible(&state, tx)?;
        state.to_frame(record, tx, allow_terminated)
    }
}
