//! Replay engine.
//!
//! Every record type has an apply handler (run once the record is durable) and an
//! unapply handler that is its exact inverse. Cache entries are keyed by the
//! record whose handler produced them, so unapplying removes precisely what
//! applying added and applying twice adds nothing new.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::storage::blob::Blob;
use crate::storage::caches::{value_hash, CacheKey, CacheName};
use crate::storage::edges::{self, Segment};
use crate::storage::graph::{Graph, GraphState};
use crate::storage::layout::BlobType;
use crate::types::{BaseUid, BlobIndex, Result, StrataError, TimeSlice, Value};

impl GraphState {
    /// Applies every record in `[lo, write_head)` with cache filling on.
    pub(crate) fn apply_range(&mut self, lo: BlobIndex) -> Result<()> {
        let hi = self.store.write_head();
        for index in self.store.indices(lo, hi)? {
            self.apply_action(index, true)?;
        }
        Ok(())
    }

    /// Instance targeted by the RAE instance edge `rae`.
    fn rae_target(&self, rae: BlobIndex) -> Result<BlobIndex> {
        match self.store.blob(rae)? {
            Blob::RaeInstance(link) => Ok(link.target),
            other => Err(StrataError::type_mismatch(rae, "RAE instance edge", other.blob_type().name())),
        }
    }

    /// Cache entry owned by the record at `index`, other than tag entries.
    fn cache_effect(&self, index: BlobIndex, blob: &Blob) -> Result<Option<(CacheName, CacheKey)>> {
        let uid_entry = |uid: BaseUid| Some((CacheName::UidLookup, CacheKey::Uid(uid)));
        Ok(match blob {
            Blob::Root(r) => (!self.is_delegate(index)?).then(|| uid_entry(r.uid)).flatten(),
            Blob::TxEvent(t) => (!self.is_delegate(index)?).then(|| uid_entry(t.uid)).flatten(),
            Blob::Entity(e) => {
                if self.is_delegate(index)? {
                    Some((CacheName::EtsUsed, CacheKey::Token(e.entity_type.0)))
                } else {
                    uid_entry(e.uid)
                }
            }
            Blob::AttributeEntity(a) => {
                if !self.is_delegate(index)? {
                    uid_entry(a.uid)
                } else if a.rep_type.tracks_family() {
                    Some((CacheName::EnsUsed, CacheKey::Token(a.rep_type.family_bits())))
                } else {
                    None
                }
            }
            Blob::Relation(r) => {
                if self.is_delegate(index)? {
                    Some((CacheName::RtsUsed, CacheKey::Token(r.relation_type.0)))
                } else {
                    uid_entry(r.uid)
                }
            }
            Blob::Value(v) => Some((CacheName::AvHashLookup, CacheKey::Hash(value_hash(v.rep_type, &v.data)))),
            Blob::AtomicValueAssignment(a) if a.rep_type.is_enum() => match Value::decode(a.rep_type, &a.data)? {
                Value::Enum(ev) => Some((CacheName::EnsUsed, CacheKey::Token(ev.0))),
                _ => None,
            },
            _ => None,
        })
    }

    /// Runs the apply handler of the record at `index`.
    ///
    /// Termination patches run regardless of `fill_caches`; cache entries are only
    /// produced when it is set.
    pub(crate) fn apply_action(&mut self, index: BlobIndex, fill_caches: bool) -> Result<()> {
        let blob = self.store.blob(index)?;
        if let Blob::Termination(link) = &blob {
            let slice = self.time_slice_of(link.source)?;
            let record = self.rae_target(link.target)?;
            return self.store.patch_termination(record, slice);
        }
        if !fill_caches {
            return Ok(());
        }
        match &blob {
            Blob::AssignTagName(a) => {
                if !edges::has_out(&self.store, index, BlobType::NextTagNameAssignment)? {
                    let record = self.rae_target(a.target)?;
                    self.caches
                        .get_mut(CacheName::TagLookup)
                        .insert(CacheKey::Tag(a.tag.clone()), record, index);
                }
            }
            Blob::NextTagNameAssignment(link) => {
                let (tag, _) = self.tag_assignment(link.source)?;
                self.caches
                    .get_mut(CacheName::TagLookup)
                    .supersede(&CacheKey::Tag(tag), link.source, index);
            }
            other => {
                if let Some((name, key)) = self.cache_effect(index, other)? {
                    let cache = self.caches.get_mut(name);
                    match name {
                        CacheName::EtsUsed | CacheName::RtsUsed | CacheName::EnsUsed => {
                            cache.insert_if_absent(key, index, index);
                        }
                        _ => {
                            cache.insert(key, index, index);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Inverse of [`GraphState::apply_action`].
    pub(crate) fn unapply_action(&mut self, index: BlobIndex, fill_caches: bool) -> Result<()> {
        let blob = self.store.blob(index)?;
        if let Blob::Termination(link) = &blob {
            let record = self.rae_target(link.target)?;
            return self.store.patch_termination(record, TimeSlice(0));
        }
        if !fill_caches {
            return Ok(());
        }
        match &blob {
            Blob::AssignTagName(a) => {
                self.caches
                    .get_mut(CacheName::TagLookup)
                    .remove(&CacheKey::Tag(a.tag.clone()), index);
            }
            Blob::NextTagNameAssignment(link) => {
                let (tag, record) = self.tag_assignment(link.source)?;
                self.caches
                    .get_mut(CacheName::TagLookup)
                    .insert(CacheKey::Tag(tag), record, link.source);
            }
            other => {
                if let Some((name, key)) = self.cache_effect(index, other)? {
                    self.caches.get_mut(name).remove(&key, index);
                }
            }
        }
        Ok(())
    }

    /// Tag and tagged record of the assignment edge at `index`.
    fn tag_assignment(&self, index: BlobIndex) -> Result<(String, BlobIndex)> {
        match self.store.blob(index)? {
            Blob::AssignTagName(a) => Ok((a.tag, self.rae_target(a.target)?)),
            other => Err(StrataError::type_mismatch(index, "tag assignment edge", other.blob_type().name())),
        }
    }

    /// Adds the back references that records in `[lo, hi)` owe to holders below
    /// `lo`, and links deferred lists in range into the chains they continue.
    ///
    /// Back references go through the non-overflow path: a holder whose chain is
    /// full without a continuation in range fails with `CapacityExceeded`. Running
    /// this twice over the same range changes nothing.
    pub(crate) fn apply_double_linking(&mut self, lo: BlobIndex, hi: BlobIndex) -> Result<()> {
        let mut owed: BTreeMap<BlobIndex, Vec<i32>> = BTreeMap::new();
        let mut lists: BTreeMap<BlobIndex, Vec<(BlobIndex, Option<BlobIndex>)>> = BTreeMap::new();
        for index in self.store.indices(lo, hi)? {
            let blob = self.store.blob(index)?;
            if let Blob::DeferredEdgeList(d) = &blob {
                if d.first_blob < lo {
                    let next = Segment::of(&self.store, index)?.subsequent(&self.store)?;
                    lists.entry(d.first_blob).or_default().push((index, next));
                }
            }
            if let Some((source, target)) = blob.source_target() {
                if source < lo {
                    owed.entry(source).or_default().push(index.0);
                }
                if target < lo {
                    owed.entry(target).or_default().push(-index.0);
                }
            }
        }

        let mut heads = BTreeMap::new();
        for (holder, chain) in &lists {
            let pointed: Vec<BlobIndex> = chain.iter().filter_map(|(_, next)| *next).collect();
            let starts: Vec<BlobIndex> = chain
                .iter()
                .map(|(index, _)| *index)
                .filter(|index| !pointed.contains(index))
                .collect();
            let [head] = starts.as_slice() else {
                return Err(StrataError::StructuralViolation {
                    index: *holder,
                    reason: format!("{} deferred lists in range do not form one chain", chain.len()),
                });
            };
            heads.insert(*holder, *head);
        }

        let holders: BTreeSet<BlobIndex> = owed.keys().chain(heads.keys()).copied().collect();
        for holder in holders {
            let mut refs = owed.remove(&holder).unwrap_or_default();
            refs.sort_by_key(|r| (r.unsigned_abs(), *r < 0));
            refs.dedup();
            let head = heads.get(&holder).copied();
            let pending_head = match head {
                Some(head) if !edges::segments(&self.store, holder)?.iter().any(|s| s.index == head) => Some(head),
                _ => None,
            };
            if let Some(head) = pending_head {
                let carried = self.chain_refs(head)?;
                refs.retain(|r| !carried.contains(r));
            }
            let mut hint = None;
            for r in &refs {
                hint = Some(edges::idempotent_append(&mut self.store, holder, *r, hint)?);
            }
            if let Some(head) = pending_head {
                let segs = edges::segments(&self.store, holder)?;
                let last = segs[segs.len() - 1];
                if last.first_free(&self.store)?.is_some() {
                    return Err(StrataError::StructuralViolation {
                        index: holder,
                        reason: format!("edge list not full before continuation {head}"),
                    });
                }
                last.set_subsequent(&mut self.store, Some(head))?;
                let tail = self.chain_end(head)?;
                Segment::of(&self.store, holder)?.set_tail(&mut self.store, tail)?;
            }
            debug!(holder = holder.0, refs = refs.len(), continued = pending_head.is_some(), "replay.double_linked");
        }
        Ok(())
    }

    fn chain_refs(&self, start: BlobIndex) -> Result<Vec<i32>> {
        let mut out = Vec::new();
        let mut cur = Some(start);
        while let Some(index) = cur {
            let seg = Segment::of(&self.store, index)?;
            out.extend(seg.refs(&self.store)?);
            cur = seg.subsequent(&self.store)?.filter(|next| *next > index);
        }
        Ok(out)
    }

    fn chain_end(&self, start: BlobIndex) -> Result<BlobIndex> {
        let mut cur = start;
        while let Some(next) = Segment::of(&self.store, cur)?.subsequent(&self.store)? {
            if next <= cur {
                return Err(StrataError::StructuralViolation {
                    index: cur,
                    reason: format!("continuation {next} does not move forward"),
                });
            }
            cur = next;
        }
        Ok(cur)
    }

    /// Removes what [`GraphState::apply_double_linking`] added for `[lo, hi)`.
    pub(crate) fn undo_double_linking(&mut self, lo: BlobIndex, hi: BlobIndex) -> Result<()> {
        let mut holders = BTreeSet::new();
        for index in self.store.indices(lo, hi)? {
            let blob = self.store.blob(index)?;
            if let Some((source, target)) = blob.source_target() {
                holders.extend([source, target].into_iter().filter(|h| *h < lo));
            }
            if let Blob::DeferredEdgeList(d) = blob {
                if d.first_blob < lo {
                    holders.insert(d.first_blob);
                }
            }
        }
        for holder in holders {
            let kept: Vec<Segment> = edges::segments(&self.store, holder)?
                .into_iter()
                .take_while(|seg| seg.index < lo)
                .collect();
            let Some(last) = kept.last().copied() else {
                continue;
            };
            let floor = lo.0.unsigned_abs();
            if let Some(pos) = last.refs(&self.store)?.iter().position(|r| r.unsigned_abs() >= floor) {
                last.clear_from(&mut self.store, pos)?;
            }
            last.set_subsequent(&mut self.store, None)?;
            Segment::of(&self.store, holder)?.set_tail(&mut self.store, last.index)?;
        }
        Ok(())
    }

    /// Discards `[k, write_head)`: unapplies in reverse, undoes double linking and
    /// zeroes the bytes. The root record always stays.
    pub(crate) fn roll_back(&mut self, k: BlobIndex) -> Result<()> {
        let hi = self.store.write_head();
        if k <= BlobIndex::ROOT || k > hi {
            return Err(StrataError::RangeError {
                index: k,
                lo: BlobIndex::ROOT.advance(1),
                hi,
            });
        }
        if k == hi {
            return Ok(());
        }
        let all = self.store.indices(BlobIndex::ROOT, hi)?;
        let Ok(start) = all.binary_search(&k) else {
            return Err(StrataError::Invalid(format!("{k} is not a record boundary")));
        };
        for index in all[start..].iter().rev() {
            self.unapply_action(*index, true)?;
        }
        self.undo_double_linking(k, hi)?;
        if self.open_tx.is_some_and(|tx| tx >= k) {
            self.open_tx = None;
        }
        self.store.truncate(k)?;
        self.delegates.clear();
        self.recompute_latest_complete_tx()
    }

    /// Writes `bytes` as `[lo, hi)`, double-links them and runs their apply
    /// handlers. The caller arms the store's undo log beforehand to take a failure
    /// back.
    pub(crate) fn include_new_blobs(
        &mut self,
        lo: BlobIndex,
        hi: BlobIndex,
        bytes: &[u8],
        fill_caches: bool,
    ) -> Result<()> {
        if self.store.write_head() != lo {
            return Err(StrataError::HeadsMismatch(format!(
                "blocks start at {lo} but write head is {}",
                self.store.write_head()
            )));
        }
        let end = self.store.extend_raw(bytes)?;
        if end != hi {
            return Err(StrataError::Corruption(format!("blocks end at {end}, expected {hi}")));
        }
        let indices = self.store.indices(lo, hi)?;
        for index in &indices {
            self.check_record_refs(*index)?;
        }
        self.apply_double_linking(lo, hi)?;
        for index in indices {
            self.apply_action(index, fill_caches)?;
        }
        Ok(())
    }

    /// Incoming records may only point backwards (or at themselves).
    fn check_record_refs(&self, index: BlobIndex) -> Result<()> {
        let blob = self.store.blob(index)?;
        let mut refs = Vec::new();
        if let Some((source, target)) = blob.source_target() {
            refs.extend([source, target]);
        }
        match &blob {
            Blob::AttributeValueAssignment(a) => refs.push(a.value_node),
            Blob::DeferredEdgeList(d) => refs.push(d.first_blob),
            _ => {}
        }
        if let Some(bad) = refs.into_iter().find(|r| *r < BlobIndex::ROOT || *r > index) {
            return Err(StrataError::Corruption(format!("blob {index} references {bad}")));
        }
        Ok(())
    }

    /// Drops every cache and rebuilds them by replaying all records.
    pub(crate) fn rebuild_caches(&mut self) -> Result<()> {
        self.caches.clear();
        let hi = self.store.write_head();
        for index in self.store.indices(BlobIndex::ROOT, hi)? {
            self.apply_action(index, true)?;
        }
        self.caches.settle(self.store.read_head());
        Ok(())
    }
}

impl Graph {
    /// Discards every record at or above `k`, which must lie above the root.
    pub fn roll_back_to(&self, k: BlobIndex) -> Result<()> {
        let mut state = self.write()?;
        let from = state.store.write_head();
        state.roll_back(k)?;
        info!(from = from.0, to = k.0, "graph.rolled_back");
        Ok(())
    }

    /// Double-links `[lo, hi)`; idempotent.
    pub fn apply_double_linking(&self, lo: BlobIndex, hi: BlobIndex) -> Result<()> {
        self.write()?.apply_double_linking(lo, hi)
    }

    /// Rebuilds every cache by full replay from the root.
    pub fn rebuild_caches(&self) -> Result<()> {
        self.write()?.rebuild_caches()
    }
}
