//! Edge lists.
//!
//! Each record that owns an edge list embeds one segment; when it fills up a
//! [`BlobType::DeferredEdgeList`] record continues it. A slot holds a signed index:
//! positive when the owner is the source of the referenced record, negative when it
//! is the target. Zero marks a free slot; slots fill strictly in order.

use tracing::debug;

use crate::storage::blob::{Blob, DeferredEdgeList};
use crate::storage::layout::{self, BlobType, SENTINEL_SUBSEQUENT};
use crate::storage::store::BlobStore;
use crate::types::{BlobIndex, Result, StrataError};

/// One segment of an edge-list chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Record holding the segment.
    pub index: BlobIndex,
    at: usize,
    /// Number of slots.
    pub capacity: usize,
}

impl Segment {
    /// Resolves the segment embedded in the record at `index`.
    pub fn of(store: &BlobStore, index: BlobIndex) -> Result<Segment> {
        let ty = store.blob_type(index)?;
        let at = ty
            .edge_segment_at()
            .ok_or_else(|| StrataError::type_mismatch(index, "record with an edge list", ty.name()))?;
        let raw = store.read_i32(index, at)?;
        let capacity = usize::try_from(raw)
            .ok()
            .filter(|c| *c > 0 && ty.inline_capacity().map_or(true, |fixed| fixed == *c))
            .ok_or_else(|| StrataError::Corruption(format!("edge capacity {raw} in blob {index}")))?;
        Ok(Segment { index, at, capacity })
    }

    fn slot_at(&self, slot: usize) -> usize {
        self.at + 8 + 4 * slot
    }

    /// Value of slot `slot`; zero when free.
    pub fn slot(&self, store: &BlobStore, slot: usize) -> Result<i32> {
        store.read_i32(self.index, self.slot_at(slot))
    }

    pub(crate) fn set_slot(&self, store: &mut BlobStore, slot: usize, value: i32) -> Result<()> {
        store.write_i32(self.index, self.slot_at(slot), value)
    }

    /// Non-zero slots in order.
    pub fn refs(&self, store: &BlobStore) -> Result<Vec<i32>> {
        let mut out = Vec::with_capacity(self.capacity);
        for i in 0..self.capacity {
            let v = self.slot(store, i)?;
            if v == 0 {
                break;
            }
            out.push(v);
        }
        Ok(out)
    }

    /// Position of the first free slot, if any.
    pub fn first_free(&self, store: &BlobStore) -> Result<Option<usize>> {
        for i in 0..self.capacity {
            if self.slot(store, i)? == 0 {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Next segment of the chain, if any.
    pub fn subsequent(&self, store: &BlobStore) -> Result<Option<BlobIndex>> {
        let raw = store.read_i32(self.index, self.slot_at(self.capacity))?;
        Ok((raw != SENTINEL_SUBSEQUENT).then_some(BlobIndex(raw)))
    }

    pub(crate) fn set_subsequent(&self, store: &mut BlobStore, next: Option<BlobIndex>) -> Result<()> {
        let raw = next.map_or(SENTINEL_SUBSEQUENT, |n| n.0);
        store.write_i32(self.index, self.slot_at(self.capacity), raw)
    }

    /// Last segment of the chain as recorded on the owner; zero means the owner.
    pub(crate) fn tail(&self, store: &BlobStore) -> Result<BlobIndex> {
        let raw = store.read_i32(self.index, self.at + 4)?;
        Ok(if raw == 0 { self.index } else { BlobIndex(raw) })
    }

    pub(crate) fn set_tail(&self, store: &mut BlobStore, tail: BlobIndex) -> Result<()> {
        let raw = if tail == self.index { 0 } else { tail.0 };
        store.write_i32(self.index, self.at + 4, raw)
    }

    pub(crate) fn clear_from(&self, store: &mut BlobStore, slot: usize) -> Result<()> {
        for i in slot..self.capacity {
            self.set_slot(store, i, 0)?;
        }
        Ok(())
    }
}

/// Segments of the chain starting at `holder`, the holder's own segment first.
pub fn segments(store: &BlobStore, holder: BlobIndex) -> Result<Vec<Segment>> {
    let mut out = vec![Segment::of(store, holder)?];
    let limit = store.write_head().0 as usize;
    while let Some(next) = out[out.len() - 1].subsequent(store)? {
        if next <= out[out.len() - 1].index || out.len() > limit {
            return Err(StrataError::StructuralViolation {
                index: holder,
                reason: format!("edge list continuation {next} does not move forward"),
            });
        }
        let seg = Segment::of(store, next)?;
        match store.blob(next)? {
            Blob::DeferredEdgeList(d) if d.first_blob == holder => out.push(seg),
            other => {
                return Err(StrataError::StructuralViolation {
                    index: holder,
                    reason: format!("continuation {next} is {:?}, not its deferred list", other.blob_type()),
                })
            }
        }
    }
    Ok(out)
}

/// Every reference held by `holder`, in append order.
pub fn edge_refs(store: &BlobStore, holder: BlobIndex) -> Result<Vec<i32>> {
    let mut out = Vec::new();
    for seg in segments(store, holder)? {
        out.extend(seg.refs(store)?);
    }
    Ok(out)
}

/// Deferred lists continuing the edge list of `holder`.
pub fn deferred_chain(store: &BlobStore, holder: BlobIndex) -> Result<Vec<BlobIndex>> {
    Ok(segments(store, holder)?
        .into_iter()
        .skip(1)
        .map(|seg| seg.index)
        .collect())
}

/// Slots across the whole chain of `holder`.
pub fn total_capacity(store: &BlobStore, holder: BlobIndex) -> Result<usize> {
    Ok(segments(store, holder)?.iter().map(|s| s.capacity).sum())
}

fn check_ref(store: &BlobStore, signed: i32) -> Result<()> {
    let target = BlobIndex(signed.saturating_abs());
    if signed == 0 || target >= store.write_head() {
        return Err(StrataError::RangeError {
            index: target,
            lo: BlobIndex::ROOT,
            hi: store.write_head(),
        });
    }
    Ok(())
}

/// Record named by the reference `signed` found in the edge list of `holder`.
pub fn referenced(holder: BlobIndex, signed: i32) -> Result<BlobIndex> {
    signed
        .checked_abs()
        .filter(|r| *r != 0)
        .map(BlobIndex)
        .ok_or_else(|| StrataError::Corruption(format!("edge reference {signed} in the list of {holder}")))
}

/// Appends `signed` to the edge list of `holder`.
///
/// When the chain is full a deferred list is created if `allow_new_overflow` is
/// set; otherwise the call fails with [`StrataError::CapacityExceeded`] and nothing
/// is written.
pub fn append(store: &mut BlobStore, holder: BlobIndex, signed: i32, allow_new_overflow: bool) -> Result<()> {
    check_ref(store, signed)?;
    let owner = Segment::of(store, holder)?;
    let mut seg = Segment::of(store, owner.tail(store)?)?;
    loop {
        if let Some(slot) = seg.first_free(store)? {
            return seg.set_slot(store, slot, signed);
        }
        match seg.subsequent(store)? {
            Some(next) => {
                seg = Segment::of(store, next)?;
                owner.set_tail(store, next)?;
            }
            None if allow_new_overflow => {
                let capacity = layout::deferred_capacity(total_capacity(store, holder)?);
                let deferred = store.append_blob(&Blob::DeferredEdgeList(DeferredEdgeList {
                    first_blob: holder,
                    capacity,
                }))?;
                seg.set_subsequent(store, Some(deferred))?;
                owner.set_tail(store, deferred)?;
                debug!(holder = holder.0, index = deferred.0, capacity, "edges.deferred.created");
                seg = Segment::of(store, deferred)?;
            }
            None => {
                return Err(StrataError::CapacityExceeded {
                    holder,
                    edge: signed,
                })
            }
        }
    }
}

/// Appends `signed` unless the chain already holds it; never creates a deferred
/// list. Scanning starts at `hint` (a segment of this chain) when given and the
/// segment where the value was found or written is returned as the next hint.
pub fn idempotent_append(
    store: &mut BlobStore,
    holder: BlobIndex,
    signed: i32,
    hint: Option<BlobIndex>,
) -> Result<BlobIndex> {
    check_ref(store, signed)?;
    let mut seg = Segment::of(store, hint.unwrap_or(holder))?;
    loop {
        for i in 0..seg.capacity {
            match seg.slot(store, i)? {
                v if v == signed => return Ok(seg.index),
                0 => {
                    seg.set_slot(store, i, signed)?;
                    return Ok(seg.index);
                }
                _ => {}
            }
        }
        match seg.subsequent(store)? {
            Some(next) => seg = Segment::of(store, next)?,
            None => {
                return Err(StrataError::CapacityExceeded {
                    holder,
                    edge: signed,
                })
            }
        }
    }
}

/// Whether `holder` lists an outgoing reference to a record of type `ty`.
pub fn has_out(store: &BlobStore, holder: BlobIndex, ty: BlobType) -> Result<bool> {
    for r in edge_refs(store, holder)? {
        if r > 0 && store.blob_type(BlobIndex(r))? == ty {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Records of type `ty` referenced by `holder` with the given direction.
pub fn linked(store: &BlobStore, holder: BlobIndex, ty: BlobType, outgoing: bool) -> Result<Vec<BlobIndex>> {
    let mut out = Vec::new();
    for r in edge_refs(store, holder)? {
        if (r > 0) == outgoing {
            let idx = referenced(holder, r)?;
            if store.blob_type(idx)? == ty {
                out.push(idx);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::arena::MemArena;
    use crate::storage::blob::{EntityNode, Link};
    use crate::types::{BaseUid, EntityType, TimeSlice};

    fn store_with_entity() -> Result<(BlobStore, BlobIndex)> {
        let mut s = BlobStore::new(Box::new(MemArena::new(4096, 4096, 1 << 20)));
        let e = s.append_blob(&Blob::Entity(EntityNode {
            entity_type: EntityType(1),
            instantiation: TimeSlice(1),
            termination: TimeSlice(0),
            uid: BaseUid([1; 16]),
        }))?;
        Ok((s, e))
    }

    fn link(s: &mut BlobStore, e: BlobIndex) -> Result<BlobIndex> {
        s.append_blob(&Blob::NextTx(Link { source: e, target: e }))
    }

    #[test]
    fn overflow_creates_one_deferred_list() -> Result<()> {
        let (mut s, e) = store_with_entity()?;
        let mut expected = Vec::new();
        for _ in 0..20 {
            let l = link(&mut s, e)?;
            append(&mut s, e, l.0, true)?;
            expected.push(l.0);
        }
        assert_eq!(edge_refs(&s, e)?, expected);
        let chain = deferred_chain(&s, e)?;
        assert_eq!(chain.len(), 1);
        assert_eq!(total_capacity(&s, e)?, 7 + 21);
        assert_eq!(Segment::of(&s, e)?.tail(&s)?, chain[0]);
        Ok(())
    }

    #[test]
    fn full_chain_without_overflow_fails() -> Result<()> {
        let (mut s, e) = store_with_entity()?;
        for _ in 0..7 {
            let l = link(&mut s, e)?;
            append(&mut s, e, l.0, false)?;
        }
        let l = link(&mut s, e)?;
        let err = append(&mut s, e, -l.0, false).unwrap_err();
        assert!(matches!(err, StrataError::CapacityExceeded { edge, .. } if edge == -l.0));
        assert!(matches!(
            idempotent_append(&mut s, e, l.0, None),
            Err(StrataError::CapacityExceeded { .. })
        ));
        assert_eq!(edge_refs(&s, e)?.len(), 7);
        Ok(())
    }

    #[test]
    fn idempotent_append_skips_present_values() -> Result<()> {
        let (mut s, e) = store_with_entity()?;
        let a = link(&mut s, e)?;
        let b = link(&mut s, e)?;
        let hint = idempotent_append(&mut s, e, a.0, None)?;
        let hint = idempotent_append(&mut s, e, a.0, Some(hint))?;
        idempotent_append(&mut s, e, -b.0, Some(hint))?;
        assert_eq!(edge_refs(&s, e)?, vec![a.0, -b.0]);
        let beyond = s.write_head().0;
        assert!(matches!(
            append(&mut s, e, beyond, true),
            Err(StrataError::RangeError { .. })
        ));
        Ok(())
    }

    #[test]
    fn unrepresentable_reference_is_corruption() -> Result<()> {
        let (mut s, e) = store_with_entity()?;
        let l = link(&mut s, e)?;
        append(&mut s, e, l.0, true)?;
        Segment::of(&s, e)?.set_slot(&mut s, 1, i32::MIN)?;
        assert!(matches!(
            linked(&s, e, BlobType::NextTx, false),
            Err(StrataError::Corruption(_))
        ));
        assert_eq!(linked(&s, e, BlobType::NextTx, true)?, vec![l]);
        assert!(matches!(referenced(e, 0), Err(StrataError::Corruption(_))));
        Ok(())
    }
}
