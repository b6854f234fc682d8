use tracing::{debug, error, info, warn};

use crate::primitives::bytes::be;
use crate::storage::blob::Blob;
use crate::storage::caches::{CacheName, CacheSet};
use crate::storage::edges;
use crate::storage::layout::segment_len;
use crate::storage::GraphState;
use crate::storage::Graph;
use crate::sync::heads::UpdateHeads;
use crate::sync::layout::{convert_payload, walk_records, LayoutVersion};
use crate::sync::payload::{graph_hash, CacheRange, PayloadMeta, UpdatePayload};
use crate::types::{BaseUid, BlobIndex, Result, StrataError};

/// Builds the payload for `heads`, converted to `target`.
///
/// The graph must have no unpublished records and `heads` must end at the read
/// head. Every edge-list continuation a back reference in range depends on must
/// itself lie inside the range or below it.
pub fn serialize(graph: &Graph, heads: &UpdateHeads, target: LayoutVersion) -> Result<UpdatePayload> {
    let _tx = graph.begin_tx();
    let state = graph.write()?;
    let store = state.store();
    let (lo, hi) = (heads.blob_from(), heads.blob_to());
    if store.write_head() != store.read_head() || hi != store.read_head() {
        return Err(StrataError::HeadsMismatch(format!(
            "heads end at {hi}; read head {} write head {}",
            store.read_head(),
            store.write_head()
        )));
    }
    if lo < BlobIndex::ROOT || lo > hi {
        return Err(StrataError::HeadsMismatch(format!("heads start at {lo}")));
    }
    if lo < hi && store.indices(BlobIndex::ROOT, hi)?.binary_search(&lo).is_err() {
        return Err(StrataError::HeadsMismatch(format!("{lo} is not a record boundary")));
    }
    check_continuations(&state, lo, hi)?;

    let mut blocks = vec![store.bytes(lo, hi)?.to_vec()];
    let mut ranges = Vec::new();
    for head in &heads.caches {
        if head.from > 0 && head.from >= head.to {
            continue;
        }
        let cache = state.caches().get(head.name);
        if cache.revision() != head.revision {
            return Err(StrataError::HeadsMismatch(format!(
                "cache {} moved from revision {} to {}",
                head.name,
                head.revision,
                cache.revision()
            )));
        }
        blocks.push(cache.diff(head.from as usize, head.to as usize)?);
        ranges.push(CacheRange {
            name: head.name,
            index_lo: head.from,
            index_hi: head.to,
            revision: head.revision,
        });
    }
    let meta = PayloadMeta {
        blob_index_lo: lo.0,
        blob_index_hi: hi.0,
        graph_uid: state.uid.to_string(),
        index_of_latest_complete_tx_node: state.latest_complete_tx.0,
        hash_full_graph: graph_hash(store, hi, target)?,
        data_layout_version: LayoutVersion::CURRENT,
        caches: ranges,
    };
    drop(state);
    let payload = convert_payload(UpdatePayload { meta, blocks }, target)?;
    info!(
        lo = lo.0,
        hi = hi.0,
        caches = payload.meta.caches.len(),
        layout = %target,
        "sync.payload.serialized"
    );
    Ok(payload)
}

/// Every back reference owed to a holder below `lo` must sit in a segment the
/// receiver will have: one below `hi`.
fn check_continuations(state: &GraphState, lo: BlobIndex, hi: BlobIndex) -> Result<()> {
    let store = state.store();
    for index in store.indices(lo, hi)? {
        let Some((source, target)) = store.blob(index)?.source_target() else {
            continue;
        };
        for (holder, signed) in [(source, index.0), (target, -index.0)] {
            if holder >= lo {
                continue;
            }
            let mut home = None;
            for seg in edges::segments(store, holder)? {
                if seg.refs(store)?.contains(&signed) {
                    home = Some(seg.index);
                    break;
                }
            }
            match home {
                None => {
                    return Err(StrataError::StructuralViolation {
                        index: holder,
                        reason: format!("missing back reference {signed}"),
                    })
                }
                Some(seg) if seg >= hi => {
                    return Err(StrataError::HeadsMismatch(format!(
                        "continuation {seg} of blob {holder} lies beyond {hi}"
                    )))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Applies a payload produced by [`serialize`] on another replica.
///
/// A payload already fully present is ignored once its records are confirmed to
/// match the local ones. Any failure puts the graph back exactly as it was and
/// nothing from the payload becomes visible to readers.
pub fn apply_payload(graph: &Graph, payload: UpdatePayload) -> Result<()> {
    let _tx = graph.begin_tx();
    let declared = payload.meta.data_layout_version;
    let payload = convert_payload(payload, LayoutVersion::CURRENT)?;
    payload.validate()?;
    let (lo, hi) = (payload.lo(), payload.hi());
    let checkpoint = {
        let mut state = graph.write()?;
        let head = state.store.write_head();
        if state.open_tx.is_some() || head != state.store.read_head() {
            return Err(StrataError::HeadsMismatch("local writes are not published".into()));
        }
        if hi <= head && lo < head {
            confirm_duplicate(&state, &payload, declared)?;
            warn!(lo = lo.0, hi = hi.0, write_head = head.0, "sync.payload.duplicate");
            return Ok(());
        }
        if lo != head {
            return Err(StrataError::HeadsMismatch(format!(
                "payload starts at {lo}, write head is {head}"
            )));
        }
        if lo > BlobIndex::ROOT && payload.meta.graph_uid != state.uid.to_string() {
            return Err(StrataError::HeadsMismatch(format!(
                "payload belongs to graph {}",
                payload.meta.graph_uid
            )));
        }
        for range in &payload.meta.caches {
            let cache = state.caches.get(range.name);
            if range.index_lo != 0 && (range.index_lo != cache.len() as u64 || range.revision != cache.revision()) {
                return Err(StrataError::HeadsMismatch(format!(
                    "cache {} diff starts at {} revision {}, local has {} at revision {}",
                    range.name,
                    range.index_lo,
                    range.revision,
                    cache.len(),
                    cache.revision()
                )));
            }
        }

        let checkpoint = Checkpoint::take(&mut state);
        let applied = apply_blocks(&mut state, &payload, declared).and_then(|()| {
            if hi > BlobIndex::ROOT {
                state.recompute_latest_complete_tx()?;
            }
            Ok(())
        });
        if let Err(err) = applied {
            checkpoint.restore(&mut state, lo)?;
            return Err(err);
        }
        checkpoint
    };
    if graph.options().verify_on_apply {
        if let Err(err) = crate::admin::ensure_valid(graph) {
            checkpoint.restore(&mut *graph.write()?, lo)?;
            return Err(err);
        }
    }

    let mut state = graph.write()?;
    state.store.commit_undo();
    if state.latest_complete_tx.0 != payload.meta.index_of_latest_complete_tx_node {
        warn!(
            local = state.latest_complete_tx.0,
            sender = payload.meta.index_of_latest_complete_tx_node,
            "sync.payload.latest_tx_differs"
        );
    }
    state.store.publish();
    state.store.set_sync_head(hi);
    for name in CacheName::ALL {
        let cache = state.caches.get_mut(name);
        let len = cache.len();
        cache.mark_synced(len);
    }
    info!(lo = lo.0, hi = hi.0, layout = %declared, "sync.payload.applied");
    Ok(())
}

/// Local state a payload may change before it is accepted.
struct Checkpoint {
    caches: CacheSet,
    uid: BaseUid,
    latest_complete_tx: BlobIndex,
}

impl Checkpoint {
    fn take(state: &mut GraphState) -> Checkpoint {
        state.store.begin_undo();
        Checkpoint {
            caches: state.caches.clone(),
            uid: state.uid,
            latest_complete_tx: state.latest_complete_tx,
        }
    }

    fn restore(self, state: &mut GraphState, lo: BlobIndex) -> Result<()> {
        if let Err(err) = state.store.undo() {
            error!(error = %err, lo = lo.0, "sync.payload.undo_failed");
            return Err(err);
        }
        state.caches = self.caches;
        state.uid = self.uid;
        state.latest_complete_tx = self.latest_complete_tx;
        state.delegates.clear();
        debug!(lo = lo.0, "sync.payload.discarded");
        Ok(())
    }
}

/// Checks that a payload covering records already present agrees with them.
///
/// Edge lists and termination slices below the write head may have changed since
/// the payload was cut, so those fields are left out of the comparison; when the
/// payload ends at the write head the full-graph hash must match as well.
fn confirm_duplicate(state: &GraphState, payload: &UpdatePayload, declared: LayoutVersion) -> Result<()> {
    let (lo, hi) = (payload.lo(), payload.hi());
    let local = settled(state.store.bytes(lo, hi)?);
    let sent = settled(&payload.blocks[0]);
    let same = match (local, sent) {
        (Ok(local), Ok(sent)) => local == sent,
        _ => false,
    };
    if !same {
        return Err(StrataError::HeadsMismatch(format!(
            "payload records [{lo}, {hi}) differ from the local ones"
        )));
    }
    if hi == state.store.write_head() {
        let hash = graph_hash(&state.store, hi, declared)?;
        if hash != payload.meta.hash_full_graph {
            return Err(StrataError::Corruption(format!(
                "graph hash {hash:016x} does not match payload hash {:016x}",
                payload.meta.hash_full_graph
            )));
        }
    }
    Ok(())
}

/// Record bytes with the fields replay rewrites in place zeroed: edge-list tails,
/// slots and continuations, and termination slices.
fn settled(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = bytes.to_vec();
    let records = walk_records(bytes)?;
    for (i, (off, ty)) in records.iter().enumerate() {
        let end = records.get(i + 1).map_or(out.len(), |(next, _)| *next);
        let record = &mut out[*off..end];
        if let Some(at) = ty.termination_at() {
            be::put_i32(record, at, 0)?;
        }
        if let Some(at) = ty.edge_segment_at() {
            let raw = be::get_i32(record, at)?;
            let len = record.len();
            let segment_end = usize::try_from(raw)
                .ok()
                .map(|capacity| at + segment_len(capacity))
                .filter(|segment_end| *segment_end <= len)
                .ok_or_else(|| StrataError::Corruption(format!("edge capacity {raw} at byte {off}")))?;
            record[at + 4..segment_end].fill(0);
        }
    }
    Ok(out)
}

fn apply_blocks(state: &mut GraphState, payload: &UpdatePayload, declared: LayoutVersion) -> Result<()> {
    let (lo, hi) = (payload.lo(), payload.hi());
    let fill_caches = payload.meta.caches.is_empty();
    state.include_new_blobs(lo, hi, &payload.blocks[0], fill_caches)?;
    for (range, block) in payload.meta.caches.iter().zip(&payload.blocks[1..]) {
        let cache = state.caches.get_mut(range.name);
        if range.index_lo == 0 {
            cache.reset(range.revision);
        }
        cache.apply_diff(block)?;
        if cache.len() as u64 != range.index_hi {
            return Err(StrataError::Corruption(format!(
                "cache {} holds {} entries after diff, expected {}",
                range.name,
                cache.len(),
                range.index_hi
            )));
        }
    }
    if hi == BlobIndex::ROOT {
        return Ok(());
    }
    if lo == BlobIndex::ROOT {
        let Blob::Root(root) = state.store.blob(BlobIndex::ROOT)? else {
            return Err(StrataError::Corruption("payload does not start with a root record".into()));
        };
        state.uid = root.uid;
    }
    if state.uid.to_string() != payload.meta.graph_uid {
        return Err(StrataError::Corruption(format!(
            "root uid {} does not match payload uid {}",
            state.uid, payload.meta.graph_uid
        )));
    }
    let hash = graph_hash(&state.store, hi, declared)?;
    if hash != payload.meta.hash_full_graph {
        return Err(StrataError::Corruption(format!(
            "graph hash {hash:016x} does not match payload hash {:016x}",
            payload.meta.hash_full_graph
        )));
    }
    Ok(())
}
