//! Whole-graph snapshot files.
//!
//! A snapshot is a small member container: magic, member count, then for each
//! member a name and a length-prefixed body, closed by a crc32 of everything
//! before it. Two members are written: the graph uid and a full payload.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::primitives::bytes::buf::Cursor;
use crate::storage::{Graph, GraphOptions};
use crate::sync::exchange::{apply_payload, serialize};
use crate::sync::heads::full_graph_heads;
use crate::sync::layout::LayoutVersion;
use crate::sync::payload::UpdatePayload;
use crate::types::{BaseUid, BlobIndex, Checksum, Crc32Fast, Result, StrataError};

const SNAPSHOT_MAGIC: &[u8; 4] = b"STSN";
const UID_MEMBER: &str = "uid";
const PAYLOAD_MEMBER: &str = "graph.payload";

fn encode_container(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&(members.len() as u32).to_be_bytes());
    for (name, body) in members {
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(body.len() as u64).to_be_bytes());
        out.extend_from_slice(body);
    }
    let mut crc = Crc32Fast::default();
    crc.update(&out);
    out.extend_from_slice(&crc.finalize().to_be_bytes());
    out
}

fn decode_container(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let split = bytes
        .len()
        .checked_sub(4)
        .ok_or_else(|| StrataError::Corruption("snapshot too short".into()))?;
    let (body, trailer) = bytes.split_at(split);
    let mut crc = Crc32Fast::default();
    crc.update(body);
    let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc.finalize() != stored {
        return Err(StrataError::Corruption("snapshot checksum mismatch".into()));
    }

    let mut cur = Cursor::new(body);
    if cur.take(4)? != SNAPSHOT_MAGIC {
        return Err(StrataError::Corruption("snapshot magic".into()));
    }
    let count = cur.u32()? as usize;
    let mut members = Vec::with_capacity(count.min(8));
    for _ in 0..count {
        let len = cur.take(2)?;
        let name_len = u16::from_be_bytes([len[0], len[1]]) as usize;
        let name = std::str::from_utf8(cur.take(name_len)?)
            .map_err(|_| StrataError::Corruption("snapshot member name is not utf-8".into()))?
            .to_owned();
        let body_len = usize::try_from(cur.u64()?)
            .map_err(|_| StrataError::Corruption("snapshot member length overflow".into()))?;
        members.push((name, cur.take(body_len)?.to_vec()));
    }
    if !cur.is_empty() {
        return Err(StrataError::Corruption(format!("{} trailing snapshot bytes", cur.remaining())));
    }
    Ok(members)
}

fn member<'a>(members: &'a [(String, Vec<u8>)], name: &str) -> Result<&'a [u8]> {
    members
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, body)| body.as_slice())
        .ok_or_else(|| StrataError::Corruption(format!("snapshot has no {name:?} member")))
}

/// Writes every published record and cache of `graph` to `path`.
pub fn save_snapshot(graph: &Graph, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let heads = full_graph_heads(graph)?;
    let payload = serialize(graph, &heads, LayoutVersion::CURRENT)?;
    let bytes = encode_container(&[
        (UID_MEMBER, graph.uid().0.to_vec()),
        (PAYLOAD_MEMBER, payload.encode()?),
    ]);
    fs::write(path, &bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), hi = payload.hi().0, "sync.snapshot.saved");
    Ok(())
}

/// Rebuilds a graph from a file written by [`save_snapshot`].
pub fn load_snapshot(path: impl AsRef<Path>, options: GraphOptions) -> Result<Graph> {
    let path = path.as_ref();
    let members = decode_container(&fs::read(path)?)?;
    let uid: [u8; 16] = member(&members, UID_MEMBER)?
        .try_into()
        .map_err(|_| StrataError::Corruption("snapshot uid must be 16 bytes".into()))?;
    let payload = UpdatePayload::decode(member(&members, PAYLOAD_MEMBER)?)?;
    if payload.lo() != BlobIndex::ROOT {
        return Err(StrataError::Corruption(format!(
            "snapshot payload starts at {}",
            payload.lo()
        )));
    }
    let graph = Graph::empty(options)?;
    apply_payload(&graph, payload)?;
    if graph.uid() != BaseUid(uid) {
        return Err(StrataError::Corruption(format!(
            "snapshot uid {} does not match graph uid {}",
            BaseUid(uid),
            graph.uid()
        )));
    }
    info!(path = %path.display(), write_head = graph.write_head().0, "sync.snapshot.loaded");
    Ok(graph)
}
