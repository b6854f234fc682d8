//! Data layout versions and the table of payload conversions between them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::primitives::bytes::be;
use crate::storage::caches::CacheName;
use crate::storage::layout::{self as blob_layout, BlobType, ROOT_VERSION_AT, ROOT_VERSION_LEN_AT, ROOT_VERSION_MAX};
use crate::sync::payload::UpdatePayload;
use crate::types::{BlobIndex, Result, StrataError, BLOB_INDEX_STEP};

/// Version of the record layout a graph or payload is written in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayoutVersion {
    /// No value nodes, no av-hash cache.
    #[serde(rename = "0.2.0")]
    V0_2_0,
    /// Current layout.
    #[serde(rename = "0.3.0")]
    V0_3_0,
}

impl LayoutVersion {
    /// Layout this build writes.
    pub const CURRENT: LayoutVersion = LayoutVersion::V0_3_0;
    /// Every known layout, oldest first.
    pub const ALL: [LayoutVersion; 2] = [LayoutVersion::V0_2_0, LayoutVersion::V0_3_0];

    /// Version text as stored in the root record.
    pub fn as_str(self) -> &'static str {
        match self {
            LayoutVersion::V0_2_0 => "0.2.0",
            LayoutVersion::V0_3_0 => "0.3.0",
        }
    }

    /// Inverse of [`LayoutVersion::as_str`].
    pub fn parse(text: &str) -> Result<LayoutVersion> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == text)
            .ok_or_else(|| StrataError::LayoutMismatch(format!("unknown data layout version {text:?}")))
    }

    /// Whether value nodes and attribute value assignments exist.
    pub fn has_value_nodes(self) -> bool {
        self >= LayoutVersion::V0_3_0
    }
}

impl fmt::Display for LayoutVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Conversion {
    from: LayoutVersion,
    to: LayoutVersion,
    convert: fn(&mut UpdatePayload) -> Result<()>,
}

const CONVERSIONS: &[Conversion] = &[
    Conversion {
        from: LayoutVersion::V0_3_0,
        to: LayoutVersion::V0_2_0,
        convert: downgrade_to_0_2_0,
    },
    Conversion {
        from: LayoutVersion::V0_2_0,
        to: LayoutVersion::V0_3_0,
        convert: upgrade_to_0_3_0,
    },
];

/// Rewrites `payload` step by step until it declares `target`.
pub fn convert_payload(mut payload: UpdatePayload, target: LayoutVersion) -> Result<UpdatePayload> {
    let mut steps = 0;
    while payload.meta.data_layout_version != target {
        let from = payload.meta.data_layout_version;
        let toward = |to: LayoutVersion| (from < target && to > from && to <= target) || (from > target && to < from && to >= target);
        let step = CONVERSIONS
            .iter()
            .find(|c| c.from == from && c.to == target)
            .or_else(|| CONVERSIONS.iter().find(|c| c.from == from && toward(c.to)))
            .ok_or_else(|| StrataError::LayoutMismatch(format!("no conversion from {from} to {target}")))?;
        (step.convert)(&mut payload)?;
        payload.meta.data_layout_version = step.to;
        debug!(from = %step.from, to = %step.to, "sync.layout.converted");
        steps += 1;
        if steps > CONVERSIONS.len() {
            return Err(StrataError::LayoutMismatch(format!("conversion from {from} to {target} does not converge")));
        }
    }
    Ok(payload)
}

/// Offset and type of every record in a block of raw record bytes.
pub(crate) fn walk_records(bytes: &[u8]) -> Result<Vec<(usize, BlobType)>> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < bytes.len() {
        let head = bytes
            .get(off..off + BLOB_INDEX_STEP)
            .ok_or_else(|| StrataError::Corruption(format!("truncated record at byte {off}")))?;
        let ty = BlobType::from_tag(head[0])
            .ok_or_else(|| StrataError::Corruption(format!("unknown record tag {} at byte {off}", head[0])))?;
        out.push((off, ty));
        off += blob_layout::record_size(head)?;
    }
    if off != bytes.len() {
        return Err(StrataError::Corruption("last record overruns its block".into()));
    }
    Ok(out)
}

/// Overwrites the layout version field of a root record.
pub(crate) fn rewrite_root_version(record: &mut [u8], version: LayoutVersion) -> Result<()> {
    if record.first().copied() != Some(BlobType::Root.tag()) {
        return Err(StrataError::Corruption("expected a root record".into()));
    }
    let text = version.as_str().as_bytes();
    let field = record
        .get_mut(ROOT_VERSION_AT..ROOT_VERSION_AT + ROOT_VERSION_MAX)
        .ok_or_else(|| StrataError::Corruption("root record too short".into()))?;
    field.fill(0);
    field[..text.len()].copy_from_slice(text);
    be::put_u16(record, ROOT_VERSION_LEN_AT, text.len() as u16)
}

fn rewrite_root_in_payload(payload: &mut UpdatePayload, version: LayoutVersion) -> Result<()> {
    if payload.lo() != BlobIndex::ROOT {
        return Ok(());
    }
    let block = payload
        .blocks
        .first_mut()
        .ok_or_else(|| StrataError::Corruption("payload carries no blob block".into()))?;
    if block.is_empty() {
        return Ok(());
    }
    rewrite_root_version(block, version)
}

fn downgrade_to_0_2_0(payload: &mut UpdatePayload) -> Result<()> {
    let block = payload
        .blocks
        .first()
        .ok_or_else(|| StrataError::Corruption("payload carries no blob block".into()))?;
    for (off, ty) in walk_records(block)? {
        if matches!(ty, BlobType::Value | BlobType::AttributeValueAssignment) {
            return Err(StrataError::LayoutMismatch(format!(
                "{} at byte {off} has no 0.2.0 form",
                ty.name()
            )));
        }
    }
    if let Some(pos) = payload
        .meta
        .caches
        .iter()
        .position(|c| c.name == CacheName::AvHashLookup)
    {
        if payload.meta.caches[pos].index_hi > 0 {
            return Err(StrataError::LayoutMismatch("av-hash cache is not empty".into()));
        }
        payload.meta.caches.remove(pos);
        payload.blocks.remove(pos + 1);
    }
    rewrite_root_in_payload(payload, LayoutVersion::V0_2_0)
}

fn upgrade_to_0_3_0(payload: &mut UpdatePayload) -> Result<()> {
    rewrite_root_in_payload(payload, LayoutVersion::V0_3_0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_and_order() -> Result<()> {
        assert_eq!(LayoutVersion::parse("0.2.0")?, LayoutVersion::V0_2_0);
        assert!(LayoutVersion::CURRENT.has_value_nodes());
        assert!(!LayoutVersion::V0_2_0.has_value_nodes());
        assert!(matches!(LayoutVersion::parse("9.9"), Err(StrataError::LayoutMismatch(_))));
        assert_eq!(serde_json::to_string(&LayoutVersion::V0_3_0)?, "\"0.3.0\"");
        Ok(())
    }

    #[test]
    fn walk_rejects_unknown_tags() {
        let mut bytes = vec![0u8; 32];
        bytes[0] = 200;
        assert!(walk_records(&bytes).is_err());
        assert!(walk_records(&[]).is_ok_and(|v| v.is_empty()));
    }
}
