use serde::{Deserialize, Serialize};

use crate::primitives::bytes::buf::Cursor;
use crate::storage::caches::CacheName;
use crate::storage::store::BlobStore;
use crate::sync::layout::{rewrite_root_version, LayoutVersion};
use crate::types::{blob_range_hash, BlobIndex, Checksum, Result, StrataError, Xxh64, BLOB_INDEX_STEP};

const PAYLOAD_MAGIC: &[u8; 4] = b"STUP";

/// Entries `[index_lo, index_hi)` of one cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRange {
    /// Cache the diff applies to.
    pub name: CacheName,
    /// Index of the first entry carried.
    pub index_lo: u64,
    /// Index just past the last entry carried.
    pub index_hi: u64,
    /// Cache revision the entries were taken at.
    pub revision: u64,
}

/// Metadata describing the blocks of an [`UpdatePayload`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMeta {
    /// First blob index carried.
    pub blob_index_lo: i32,
    /// Index just past the last blob carried.
    pub blob_index_hi: i32,
    /// Hex rendering of the graph uid.
    pub graph_uid: String,
    /// Latest complete tx marker of the sender.
    pub index_of_latest_complete_tx_node: i32,
    /// xxh64 of `[ROOT, blob_index_hi)` as the sender had it, with the root's
    /// version field set to `data_layout_version`.
    pub hash_full_graph: u64,
    /// Layout the blocks are written in.
    pub data_layout_version: LayoutVersion,
    /// One entry per cache block, in block order.
    pub caches: Vec<CacheRange>,
}

/// Metadata plus byte blocks: blob bytes first, then one diff per listed cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePayload {
    /// Ranges and checks for the blocks.
    pub meta: PayloadMeta,
    /// Blob bytes, then one diff per entry of `meta.caches`.
    pub blocks: Vec<Vec<u8>>,
}

impl UpdatePayload {
    /// First blob index carried.
    pub fn lo(&self) -> BlobIndex {
        BlobIndex(self.meta.blob_index_lo)
    }

    /// Blob index just past the last one carried.
    pub fn hi(&self) -> BlobIndex {
        BlobIndex(self.meta.blob_index_hi)
    }

    /// Whether the payload carries neither blobs nor cache entries.
    pub fn is_empty(&self) -> bool {
        self.lo() == self.hi() && self.meta.caches.iter().all(|c| c.index_lo == c.index_hi)
    }

    /// Checks the block count and blob block length against the metadata.
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = (self.lo(), self.hi());
        if lo < BlobIndex::ROOT || hi < lo {
            return Err(StrataError::Corruption(format!("payload range [{lo}, {hi})")));
        }
        if self.blocks.len() != 1 + self.meta.caches.len() {
            return Err(StrataError::Corruption(format!(
                "{} blocks for {} caches",
                self.blocks.len(),
                self.meta.caches.len()
            )));
        }
        let expected = (hi.0 - lo.0) as usize * BLOB_INDEX_STEP;
        if self.blocks[0].len() != expected {
            return Err(StrataError::Corruption(format!(
                "blob block holds {} bytes, range needs {expected}",
                self.blocks[0].len()
            )));
        }
        Ok(())
    }

    /// Wire form: magic, big-endian metadata length, JSON metadata, block count and
    /// length-prefixed blocks.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let meta = serde_json::to_vec(&self.meta)?;
        let body: usize = self.blocks.iter().map(|b| 8 + b.len()).sum();
        let mut out = Vec::with_capacity(12 + meta.len() + body);
        out.extend_from_slice(PAYLOAD_MAGIC);
        out.extend_from_slice(&(meta.len() as u32).to_be_bytes());
        out.extend_from_slice(&meta);
        out.extend_from_slice(&(self.blocks.len() as u32).to_be_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&(block.len() as u64).to_be_bytes());
            out.extend_from_slice(block);
        }
        Ok(out)
    }

    /// Inverse of [`UpdatePayload::encode`].
    pub fn decode(bytes: &[u8]) -> Result<UpdatePayload> {
        let mut cur = Cursor::new(bytes);
        if cur.take(4)? != PAYLOAD_MAGIC {
            return Err(StrataError::Corruption("payload magic".into()));
        }
        let meta_len = cur.u32()? as usize;
        let meta: PayloadMeta = serde_json::from_slice(cur.take(meta_len)?)?;
        let count = cur.u32()? as usize;
        let mut blocks = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let len = usize::try_from(cur.u64()?)
                .map_err(|_| StrataError::Corruption("block length overflow".into()))?;
            blocks.push(cur.take(len)?.to_vec());
        }
        if !cur.is_empty() {
            return Err(StrataError::Corruption(format!("{} trailing payload bytes", cur.remaining())));
        }
        Ok(UpdatePayload { meta, blocks })
    }
}

/// xxh64 over `[ROOT, hi)` with the root's version field read as `declared`.
pub(crate) fn graph_hash(store: &BlobStore, hi: BlobIndex, declared: LayoutVersion) -> Result<u64> {
    if hi <= BlobIndex::ROOT {
        return Ok(blob_range_hash(&[]));
    }
    let root_end = store.next_index(BlobIndex::ROOT)?;
    let mut root = store.bytes(BlobIndex::ROOT, root_end)?.to_vec();
    rewrite_root_version(&mut root, declared)?;
    let mut hasher = Xxh64::default();
    hasher.update(&root);
    hasher.update(store.bytes(root_end, hi)?);
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UpdatePayload {
        UpdatePayload {
            meta: PayloadMeta {
                blob_index_lo: 42,
                blob_index_hi: 43,
                graph_uid: "00".repeat(16),
                index_of_latest_complete_tx_node: 42,
                hash_full_graph: 7,
                data_layout_version: LayoutVersion::CURRENT,
                caches: vec![CacheRange {
                    name: CacheName::UidLookup,
                    index_lo: 0,
                    index_hi: 0,
                    revision: 3,
                }],
            },
            blocks: vec![vec![0u8; 16], vec![0u8]],
        }
    }

    #[test]
    fn wire_form_decodes() -> Result<()> {
        let payload = sample();
        payload.validate()?;
        let decoded = UpdatePayload::decode(&payload.encode()?)?;
        assert_eq!(decoded, payload);
        assert!(UpdatePayload::decode(b"NOPE").is_err());
        Ok(())
    }

    #[test]
    fn validate_checks_block_sizes() {
        let mut payload = sample();
        payload.blocks[0].push(0);
        assert!(matches!(payload.validate(), Err(StrataError::Corruption(_))));
        payload.blocks.pop();
        assert!(payload.validate().is_err());
    }
}
