use tracing::debug;

use crate::primitives::arena::Arena;
use crate::primitives::bytes::be;
use crate::storage::blob::Blob;
use crate::storage::layout::{self, BlobType};
use crate::types::{BlobIndex, Result, StrataError, TimeSlice, BLOB_INDEX_STEP};

/// Arena plus the three heads that partition it.
///
/// `write_head >= read_head >= sync_head` holds at all times. Every index handed out
/// by the store is checked against `[ROOT, write_head)` before it is dereferenced.
pub struct BlobStore {
    arena: Box<dyn Arena>,
    write_head: BlobIndex,
    read_head: BlobIndex,
    sync_head: BlobIndex,
    undo: Option<UndoLog>,
}

/// Prior values of the in-place writes made below `floor`, oldest first.
struct UndoLog {
    floor: BlobIndex,
    writes: Vec<(usize, i32)>,
}

impl BlobStore {
    /// A store over an empty arena.
    pub fn new(arena: Box<dyn Arena>) -> Self {
        Self {
            arena,
            write_head: BlobIndex::ROOT,
            read_head: BlobIndex::ROOT,
            sync_head: BlobIndex::ROOT,
            undo: None,
        }
    }

    /// End of the written records.
    pub fn write_head(&self) -> BlobIndex {
        self.write_head
    }

    /// End of the records readers may see.
    pub fn read_head(&self) -> BlobIndex {
        self.read_head
    }

    /// End of the records already shipped.
    pub fn sync_head(&self) -> BlobIndex {
        self.sync_head
    }

    /// Makes everything written so far visible to readers.
    pub fn publish(&mut self) {
        self.read_head = self.write_head;
    }

    pub(crate) fn set_sync_head(&mut self, head: BlobIndex) {
        self.sync_head = head.min(self.read_head);
    }

    /// Backing arena.
    pub fn arena(&self) -> &dyn Arena {
        self.arena.as_ref()
    }

    /// Lets the arena drop pages below the sync head.
    pub fn page_out(&mut self) {
        let boundary = self.sync_head.offset();
        self.arena.page_out(boundary);
    }

    /// Fails unless `index` lies in `[ROOT, write_head)`.
    pub fn check_index(&self, index: BlobIndex) -> Result<()> {
        if index < BlobIndex::ROOT || index >= self.write_head {
            return Err(StrataError::RangeError {
                index,
                lo: BlobIndex::ROOT,
                hi: self.write_head,
            });
        }
        Ok(())
    }

    /// Size in bytes of the record at `index`.
    pub fn record_len(&self, index: BlobIndex) -> Result<usize> {
        self.check_index(index)?;
        let head = self.arena.read(index.offset(), BLOB_INDEX_STEP)?;
        layout::record_size(head)
    }

    /// Raw bytes of the record at `index`.
    pub fn record_bytes(&self, index: BlobIndex) -> Result<&[u8]> {
        let len = self.record_len(index)?;
        self.arena.read(index.offset(), len)
    }

    /// Decodes the record at `index`.
    pub fn blob(&self, index: BlobIndex) -> Result<Blob> {
        Blob::decode(self.record_bytes(index)?)
    }

    /// Type of the record at `index` without decoding it.
    pub fn blob_type(&self, index: BlobIndex) -> Result<BlobType> {
        self.check_index(index)?;
        let tag = self.arena.read(index.offset(), 1)?[0];
        BlobType::from_tag(tag)
            .ok_or_else(|| StrataError::Corruption(format!("unknown tag {tag} at blob {index}")))
    }

    /// Index directly after the record at `index`.
    pub fn next_index(&self, index: BlobIndex) -> Result<BlobIndex> {
        let steps = self.record_len(index)? / BLOB_INDEX_STEP;
        Ok(index.advance(steps as i32))
    }

    /// Indices of all records in `[lo, hi)`.
    pub fn indices(&self, lo: BlobIndex, hi: BlobIndex) -> Result<Vec<BlobIndex>> {
        let mut out = Vec::new();
        let mut cur = lo;
        while cur < hi {
            out.push(cur);
            cur = self.next_index(cur)?;
        }
        if cur != hi {
            return Err(StrataError::Corruption(format!(
                "record walk overran range end {hi} at {cur}"
            )));
        }
        Ok(out)
    }

    /// Encodes `blob` at `write_head` and advances it.
    pub fn append_blob(&mut self, blob: &Blob) -> Result<BlobIndex> {
        let index = self.write_head;
        let len = blob.encoded_len();
        self.arena.ensure_capacity(index.offset(), len)?;
        let dst = self.arena.write(index.offset(), len)?;
        dst.fill(0);
        blob.encode_into(dst)?;
        self.write_head = index.advance((len / BLOB_INDEX_STEP) as i32);
        debug!(index = index.0, kind = blob.blob_type().name(), "store.append");
        Ok(index)
    }

    /// Big-endian `i32` at byte `at` of the record at `index`.
    pub fn read_i32(&self, index: BlobIndex, at: usize) -> Result<i32> {
        self.check_index(index)?;
        be::get_i32(self.arena.read(index.offset() + at, 4)?, 0)
    }

    /// Overwrites the `i32` at byte `at` of the record at `index`.
    pub fn write_i32(&mut self, index: BlobIndex, at: usize, value: i32) -> Result<()> {
        self.check_index(index)?;
        let offset = index.offset() + at;
        if let Some(log) = self.undo.as_mut().filter(|log| index < log.floor) {
            log.writes.push((offset, be::get_i32(self.arena.read(offset, 4)?, 0)?));
        }
        be::put_i32(self.arena.write(offset, 4)?, 0, value)
    }

    /// Starts logging in-place writes to records below the current write head.
    pub(crate) fn begin_undo(&mut self) {
        self.undo = Some(UndoLog {
            floor: self.write_head,
            writes: Vec::new(),
        });
    }

    /// Keeps everything written since [`BlobStore::begin_undo`].
    pub(crate) fn commit_undo(&mut self) {
        self.undo = None;
    }

    /// Puts back the logged in-place writes and drops the records appended since
    /// [`BlobStore::begin_undo`]. Nothing is decoded, so bytes that never made it
    /// through validation are discarded as they are.
    pub(crate) fn undo(&mut self) -> Result<()> {
        let Some(log) = self.undo.take() else {
            return Ok(());
        };
        let end = self.write_head;
        self.write_head = log.floor.min(end);
        self.read_head = self.read_head.min(self.write_head);
        self.sync_head = self.sync_head.min(self.write_head);
        for (offset, before) in log.writes.into_iter().rev() {
            be::put_i32(self.arena.write(offset, 4)?, 0, before)?;
        }
        let len = end.offset() - self.write_head.offset();
        self.arena.write(self.write_head.offset(), len)?.fill(0);
        Ok(())
    }

    /// Bytes of `[lo, hi)`.
    pub fn bytes(&self, lo: BlobIndex, hi: BlobIndex) -> Result<&[u8]> {
        if lo > hi || hi > self.write_head {
            return Err(StrataError::RangeError {
                index: hi,
                lo: BlobIndex::ROOT,
                hi: self.write_head,
            });
        }
        self.arena.read(lo.offset(), hi.offset() - lo.offset())
    }

    /// Copies raw record bytes to `write_head` and moves the head past them.
    pub fn extend_raw(&mut self, bytes: &[u8]) -> Result<BlobIndex> {
        if bytes.len() % BLOB_INDEX_STEP != 0 {
            return Err(StrataError::Corruption(format!(
                "blob block of {} bytes is not step aligned",
                bytes.len()
            )));
        }
        let lo = self.write_head;
        self.arena.ensure_capacity(lo.offset(), bytes.len())?;
        self.arena.write(lo.offset(), bytes.len())?.copy_from_slice(bytes);
        self.write_head = lo.advance((bytes.len() / BLOB_INDEX_STEP) as i32);
        Ok(self.write_head)
    }

    /// Zeroes `[k, write_head)` and moves every head down to at most `k`.
    pub fn truncate(&mut self, k: BlobIndex) -> Result<()> {
        if k < BlobIndex::ROOT || k > self.write_head {
            return Err(StrataError::RangeError {
                index: k,
                lo: BlobIndex::ROOT,
                hi: self.write_head,
            });
        }
        let len = self.write_head.offset() - k.offset();
        self.arena.write(k.offset(), len)?.fill(0);
        self.write_head = k;
        self.read_head = self.read_head.min(k);
        self.sync_head = self.sync_head.min(k);
        Ok(())
    }

    /// The one in-place change to an already written record: the termination slice
    /// of an instance.
    pub fn patch_termination(&mut self, index: BlobIndex, slice: TimeSlice) -> Result<()> {
        let ty = self.blob_type(index)?;
        let at = ty
            .termination_at()
            .ok_or_else(|| StrataError::type_mismatch(index, "instance record", ty.name()))?;
        self.write_i32(index, at, slice.0)
    }

    /// Finds the end of the records written into an adopted arena.
    pub(crate) fn discover_write_head(&mut self) -> Result<BlobIndex> {
        let mut cur = BlobIndex::ROOT;
        loop {
            let off = cur.offset();
            if off + BLOB_INDEX_STEP > self.arena.capacity() {
                break;
            }
            let head = self.arena.read(off, BLOB_INDEX_STEP)?;
            if head[0] == 0 {
                break;
            }
            let len = layout::record_size(head)?;
            if off + len > self.arena.capacity() {
                return Err(StrataError::Corruption(format!("record at {cur} overruns arena")));
            }
            cur = cur.advance((len / BLOB_INDEX_STEP) as i32);
        }
        self.write_head = cur;
        self.read_head = cur;
        Ok(cur)
    }
}
