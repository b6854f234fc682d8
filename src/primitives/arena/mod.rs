#![forbid(unsafe_code)]

use std::io::{self, ErrorKind};

use tracing::debug;

use crate::types::{BlobIndex, Result, StrataError, BLOB_INDEX_STEP};

/// Growable byte region backing a graph.
///
/// Callers only address the region by offset; nothing may hold on to slices across
/// a call to [`Arena::ensure_capacity`].
pub trait Arena: Send + Sync + 'static {
    /// Guarantees `[offset, offset + len)` is backed and zero-filled on first touch.
    fn ensure_capacity(&mut self, offset: usize, len: usize) -> Result<()>;
    /// Best-effort release of physical backing for bytes below `read_only_below`.
    /// Never changes logical content.
    fn page_out(&mut self, read_only_below: usize);
    /// Number of addressable bytes.
    fn capacity(&self) -> usize;
    /// Borrows `len` bytes at `offset`.
    fn read(&self, offset: usize, len: usize) -> Result<&[u8]>;
    /// Mutably borrows `len` bytes at `offset`.
    fn write(&mut self, offset: usize, len: usize) -> Result<&mut [u8]>;
}

/// Heap-backed arena.
#[derive(Debug)]
pub struct MemArena {
    bytes: Vec<u8>,
    growth_chunk: usize,
    max_capacity: usize,
    cold_bytes: usize,
}

impl MemArena {
    /// Creates an arena with `initial` bytes, growing in `growth_chunk` steps up to `max_capacity`.
    pub fn new(initial: usize, growth_chunk: usize, max_capacity: usize) -> Self {
        Self {
            bytes: vec![0; initial.min(max_capacity)],
            growth_chunk: growth_chunk.max(BLOB_INDEX_STEP),
            max_capacity,
            cold_bytes: 0,
        }
    }

    /// Adopts an existing image, for example one read back from disk.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            bytes,
            growth_chunk: 1 << 20,
            max_capacity: len.max(usize::MAX >> 1),
            cold_bytes: 0,
        }
    }

    /// Bytes reported as paged out by the last [`Arena::page_out`] call.
    pub fn cold_bytes(&self) -> usize {
        self.cold_bytes
    }

    fn out_of_range(&self, offset: usize) -> StrataError {
        let step = BLOB_INDEX_STEP;
        StrataError::RangeError {
            index: BlobIndex((offset / step) as i32),
            lo: BlobIndex(0),
            hi: BlobIndex((self.bytes.len() / step) as i32),
        }
    }
}

impl Arena for MemArena {
    fn ensure_capacity(&mut self, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.out_of_range(offset))?;
        if end <= self.bytes.len() {
            return Ok(());
        }
        let chunks = end.div_ceil(self.growth_chunk);
        let target = chunks.saturating_mul(self.growth_chunk).min(self.max_capacity);
        if target < end {
            return Err(StrataError::Io(io::Error::new(
                ErrorKind::OutOfMemory,
                format!("arena limit of {} bytes reached", self.max_capacity),
            )));
        }
        debug!(from = self.bytes.len(), to = target, "arena.grow");
        self.bytes.resize(target, 0);
        Ok(())
    }

    fn page_out(&mut self, read_only_below: usize) {
        self.cold_bytes = read_only_below.min(self.bytes.len());
        debug!(cold = self.cold_bytes, "arena.page_out");
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(&self.bytes[offset..end]),
            _ => Err(self.out_of_range(offset)),
        }
    }

    fn write(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(&mut self.bytes[offset..end]),
            _ => Err(self.out_of_range(offset)),
        }
    }
}
