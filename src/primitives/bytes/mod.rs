#![forbid(unsafe_code)]
#![allow(missing_docs)]
//! Big-endian field access, varints and a checked cursor shared by the record and
//! payload codecs.

pub mod be {
    //! Fixed-width big-endian fields inside record bytes.

    use crate::types::{Result, StrataError};

    fn field<const N: usize>(src: &[u8], at: usize) -> Result<[u8; N]> {
        src.get(at..at + N)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                StrataError::Corruption(format!(
                    "field of {N} bytes at {at} beyond record of {} bytes",
                    src.len()
                ))
            })
    }

    fn slot<const N: usize>(dst: &mut [u8], at: usize) -> Result<&mut [u8]> {
        let len = dst.len();
        dst.get_mut(at..at + N).ok_or_else(|| {
            StrataError::Corruption(format!("field of {N} bytes at {at} beyond record of {len} bytes"))
        })
    }

    /// Reads a big-endian `i32` at `at`.
    pub fn get_i32(src: &[u8], at: usize) -> Result<i32> {
        Ok(i32::from_be_bytes(field(src, at)?))
    }

    /// Writes a big-endian `i32` at `at`.
    pub fn put_i32(dst: &mut [u8], at: usize, v: i32) -> Result<()> {
        slot::<4>(dst, at)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn get_u32(src: &[u8], at: usize) -> Result<u32> {
        Ok(u32::from_be_bytes(field(src, at)?))
    }

    pub fn put_u32(dst: &mut [u8], at: usize, v: u32) -> Result<()> {
        slot::<4>(dst, at)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn get_u16(src: &[u8], at: usize) -> Result<u16> {
        Ok(u16::from_be_bytes(field(src, at)?))
    }

    pub fn put_u16(dst: &mut [u8], at: usize, v: u16) -> Result<()> {
        slot::<2>(dst, at)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn get_i64(src: &[u8], at: usize) -> Result<i64> {
        Ok(i64::from_be_bytes(field(src, at)?))
    }

    pub fn put_i64(dst: &mut [u8], at: usize, v: i64) -> Result<()> {
        slot::<8>(dst, at)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Reads 16 raw bytes (uids).
    pub fn get_16(src: &[u8], at: usize) -> Result<[u8; 16]> {
        field(src, at)
    }

    pub fn put_16(dst: &mut [u8], at: usize, v: &[u8; 16]) -> Result<()> {
        slot::<16>(dst, at)?.copy_from_slice(v);
        Ok(())
    }
}

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use crate::types::{Result, StrataError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            } else {
                out.push(byte | 0x80);
            }
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or_else(|| StrataError::Corruption(format!("varint truncated at byte {i}")))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(StrataError::Corruption("varint overflows 64 bits".into()));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StrataError::Corruption("varint longer than 10 bytes".into()))
    }

    /// Encodes an i64 as a ZigZag-encoded varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        let zigzag = ((v << 1) ^ (v >> 63)) as u64;
        encode_u64(zigzag, out);
    }

    /// Decodes a ZigZag-encoded i64 varint from a slice, updating the offset.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }
}

pub mod buf {
    //! A slice-backed cursor that reports overreads as corruption.

    use core::fmt;

    use crate::types::{Result, StrataError};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes from the cursor, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or_else(|| {
                    StrataError::Corruption(format!(
                        "cursor take beyond buffer: need {n}, remaining {}",
                        self.remaining()
                    ))
                })?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        pub fn u32(&mut self) -> Result<u32> {
            let raw = self.take(4)?;
            Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }

        pub fn u64(&mut self) -> Result<u64> {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(bytes))
        }

        pub fn varint(&mut self) -> Result<u64> {
            super::var::decode_u64(self.buf, &mut self.off)
        }

        pub fn varint_i64(&mut self) -> Result<i64> {
            super::var::decode_i64(self.buf, &mut self.off)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        pub fn is_empty(&self) -> bool {
            self.remaining() == 0
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
