//! Bounded cursor over in-memory section bytes.
//!
//! All multi-byte reads are native-endian: section loading has already
//! verified that the file's data encoding matches the host. The cursor is
//! public so that a caller materializing a DIE from the raw section bytes
//! (see [`crate::DwarfIndex::sections`]) can decode it with the same
//! primitives the index uses.

use crate::Error;

/// A cursor over a byte slice that fails with [`Error::Eof`] instead of
/// running off the end.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Starts reading at `pos` rather than at the beginning of the slice.
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Reader { buf, pos }
    }

    /// Current byte offset within the underlying slice.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let byte = *self.buf.get(self.pos).ok_or(Error::Eof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_ne_bytes(self.take()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_ne_bytes(self.take()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_ne_bytes(self.take()?))
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let end = self.pos.checked_add(N).ok_or(Error::Eof)?;
        let bytes = self.buf.get(self.pos..end).ok_or(Error::Eof)?;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    /// Decodes a ULEB128 value, rejecting encodings that do not fit in 64
    /// bits.
    pub fn read_uleb128(&mut self) -> Result<u64, Error> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(Error::Overflow(
                    "ULEB128 overflowed unsigned 64-bit integer",
                ));
            }
            value |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    /// Decodes an SLEB128 value, rejecting encodings where bit 63 would be
    /// ambiguous.
    pub fn read_sleb128(&mut self) -> Result<i64, Error> {
        let mut value = 0u64;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.read_u8()?;
            if shift == 63 && byte != 0 && byte != 0x7f {
                return Err(Error::Overflow(
                    "SLEB128 overflowed signed 64-bit integer",
                ));
            }
            value |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            value |= !0 << shift;
        }
        Ok(value as i64)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        let end = self.pos.checked_add(n).ok_or(Error::Eof)?;
        if end > self.buf.len() {
            return Err(Error::Eof);
        }
        self.pos = end;
        Ok(())
    }

    /// Skips one LEB128-encoded value (signed or unsigned) without decoding
    /// it.
    pub fn skip_leb128(&mut self) -> Result<(), Error> {
        loop {
            if self.read_u8()? & 0x80 == 0 {
                return Ok(());
            }
        }
    }

    /// Skips past a NUL-terminated string, including the terminator.
    pub fn skip_cstr(&mut self) -> Result<(), Error> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        if rest.is_empty() {
            return Err(Error::Eof);
        }
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.pos += nul + 1;
                Ok(())
            }
            None => Err(Error::Eof),
        }
    }
}
