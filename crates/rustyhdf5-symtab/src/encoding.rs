//! Little-endian codec for file addresses and lengths.
//!
//! Every structure in the group index encodes addresses with the file's
//! `offset_size` and lengths with its `length_size`. An address whose bytes
//! are all `0xFF` is undefined.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// A byte address inside the file.
pub type Address = u64;

/// Sentinel for "no address".
pub const UNDEFINED_ADDRESS: Address = u64::MAX;

/// Whether `addr` refers to a real location.
pub fn is_defined(addr: Address) -> bool {
    addr != UNDEFINED_ADDRESS
}

/// Widths of addresses and lengths, fixed per file by the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileSizes {
    /// Bytes per encoded address.
    pub offset_size: u8,
    /// Bytes per encoded length.
    pub length_size: u8,
}

impl FileSizes {
    /// Validate and bundle the two widths.
    pub fn new(offset_size: u8, length_size: u8) -> Result<Self, FormatError> {
        if !matches!(offset_size, 2 | 4 | 8) {
            return Err(FormatError::InvalidOffsetSize(offset_size));
        }
        if !matches!(length_size, 2 | 4 | 8) {
            return Err(FormatError::InvalidLengthSize(length_size));
        }
        Ok(Self {
            offset_size,
            length_size,
        })
    }

    /// Encoded address width in bytes.
    pub const fn sizeof_addr(&self) -> usize {
        self.offset_size as usize
    }

    /// Encoded length width in bytes.
    pub const fn sizeof_size(&self) -> usize {
        self.length_size as usize
    }
}

impl Default for FileSizes {
    fn default() -> Self {
        Self {
            offset_size: 8,
            length_size: 8,
        }
    }
}

fn low_bytes(value: u64, width: usize) -> u64 {
    if width >= 8 {
        value
    } else {
        value & ((1u64 << (width * 8)) - 1)
    }
}

/// Cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    sizes: FileSizes,
}

impl<'a> Decoder<'a> {
    /// Start decoding `data` at position 0.
    pub fn new(data: &'a [u8], sizes: FileSizes) -> Self {
        Self {
            data,
            pos: 0,
            sizes,
        }
    }

    /// File widths used by this cursor.
    pub fn sizes(&self) -> FileSizes {
        self.sizes
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Fail unless `n` more bytes are available.
    pub fn ensure(&self, n: usize) -> Result<(), FormatError> {
        if self.remaining() < n {
            return Err(FormatError::UnexpectedEof {
                expected: self.pos + n,
                available: self.data.len(),
            });
        }
        Ok(())
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        self.ensure(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Advance without reading.
    pub fn skip(&mut self, n: usize) -> Result<(), FormatError> {
        self.bytes(n).map(|_| ())
    }

    /// Read one byte.
    pub fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.bytes(1)?[0])
    }

    /// Read a little-endian `u16`.
    pub fn u16(&mut self) -> Result<u16, FormatError> {
        Ok(LittleEndian::read_u16(self.bytes(2)?))
    }

    /// Read a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    /// Read an address; all-ones decodes as [`UNDEFINED_ADDRESS`].
    pub fn address(&mut self) -> Result<Address, FormatError> {
        let raw = self.bytes(self.sizes.sizeof_addr())?;
        if raw.iter().all(|&b| b == 0xFF) {
            return Ok(UNDEFINED_ADDRESS);
        }
        Ok(LittleEndian::read_uint(raw, raw.len()))
    }

    /// Read a length-width unsigned value.
    pub fn length(&mut self) -> Result<u64, FormatError> {
        let raw = self.bytes(self.sizes.sizeof_size())?;
        Ok(LittleEndian::read_uint(raw, raw.len()))
    }

    /// Consume a four byte signature, returning `err` on mismatch.
    pub fn signature(&mut self, magic: &[u8; 4], err: FormatError) -> Result<(), FormatError> {
        if self.bytes(4)? != magic {
            return Err(err);
        }
        Ok(())
    }
}

/// Appending encoder, the write-side mirror of [`Decoder`].
#[derive(Debug, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
    sizes: FileSizes,
}

impl Encoder {
    /// Empty encoder.
    pub fn new(sizes: FileSizes) -> Self {
        Self::with_capacity(sizes, 0)
    }

    /// Empty encoder with reserved capacity.
    pub fn with_capacity(sizes: FileSizes, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            sizes,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and take the buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Append raw bytes.
    pub fn bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append `n` zero bytes.
    pub fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// Zero-fill up to an absolute length.
    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    /// Append one byte.
    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append a little-endian `u16`.
    pub fn u16(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, v);
        self.bytes(&tmp);
    }

    /// Append a little-endian `u32`.
    pub fn u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.bytes(&tmp);
    }

    fn uint(&mut self, v: u64, width: usize) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_uint(&mut tmp[..width], low_bytes(v, width), width);
        self.buf.extend_from_slice(&tmp[..width]);
    }

    /// Append an address; [`UNDEFINED_ADDRESS`] encodes as all-ones.
    pub fn address(&mut self, addr: Address) {
        let width = self.sizes.sizeof_addr();
        if is_defined(addr) {
            self.uint(addr, width);
        } else {
            self.buf.resize(self.buf.len() + width, 0xFF);
        }
    }

    /// Append a length-width value.
    pub fn length(&mut self, v: u64) {
        self.uint(v, self.sizes.sizeof_size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_widths() {
        assert_eq!(
            FileSizes::new(3, 8).unwrap_err(),
            FormatError::InvalidOffsetSize(3)
        );
        assert_eq!(
            FileSizes::new(8, 16).unwrap_err(),
            FormatError::InvalidLengthSize(16)
        );
    }

    #[test]
    fn undefined_address_round_trips_at_every_width() {
        for width in [2u8, 4, 8] {
            let sizes = FileSizes::new(width, width).unwrap();
            let mut enc = Encoder::new(sizes);
            enc.address(UNDEFINED_ADDRESS);
            enc.address(0x1234);
            let buf = enc.into_inner();
            assert_eq!(buf.len(), 2 * width as usize);
            let mut dec = Decoder::new(&buf, sizes);
            assert_eq!(dec.address().unwrap(), UNDEFINED_ADDRESS);
            assert_eq!(dec.address().unwrap(), 0x1234);
            assert_eq!(dec.remaining(), 0);
        }
    }

    #[test]
    fn decoder_reports_eof() {
        let sizes = FileSizes::new(4, 4).unwrap();
        let mut dec = Decoder::new(&[1, 2, 3], sizes);
        assert_eq!(
            dec.length().unwrap_err(),
            FormatError::UnexpectedEof {
                expected: 4,
                available: 3
            }
        );
    }

    #[test]
    fn signature_mismatch() {
        let mut dec = Decoder::new(b"TRXE", FileSizes::default());
        let err = dec
            .signature(b"TREE", FormatError::InvalidBTreeSignature)
            .unwrap_err();
        assert_eq!(err, FormatError::InvalidBTreeSignature);
    }

    #[test]
    fn pad_to_zero_fills() {
        let mut enc = Encoder::new(FileSizes::default());
        enc.u16(0xBEEF);
        enc.pad_to(6);
        assert_eq!(enc.into_inner(), vec![0xEF, 0xBE, 0, 0, 0, 0]);
    }
}
