//! Length-scoped binary reader and writer.
//!
//! Both sides keep a stack of "relative limits": every length-prefixed
//! region pushes the absolute end offset it must finish at, and popping the
//! region verifies it was consumed exactly. Writer violations are encoder
//! bugs (`Internal`), reader violations are bad input (`Framing`).
//!
//! All integers are little-endian except `NodeId`, which is copied as its
//! 16 raw big-endian bytes.

use crate::error::{Result, TransportError};

use super::node_id::{NodeId, NODE_ID_SIZE};

/// Byte length of a wire string: 16-bit length prefix plus UTF-8 bytes.
#[inline]
pub fn string_size(s: &str) -> usize {
    2 + s.len()
}

/// Writer over a pre-sized output slice.
pub struct WireWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    limits: Vec<usize>,
}

impl<'a> WireWriter<'a> {
    /// Create a writer over the whole slice.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let len = buf.len();
        Self {
            buf,
            pos: 0,
            limits: vec![len],
        }
    }

    /// Bytes written so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    fn limit(&self) -> usize {
        // The base limit is pushed in `new` and never popped.
        self.limits.last().copied().unwrap_or(self.buf.len())
    }

    /// Bytes left before the current region ends.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit() - self.pos
    }

    /// Open a region of exactly `len` bytes starting at the current position.
    pub fn push_relative_limit(&mut self, len: usize) -> Result<()> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.limit())
            .ok_or_else(|| {
                TransportError::Internal(format!(
                    "Write region of {} bytes exceeds enclosing region ({} left)",
                    len,
                    self.remaining()
                ))
            })?;
        self.limits.push(end);
        Ok(())
    }

    /// Close the innermost region; it must have been filled exactly.
    pub fn pop_limit(&mut self) -> Result<()> {
        if self.limits.len() <= 1 {
            return Err(TransportError::Internal(
                "Write limit stack underflow".to_string(),
            ));
        }
        let end = self.limit();
        if self.pos != end {
            return Err(TransportError::Internal(format!(
                "Write region not filled: {} bytes left",
                end - self.pos
            )));
        }
        self.limits.pop();
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(TransportError::Internal(format!(
                "Write of {} bytes overruns region ({} left)",
                bytes.len(),
                self.remaining()
            )));
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.put(bytes)
    }

    /// Write a node id as 16 big-endian bytes.
    pub fn write_node_id(&mut self, id: &NodeId) -> Result<()> {
        self.put(&id.to_bytes())
    }

    /// Write a 16-bit length prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len()).map_err(|_| {
            TransportError::protocol(format!("String of {} bytes exceeds 65535", s.len()))
        })?;
        self.write_u16(len)?;
        self.put(s.as_bytes())
    }

    /// Write a u32 length field, failing if the value does not fit.
    pub fn write_len_u32(&mut self, len: usize) -> Result<()> {
        let v = u32::try_from(len).map_err(|_| {
            TransportError::protocol(format!("Length {} exceeds 32-bit field", len))
        })?;
        self.write_u32(v)
    }
}

/// Reader over a received frame.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    limits: Vec<usize>,
}

impl<'a> WireReader<'a> {
    /// Create a reader over the whole slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            limits: vec![buf.len()],
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    fn limit(&self) -> usize {
        self.limits.last().copied().unwrap_or(self.buf.len())
    }

    /// Bytes left before the current region ends.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit() - self.pos
    }

    /// Open a region of exactly `len` bytes starting at the current position.
    pub fn push_relative_limit(&mut self, len: usize) -> Result<()> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.limit())
            .ok_or_else(|| {
                TransportError::framing(format!(
                    "Declared region of {} bytes exceeds available {}",
                    len,
                    self.remaining()
                ))
            })?;
        self.limits.push(end);
        Ok(())
    }

    /// Close the innermost region; it must have been consumed exactly.
    pub fn pop_limit(&mut self) -> Result<()> {
        if self.limits.len() <= 1 {
            return Err(TransportError::Internal(
                "Read limit stack underflow".to_string(),
            ));
        }
        let end = self.limit();
        if self.pos != end {
            return Err(TransportError::framing(format!(
                "Region not fully consumed: {} bytes left over",
                end - self.pos
            )));
        }
        self.limits.pop();
        Ok(())
    }

    /// Take `n` bytes, bounds-checked against the current region.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(TransportError::framing(format!(
                "Read of {} bytes overruns region ({} left)",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read a node id from 16 big-endian bytes.
    pub fn read_node_id(&mut self) -> Result<NodeId> {
        Ok(NodeId::from_bytes(self.take_array::<NODE_ID_SIZE>()?))
    }

    /// Read a 16-bit length prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        self.read_utf8(len)
    }

    /// Read `len` bytes as UTF-8.
    pub fn read_utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| TransportError::framing(format!("Invalid UTF-8 string: {}", e)))
    }

    /// Take `count` fixed-width items of `width` bytes each.
    ///
    /// The total is checked against the region before anything is
    /// materialized, so a corrupted count cannot trigger a huge allocation
    /// or an out-of-bounds read.
    pub fn take_items(&mut self, count: usize, width: usize) -> Result<&'a [u8]> {
        let total = count.checked_mul(width).ok_or_else(|| {
            TransportError::framing(format!("Array length {} x {} overflows", count, width))
        })?;
        if total > self.remaining() {
            return Err(TransportError::framing(format!(
                "Array of {} bytes exceeds available {}",
                total,
                self.remaining()
            )));
        }
        self.take(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_integers() {
        let mut buf = [0u8; 6];
        let mut w = WireWriter::new(&mut buf);
        w.write_u16(0x0102).unwrap();
        w.write_u32(0x03040506).unwrap();
        assert_eq!(buf, [0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_u16().unwrap(), 0x0102);
        assert_eq!(r.read_u32().unwrap(), 0x03040506);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_string_has_no_terminator() {
        let mut buf = [0u8; 5];
        let mut w = WireWriter::new(&mut buf);
        w.write_string("abc").unwrap();
        assert_eq!(w.position(), string_size("abc"));
        assert_eq!(buf, [3, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_writer_overrun_is_internal_error() {
        let mut buf = [0u8; 2];
        let mut w = WireWriter::new(&mut buf);
        let err = w.write_u32(1).unwrap_err();
        assert!(matches!(err, TransportError::Internal(_)));
    }

    #[test]
    fn test_writer_region_must_be_filled() {
        let mut buf = [0u8; 8];
        let mut w = WireWriter::new(&mut buf);
        w.push_relative_limit(4).unwrap();
        w.write_u16(7).unwrap();
        assert!(matches!(w.pop_limit(), Err(TransportError::Internal(_))));
    }

    #[test]
    fn test_reader_leftover_is_framing_error() {
        let buf = [1u8, 2, 3, 4];
        let mut r = WireReader::new(&buf);
        r.push_relative_limit(4).unwrap();
        r.read_u16().unwrap();
        let err = r.pop_limit().unwrap_err();
        assert!(err.to_string().contains("left over"));
    }

    #[test]
    fn test_reader_region_cannot_exceed_parent() {
        let buf = [0u8; 4];
        let mut r = WireReader::new(&buf);
        r.push_relative_limit(2).unwrap();
        assert!(r.push_relative_limit(3).is_err());
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_take_items_checks_before_reading() {
        let buf = [0u8; 16];
        let mut r = WireReader::new(&buf);
        assert!(r.take_items(usize::MAX, 8).is_err());
        assert!(r.take_items(3, 8).is_err());
        assert_eq!(r.position(), 0);
        assert_eq!(r.take_items(2, 8).unwrap().len(), 16);
    }

    #[test]
    fn test_node_id_is_raw_big_endian() {
        let id = NodeId::new_random();
        let mut buf = [0u8; 16];
        WireWriter::new(&mut buf).write_node_id(&id).unwrap();
        assert_eq!(buf, id.to_bytes());
        assert_eq!(WireReader::new(&buf).read_node_id().unwrap(), id);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let buf = [2u8, 0, 0xff, 0xfe];
        assert!(WireReader::new(&buf).read_string().is_err());
    }
}
