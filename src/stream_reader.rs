//! Byte-level codestream reader.
//!
//! A position-tracked cursor over the input bytes. Multi-byte fields are
//! big-endian; failures carry the byte offset for error reporting.

use byteorder::{BigEndian, ByteOrder};

use crate::error::J2kError;
use crate::marker_code::MarkerCode;

pub struct StreamReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, n: usize) -> Result<(), J2kError> {
        if self.remaining() < n {
            Err(J2kError::TruncatedInput { offset: self.pos })
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, J2kError> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, J2kError> {
        self.need(2)?;
        let v = BigEndian::read_u16(&self.data[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, J2kError> {
        self.need(4)?;
        let v = BigEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], J2kError> {
        self.need(n)?;
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn advance(&mut self, n: usize) -> Result<(), J2kError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), J2kError> {
        if pos > self.data.len() {
            return Err(J2kError::TruncatedInput { offset: pos });
        }
        self.pos = pos;
        Ok(())
    }

    /// Next two bytes as a marker code, without consuming them.
    pub fn peek_marker(&self) -> Result<Option<MarkerCode>, J2kError> {
        self.need(2)?;
        let v = BigEndian::read_u16(&self.data[self.pos..]);
        Ok(MarkerCode::try_from(v).ok())
    }

    /// Read a marker code, failing on anything that is not `0xFFxx`.
    pub fn read_marker(&mut self) -> Result<MarkerCode, J2kError> {
        let at = self.pos;
        let v = self.read_u16()?;
        if v < 0xFF00 {
            return Err(J2kError::malformed(
                at,
                format!("expected a marker, found {v:#06x}"),
            ));
        }
        MarkerCode::try_from(v)
            .map_err(|_| J2kError::malformed(at, format!("unknown marker {v:#06x}")))
    }

    /// Read a marker segment length and return the payload byte count.
    /// The wire length includes the two length bytes themselves.
    pub fn read_segment_len(&mut self) -> Result<usize, J2kError> {
        let at = self.pos;
        let len = self.read_u16()? as usize;
        if len < 2 {
            return Err(J2kError::malformed(at, "marker segment length below 2"));
        }
        self.need(len - 2)
            .map_err(|_| J2kError::TruncatedInput { offset: at })?;
        Ok(len - 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_fields() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A];
        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u8().unwrap(), 0x56);
        assert_eq!(r.offset(), 3);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_marker_roundtrip() {
        let data = [0xFF, 0x4F, 0xFF, 0x51];
        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_marker().unwrap(), MarkerCode::StartOfCodestream);
        assert_eq!(
            r.peek_marker().unwrap(),
            Some(MarkerCode::ImageAndTileSize)
        );
    }

    #[test]
    fn test_segment_len_validation() {
        let data = [0x00, 0x01];
        let mut r = StreamReader::new(&data);
        assert!(matches!(
            r.read_segment_len(),
            Err(J2kError::MalformedCodestream { .. })
        ));
        let data = [0x00, 0x08, 0xAA];
        let mut r = StreamReader::new(&data);
        assert!(matches!(
            r.read_segment_len(),
            Err(J2kError::TruncatedInput { .. })
        ));
    }
}
