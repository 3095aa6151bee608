//! Little-endian, length-prefixed byte codec shared by attestation requests
//! and evidence envelopes.

use crate::error::{EnclaveError, Result};

/// Upper bound on any single length-prefixed field.
pub const MAX_FIELD_LEN: usize = 64 * 1024;

#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn magic(mut self, magic: &[u8; 4]) -> Self {
        self.buf.extend_from_slice(magic);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn field(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8], what: &'static str) -> Self {
        Self { bytes, what }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(EnclaveError::Protocol(format!(
                "{} truncated: need {} bytes, {} remaining",
                self.what,
                len,
                self.bytes.len()
            )));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    pub fn expect_magic(&mut self, magic: &[u8; 4]) -> Result<()> {
        let got = self.take(4)?;
        if got != magic {
            return Err(EnclaveError::Protocol(format!(
                "{} has bad magic {}",
                self.what,
                hex::encode(got)
            )));
        }
        Ok(())
    }

    pub fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(raw);
        Ok(u64::from_le_bytes(out))
    }

    pub fn field(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(EnclaveError::Protocol(format!(
                "{} field of {} bytes exceeds limit",
                self.what, len
            )));
        }
        self.take(len)
    }

    pub fn finish(self) -> Result<()> {
        if !self.bytes.is_empty() {
            return Err(EnclaveError::Protocol(format!(
                "{} has {} trailing bytes",
                self.what,
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_field_is_protocol_error() {
        let bytes = Writer::new().field(b"hello").finish();
        let mut reader = Reader::new(&bytes[..6], "test frame");
        let err = reader.field().unwrap_err();
        assert!(matches!(err, EnclaveError::Protocol(_)));
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let bytes = Writer::new().u32(u32::MAX).finish();
        let mut reader = Reader::new(&bytes, "test frame");
        assert!(reader.field().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let bytes = Writer::new().u64(7).u32(1).finish();
        let mut reader = Reader::new(&bytes, "test frame");
        assert_eq!(reader.u64().unwrap(), 7);
        assert!(reader.finish().is_err());
    }
}
