//! Per-slot frame header: `(type, epoch_time, length, checksum)` laid out for
//! explicit little-endian (de)serialization, the way the teacher's
//! `MessageHeader` does it — field order chosen to avoid implicit padding,
//! `to_bytes`/`from_bytes` writing each field at a fixed offset rather than
//! relying on `#[repr(C)]` layout matching across builds.

use crate::{Error, Result};

pub const FRAME_HEADER_SIZE: usize = 64;
const TYPE_BYTES_CAP: usize = 16;

#[repr(C, align(64))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq: u64,
    pub epoch_s: u64,
    pub epoch_us: u32,
    pub length: u32,
    pub checksum: u32,
    pub type_len: u8,
    pub _reserved: [u8; 3],
    pub type_bytes: [u8; TYPE_BYTES_CAP],
    pub _pad: [u8; 16],
}

impl FrameHeader {
    pub fn new(seq: u64, epoch_s: u64, epoch_us: u32, length: u32, checksum: u32, type_str: &str) -> Result<Self> {
        let bytes = type_str.as_bytes();
        if bytes.len() > TYPE_BYTES_CAP {
            return Err(Error::Unsupported("frame type string exceeds 16 bytes"));
        }
        let mut type_bytes = [0u8; TYPE_BYTES_CAP];
        type_bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            seq,
            epoch_s,
            epoch_us,
            length,
            checksum,
            type_len: bytes.len() as u8,
            _reserved: [0; 3],
            type_bytes,
            _pad: [0; 16],
        })
    }

    pub fn type_str(&self) -> &str {
        let len = (self.type_len as usize).min(TYPE_BYTES_CAP);
        std::str::from_utf8(&self.type_bytes[..len]).unwrap_or("any")
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..16].copy_from_slice(&self.epoch_s.to_le_bytes());
        buf[16..20].copy_from_slice(&self.epoch_us.to_le_bytes());
        buf[20..24].copy_from_slice(&self.length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf[28] = self.type_len;
        buf[29..32].copy_from_slice(&self._reserved);
        buf[32..32 + TYPE_BYTES_CAP].copy_from_slice(&self.type_bytes);
        buf[48..64].copy_from_slice(&self._pad);
        buf
    }

    pub fn from_bytes(bytes: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let seq = u64::from_le_bytes(bytes[0..8].try_into().expect("slice length"));
        let epoch_s = u64::from_le_bytes(bytes[8..16].try_into().expect("slice length"));
        let epoch_us = u32::from_le_bytes(bytes[16..20].try_into().expect("slice length"));
        let length = u32::from_le_bytes(bytes[20..24].try_into().expect("slice length"));
        let checksum = u32::from_le_bytes(bytes[24..28].try_into().expect("slice length"));
        let type_len = bytes[28];
        let mut _reserved = [0u8; 3];
        _reserved.copy_from_slice(&bytes[29..32]);
        let mut type_bytes = [0u8; TYPE_BYTES_CAP];
        type_bytes.copy_from_slice(&bytes[32..32 + TYPE_BYTES_CAP]);
        let mut _pad = [0u8; 16];
        _pad.copy_from_slice(&bytes[48..64]);
        Self { seq, epoch_s, epoch_us, length, checksum, type_len, _reserved, type_bytes, _pad }
    }

    pub fn crc32(payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn validate_crc(&self, payload: &[u8]) -> Result<()> {
        if Self::crc32(payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::Corrupt("frame payload checksum mismatch"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn header_size_and_alignment() {
        assert_eq!(size_of::<FrameHeader>(), FRAME_HEADER_SIZE);
        assert_eq!(align_of::<FrameHeader>(), 64);
    }

    #[test]
    fn roundtrips_through_bytes() {
        let h = FrameHeader::new(7, 1_700_000_000, 500_000, 42, FrameHeader::crc32(b"abc"), "jpeg").unwrap();
        let back = FrameHeader::from_bytes(&h.to_bytes());
        assert_eq!(h, back);
        assert_eq!(back.type_str(), "jpeg");
    }

    #[test]
    fn rejects_oversized_type_string() {
        assert!(FrameHeader::new(0, 0, 0, 0, 0, "way-too-long-a-type-tag").is_err());
    }
}
