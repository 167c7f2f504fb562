//! Variable record codec.
//!
//! A record is a 36-byte header followed by the name and the value, padded
//! with erased bytes to a 4-byte boundary:
//!
//! ```text
//!   0        2     3     4            8          12          16            32     36
//!   ┌────────┬─────┬─────┬────────────┬──────────┬───────────┬─────────────┬──────┬──────┬───────┬─────┐
//!   │ 0x55AA │state│ rsv │ attributes │ name_len │ value_len │ namespace   │ crc  │ name │ value │ pad │
//!   └────────┴─────┴─────┴────────────┴──────────┴───────────┴─────────────┴──────┴──────┴───────┴─────┘
//! ```
//!
//! The CRC covers bytes `4..32`, the name and the value. The state byte is
//! excluded because it is downgraded in place.
//!
//! Decoding never trusts a length before checking it against the configured
//! limits and the bytes actually available.

use alloc::vec::Vec;
use core::fmt;

use crc::Crc;
use flashvar_adapters::ERASED_BYTE;

use crate::config::{RecordLimits, record_size};
use crate::guid::Guid;
use crate::marker::{FlashMarker, RecordState};
use crate::variable::attributes::Attributes;

/// Marks the start of every record.
pub const RECORD_START_ID: u16 = 0x55AA;
/// Header length, CRC included.
pub const RECORD_HEADER_LEN: usize = 36;
/// Records start on this boundary.
pub const RECORD_ALIGNMENT: u32 = 4;
/// Offset of the state byte inside a record.
pub const STATE_OFFSET: u32 = 2;

const CRC_OFFSET: usize = 32;

/// Why a record could not be decoded.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// Fewer bytes than the header or the lengths it announces.
    Truncated,
    /// Start marker is not `0x55AA`.
    BadStartMarker,
    /// Name is empty.
    EmptyName,
    /// Name longer than the limit.
    NameTooLong,
    /// Value longer than the limit.
    ValueTooLong,
    /// Size arithmetic overflowed.
    SizeOverflow,
    /// Name is not UTF-8.
    BadName,
    /// Content does not match the stored CRC.
    CrcMismatch,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for RecordError {}

impl RecordError {
    /// Static description, for `Error::InvalidParameter`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Truncated => "record truncated",
            Self::BadStartMarker => "bad record start marker",
            Self::EmptyName => "empty variable name",
            Self::NameTooLong => "variable name too long",
            Self::ValueTooLong => "variable value too long",
            Self::SizeOverflow => "record size overflows",
            Self::BadName => "variable name is not UTF-8",
            Self::CrcMismatch => "record CRC mismatch",
        }
    }
}

/// Decoded, length-checked record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Raw state byte.
    pub state: u8,
    /// Stored attributes.
    pub attributes: Attributes,
    /// Name length in bytes.
    pub name_len: u32,
    /// Value length in bytes.
    pub value_len: u32,
    /// Namespace of the key.
    pub namespace: Guid,
    /// Stored CRC.
    pub crc: u32,
    /// On-flash size including padding.
    pub size: u32,
}

impl RecordHeader {
    /// Decoded state, `None` for a byte outside the lattice.
    pub fn state(&self) -> Option<RecordState> {
        RecordState::from_byte(self.state)
    }

    /// Offset of the value from the start of the record.
    pub fn value_offset(&self) -> u32 {
        RECORD_HEADER_LEN as u32 + self.name_len
    }
}

/// A fully decoded record borrowing from its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedRecord<'a> {
    /// Header fields.
    pub header: RecordHeader,
    /// Name.
    pub name: &'a str,
    /// Value.
    pub value: &'a [u8],
}

/// Encodes and decodes records under a set of limits.
pub struct RecordCodec {
    crc: Crc<u32>,
    limits: RecordLimits,
}

impl RecordCodec {
    /// Codec checksumming with `algorithm`.
    pub fn new(algorithm: &'static crc::Algorithm<u32>, limits: RecordLimits) -> Self {
        Self {
            crc: Crc::<u32>::new(algorithm),
            limits,
        }
    }

    /// The limits lengths are checked against.
    pub fn limits(&self) -> &RecordLimits {
        &self.limits
    }

    /// On-flash size of a record, after checking the limits.
    pub fn encoded_len(&self, name_len: usize, value_len: usize) -> Result<u32, RecordError> {
        let name_len = self.check_name_len(name_len)?;
        let value_len = u32::try_from(value_len).map_err(|_| RecordError::ValueTooLong)?;
        if value_len > self.limits.max_value_len {
            return Err(RecordError::ValueTooLong);
        }
        record_size(name_len, value_len).ok_or(RecordError::SizeOverflow)
    }

    /// Encode a complete record in `state`.
    pub fn encode(
        &self,
        state: RecordState,
        namespace: Guid,
        name: &str,
        value: &[u8],
        attributes: Attributes,
    ) -> Result<Vec<u8>, RecordError> {
        let size = self.encoded_len(name.len(), value.len())?;
        let mut buf = alloc::vec![ERASED_BYTE; size as usize];

        buf[0..2].copy_from_slice(&RECORD_START_ID.to_le_bytes());
        buf[2] = state.to_byte();
        buf[4..8].copy_from_slice(&attributes.bits().to_le_bytes());
        buf[8..12].copy_from_slice(&(name.len() as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(value.len() as u32).to_le_bytes());
        buf[16..32].copy_from_slice(namespace.as_bytes());

        let name_end = RECORD_HEADER_LEN + name.len();
        buf[RECORD_HEADER_LEN..name_end].copy_from_slice(name.as_bytes());
        buf[name_end..name_end + value.len()].copy_from_slice(value);

        let crc = self.checksum(&buf[4..CRC_OFFSET], name.as_bytes(), value);
        buf[CRC_OFFSET..RECORD_HEADER_LEN].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode and sanity-check a header. Does not verify the CRC.
    pub fn decode_header(&self, buf: &[u8]) -> Result<RecordHeader, RecordError> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(RecordError::Truncated);
        }
        if u16::from_le_bytes([buf[0], buf[1]]) != RECORD_START_ID {
            return Err(RecordError::BadStartMarker);
        }
        let name_len = read_u32(buf, 8);
        let value_len = read_u32(buf, 12);
        self.check_name_len(name_len as usize)?;
        if value_len > self.limits.max_value_len {
            return Err(RecordError::ValueTooLong);
        }
        let size = record_size(name_len, value_len).ok_or(RecordError::SizeOverflow)?;

        let mut namespace = [0u8; Guid::LEN];
        namespace.copy_from_slice(&buf[16..32]);
        Ok(RecordHeader {
            state: buf[STATE_OFFSET as usize],
            attributes: Attributes::from_bits_retain(read_u32(buf, 4)),
            name_len,
            value_len,
            namespace: Guid::from_bytes(namespace),
            crc: read_u32(buf, CRC_OFFSET),
            size,
        })
    }

    /// Decode a whole record and verify its CRC.
    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<DecodedRecord<'a>, RecordError> {
        let header = self.decode_header(buf)?;
        let name_end = RECORD_HEADER_LEN + header.name_len as usize;
        let value_end = name_end + header.value_len as usize;
        if buf.len() < value_end {
            return Err(RecordError::Truncated);
        }
        let name_bytes = &buf[RECORD_HEADER_LEN..name_end];
        let value = &buf[name_end..value_end];

        if self.checksum(&buf[4..CRC_OFFSET], name_bytes, value) != header.crc {
            return Err(RecordError::CrcMismatch);
        }
        let name = core::str::from_utf8(name_bytes).map_err(|_| RecordError::BadName)?;
        Ok(DecodedRecord {
            header,
            name,
            value,
        })
    }

    fn check_name_len(&self, name_len: usize) -> Result<u32, RecordError> {
        if name_len == 0 {
            return Err(RecordError::EmptyName);
        }
        match u32::try_from(name_len) {
            Ok(len) if len <= self.limits.max_name_len => Ok(len),
            _ => Err(RecordError::NameTooLong),
        }
    }

    fn checksum(&self, fields: &[u8], name: &[u8], value: &[u8]) -> u32 {
        let mut digest = self.crc.digest();
        digest.update(fields);
        digest.update(name);
        digest.update(value);
        digest.finalize()
    }
}

/// Whether a header slot is still erased, i.e. the log ends here.
pub fn is_erased_slot(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == ERASED_BYTE && buf[1] == ERASED_BYTE
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: Guid = Guid::from_bytes([0x11; 16]);

    fn codec() -> RecordCodec {
        RecordCodec::new(&crc::CRC_32_ISO_HDLC, RecordLimits::new(16, 32))
    }

    #[test]
    fn test_layout() {
        let buf = codec()
            .encode(RecordState::Added, NS, "Boot", b"\x01\x02\x03", Attributes::NV_BS_RT)
            .unwrap();

        assert_eq!(buf.len(), 44);
        assert_eq!(&buf[0..2], &[0xAA, 0x55]);
        assert_eq!(buf[2], 0x3F);
        assert_eq!(buf[3], 0xFF);
        assert_eq!(&buf[4..8], &7u32.to_le_bytes());
        assert_eq!(&buf[8..12], &4u32.to_le_bytes());
        assert_eq!(&buf[12..16], &3u32.to_le_bytes());
        assert_eq!(&buf[16..32], NS.as_bytes());
        assert_eq!(&buf[36..40], b"Boot");
        assert_eq!(&buf[40..43], &[1, 2, 3]);
        assert_eq!(buf[43], ERASED_BYTE);
    }

    #[test]
    fn test_decode_verifies_crc() {
        let codec = codec();
        let mut buf = codec
            .encode(RecordState::Added, NS, "Lang", b"en", Attributes::empty())
            .unwrap();
        let record = codec.decode(&buf).unwrap();
        assert_eq!(record.name, "Lang");
        assert_eq!(record.value, b"en");
        assert_eq!(record.header.state(), Some(RecordState::Added));

        buf[41] ^= 0x01;
        assert_eq!(codec.decode(&buf), Err(RecordError::CrcMismatch));
    }

    #[test]
    fn test_state_byte_is_outside_crc() {
        let codec = codec();
        let mut buf = codec
            .encode(RecordState::Added, NS, "Lang", b"en", Attributes::empty())
            .unwrap();
        buf[2] = RecordState::Deleted.to_byte();
        let record = codec.decode(&buf).unwrap();
        assert_eq!(record.header.state(), Some(RecordState::Deleted));
    }

    #[test]
    fn test_limits_are_enforced() {
        let codec = codec();
        assert_eq!(codec.encoded_len(17, 0), Err(RecordError::NameTooLong));
        assert_eq!(codec.encoded_len(1, 33), Err(RecordError::ValueTooLong));
        assert_eq!(codec.encoded_len(0, 1), Err(RecordError::EmptyName));
        assert_eq!(codec.encoded_len(16, 32), Ok(84));
    }

    #[test]
    fn test_insane_lengths_are_not_trusted() {
        let codec = codec();
        let mut buf = codec
            .encode(RecordState::Added, NS, "A", b"1", Attributes::empty())
            .unwrap();
        buf[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(codec.decode_header(&buf), Err(RecordError::ValueTooLong));

        let unbounded = RecordCodec::new(&crc::CRC_32_ISO_HDLC, RecordLimits::new(u32::MAX, u32::MAX));
        buf[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(unbounded.decode_header(&buf), Err(RecordError::SizeOverflow));
    }

    #[test]
    fn test_truncated_input() {
        let codec = codec();
        let buf = codec
            .encode(RecordState::Added, NS, "Name", b"value", Attributes::empty())
            .unwrap();
        assert_eq!(codec.decode_header(&buf[..20]), Err(RecordError::Truncated));
        assert_eq!(codec.decode(&buf[..38]), Err(RecordError::Truncated));
    }

    #[test]
    fn test_erased_slot() {
        assert!(is_erased_slot(&[0xFF; RECORD_HEADER_LEN]));
        assert!(!is_erased_slot(&[0xAA, 0x55]));
        let codec = codec();
        assert_eq!(
            codec.decode_header(&[0xFF; RECORD_HEADER_LEN]),
            Err(RecordError::BadStartMarker)
        );
    }
}
