//! On-flash layout of the working block.
//!
//! ```text
//!  header (24 bytes)                                 transaction record (32 bytes)
//!  ┌──────┬─────┬─────┬─────┬───────────┬─────────┐  ┌─────┬─────┬─────────┬────────┬───────┬──────────┬────────────┐
//!  │ FTWB │ crc │flags│ rsv │ queue len │   rsv   │  │phase│ rsv │ payload │ target │ spare │ span len │ payload    │
//!  │      │     │     │     │   (32)    │         │  │     │     │   crc   │  (u64) │ (u64) │          │ offset     │
//!  └──────┴─────┴─────┴─────┴───────────┴─────────┘  └─────┴─────┴─────────┴────────┴───────┴──────────┴────────────┘
//!  0      4     8     9     12          16        24  24    25    28        32       40      48         52          56
//! ```
//!
//! The header CRC covers header bytes `12..24` and record bytes `8..32`.
//! The flag byte, the phase byte and the payload CRC are programmed in place
//! and therefore excluded.

use core::fmt;

use crc::Crc;
use flashvar_adapters::ERASED_BYTE;

use crate::marker::{FlashMarker, TxnPhase, WorkingBlockState};

/// Identifies an initialised working block.
pub const WORKING_BLOCK_SIGNATURE: [u8; 4] = *b"FTWB";
/// Header length.
pub const WORKING_HEADER_LEN: usize = 24;
/// Transaction record length.
pub const TXN_RECORD_LEN: usize = 32;
/// Header plus record.
pub const WORKING_BLOCK_LEN: usize = WORKING_HEADER_LEN + TXN_RECORD_LEN;

/// Offset of the flag byte.
pub const FLAGS_OFFSET: u32 = 8;
/// Offset of the phase byte.
pub const PHASE_OFFSET: u32 = WORKING_HEADER_LEN as u32;
/// Offset of the payload CRC.
pub const PAYLOAD_CRC_OFFSET: u32 = PHASE_OFFSET + 4;

/// Payload CRC value before it has been programmed.
pub const ERASED_CRC: u32 = u32::MAX;

/// Parameters of one transaction.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Progress marker.
    pub phase: TxnPhase,
    /// CRC of the whole spare span, [`ERASED_CRC`] until commit.
    pub payload_crc: u32,
    /// Start of the erase-aligned target span.
    pub target: u32,
    /// Start of the spare copy.
    pub spare: u32,
    /// Length of the span.
    pub span_len: u32,
    /// Where the caller's range starts inside the span.
    pub payload_offset: u32,
}

/// Why a recorded working block cannot be trusted.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// Header CRC does not match.
    CrcMismatch,
    /// Queue length is not one transaction record.
    BadQueueLength,
    /// Phase byte outside the lattice.
    BadPhase,
    /// An address does not fit the 32-bit device space.
    AddressRange,
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrcMismatch => write!(f, "working block CRC mismatch"),
            Self::BadQueueLength => write!(f, "working block queue length invalid"),
            Self::BadPhase => write!(f, "transaction phase invalid"),
            Self::AddressRange => write!(f, "transaction address out of range"),
        }
    }
}

/// What a working block read from flash holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingBlockRead {
    /// Never written.
    Erased,
    /// Signature is neither erased nor ours.
    Unrecognised,
    /// A record was written; `record` says whether it decodes.
    Recorded {
        /// Current flags.
        flags: WorkingBlockState,
        /// The record, if intact.
        record: Result<TransactionRecord, LayoutError>,
    },
}

/// Encode header and record with the flags erased.
pub fn encode(record: &TransactionRecord, crc: &Crc<u32>) -> [u8; WORKING_BLOCK_LEN] {
    let mut buf = [ERASED_BYTE; WORKING_BLOCK_LEN];
    buf[0..4].copy_from_slice(&WORKING_BLOCK_SIGNATURE);
    buf[12..16].copy_from_slice(&(TXN_RECORD_LEN as u32).to_le_bytes());

    let r = WORKING_HEADER_LEN;
    buf[r] = record.phase.to_byte();
    buf[r + 4..r + 8].copy_from_slice(&record.payload_crc.to_le_bytes());
    buf[r + 8..r + 16].copy_from_slice(&u64::from(record.target).to_le_bytes());
    buf[r + 16..r + 24].copy_from_slice(&u64::from(record.spare).to_le_bytes());
    buf[r + 24..r + 28].copy_from_slice(&record.span_len.to_le_bytes());
    buf[r + 28..r + 32].copy_from_slice(&record.payload_offset.to_le_bytes());

    let sum = header_crc(&buf, crc);
    buf[4..8].copy_from_slice(&sum.to_le_bytes());
    buf
}

/// Decode a working block image.
pub fn decode(buf: &[u8; WORKING_BLOCK_LEN], crc: &Crc<u32>) -> WorkingBlockRead {
    if buf[0..4] != WORKING_BLOCK_SIGNATURE {
        return if buf[0..4].iter().all(|b| *b == ERASED_BYTE) {
            WorkingBlockRead::Erased
        } else {
            WorkingBlockRead::Unrecognised
        };
    }
    let flags = WorkingBlockState::from_byte(buf[FLAGS_OFFSET as usize])
        .unwrap_or(WorkingBlockState::Invalid);
    WorkingBlockRead::Recorded {
        flags,
        record: decode_record(buf, crc),
    }
}

/// The payload CRC field, which the header CRC does not cover.
pub fn payload_crc(buf: &[u8; WORKING_BLOCK_LEN]) -> u32 {
    read_u32(buf, PAYLOAD_CRC_OFFSET as usize)
}

fn decode_record(buf: &[u8; WORKING_BLOCK_LEN], crc: &Crc<u32>) -> Result<TransactionRecord, LayoutError> {
    if read_u32(buf, 4) != header_crc(buf, crc) {
        return Err(LayoutError::CrcMismatch);
    }
    if read_u32(buf, 12) as usize != TXN_RECORD_LEN {
        return Err(LayoutError::BadQueueLength);
    }
    let r = WORKING_HEADER_LEN;
    let phase = TxnPhase::from_byte(buf[r]).ok_or(LayoutError::BadPhase)?;
    let target = u32::try_from(read_u64(buf, r + 8)).map_err(|_| LayoutError::AddressRange)?;
    let spare = u32::try_from(read_u64(buf, r + 16)).map_err(|_| LayoutError::AddressRange)?;
    Ok(TransactionRecord {
        phase,
        payload_crc: read_u32(buf, r + 4),
        target,
        spare,
        span_len: read_u32(buf, r + 24),
        payload_offset: read_u32(buf, r + 28),
    })
}

fn header_crc(buf: &[u8; WORKING_BLOCK_LEN], crc: &Crc<u32>) -> u32 {
    let mut digest = crc.digest();
    digest.update(&buf[12..WORKING_HEADER_LEN]);
    digest.update(&buf[WORKING_HEADER_LEN + 8..]);
    digest.finalize()
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

    fn record() -> TransactionRecord {
        TransactionRecord {
            phase: TxnPhase::Allocated,
            payload_crc: ERASED_CRC,
            target: 0x4000,
            spare: 0x8000,
            span_len: 0x1000,
            payload_offset: 0x20,
        }
    }

    #[test]
    fn test_encode_layout() {
        let buf = encode(&record(), &CRC);
        assert_eq!(&buf[0..4], b"FTWB");
        assert_eq!(buf[8], 0xFF);
        assert_eq!(&buf[12..16], &32u32.to_le_bytes());
        assert!(buf[16..24].iter().all(|b| *b == 0xFF));
        assert_eq!(buf[24], 0xFF);
        assert_eq!(&buf[28..32], &[0xFF; 4]);
        assert_eq!(&buf[32..40], &0x4000u64.to_le_bytes());
        assert_eq!(&buf[52..56], &0x20u32.to_le_bytes());
    }

    #[test]
    fn test_in_place_fields_do_not_break_crc() {
        let mut buf = encode(&record(), &CRC);
        buf[FLAGS_OFFSET as usize] = WorkingBlockState::Valid.to_byte();
        buf[PHASE_OFFSET as usize] = TxnPhase::SpareComplete.to_byte();
        buf[PAYLOAD_CRC_OFFSET as usize..PAYLOAD_CRC_OFFSET as usize + 4]
            .copy_from_slice(&0x1234_5678u32.to_le_bytes());

        match decode(&buf, &CRC) {
            WorkingBlockRead::Recorded { flags, record } => {
                assert_eq!(flags, WorkingBlockState::Valid);
                let record = record.unwrap();
                assert_eq!(record.phase, TxnPhase::SpareComplete);
                assert_eq!(record.payload_crc, 0x1234_5678);
                assert_eq!(record.target, 0x4000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_target_fails_crc() {
        let mut buf = encode(&record(), &CRC);
        buf[33] ^= 0x01;
        assert!(matches!(
            decode(&buf, &CRC),
            WorkingBlockRead::Recorded {
                record: Err(LayoutError::CrcMismatch),
                ..
            }
        ));
    }

    #[test]
    fn test_erased_and_foreign_blocks() {
        assert_eq!(decode(&[0xFF; WORKING_BLOCK_LEN], &CRC), WorkingBlockRead::Erased);
        let mut foreign = [0xFF; WORKING_BLOCK_LEN];
        foreign[0] = 0;
        assert_eq!(decode(&foreign, &CRC), WorkingBlockRead::Unrecognised);
    }
}
