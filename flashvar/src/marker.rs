//! Downgrade-only flash markers.
//!
//! NOR flash can only be programmed from `1` towards `0`; raising a bit needs
//! a block erase. Every byte-wide marker that the store and the FTW engine
//! update in place is therefore modelled as a type whose only transition,
//! [`FlashMarker::downgrade`], refuses any step that would set a bit.
//!
//! ```text
//!   RecordState        0xFF ─► 0x7F ─► 0x3F ─► 0x3E ─► 0x3C
//!                      erased  header  added   in-del  deleted
//!
//!   TxnPhase           0xFF ─► 0xFE ─► 0xFC
//!                      alloc   spare   destination
//!
//!   WorkingBlockState  0xFF ─► 0xFE ─► 0xFC
//!                      erased  valid   invalid
//! ```

use core::fmt;

/// A marker held in one flash byte.
pub trait FlashMarker: Copy + Eq + Sized {
    /// Encoded byte.
    fn to_byte(self) -> u8;

    /// Decode a byte read from flash. `None` if it is not a legal encoding.
    fn from_byte(byte: u8) -> Option<Self>;

    /// Move to `next`, which must be reachable by clearing bits only.
    ///
    /// Staying in the same state is allowed, which keeps replays idempotent.
    fn downgrade(self, next: Self) -> Result<Self, IllegalTransition> {
        let (from, to) = (self.to_byte(), next.to_byte());
        if from & to == to {
            Ok(next)
        } else {
            Err(IllegalTransition { from, to })
        }
    }
}

/// A marker transition that would need to set bits.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    /// Current encoding.
    pub from: u8,
    /// Requested encoding.
    pub to: u8,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Marker transition {:#04x} -> {:#04x} would set bits",
            self.from, self.to
        )
    }
}

impl core::error::Error for IllegalTransition {}

/// Lifecycle of a variable record.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordState {
    /// Nothing programmed yet, or the header write was torn.
    Erased = 0xFF,
    /// Header written, name and value may be incomplete.
    HeaderValidOnly = 0x7F,
    /// Complete and live.
    Added = 0x3F,
    /// Superseded by a newer record that may not have landed yet.
    InDeletedTransition = 0x3E,
    /// Dead.
    Deleted = 0x3C,
}

impl RecordState {
    /// Whether a record in this state can still carry the key's value.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Added | Self::InDeletedTransition)
    }
}

impl FlashMarker for RecordState {
    fn to_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xFF => Some(Self::Erased),
            0x7F => Some(Self::HeaderValidOnly),
            0x3F => Some(Self::Added),
            0x3E => Some(Self::InDeletedTransition),
            0x3C => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Progress of an FTW transaction, held in the transaction record.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnPhase {
    /// Record written, payload streaming into the spare region.
    Allocated = 0xFF,
    /// Spare region holds the full new content.
    SpareComplete = 0xFE,
    /// Target region holds the new content.
    DestinationComplete = 0xFC,
}

impl FlashMarker for TxnPhase {
    fn to_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xFF => Some(Self::Allocated),
            0xFE => Some(Self::SpareComplete),
            0xFC => Some(Self::DestinationComplete),
            _ => None,
        }
    }
}

/// Bit cleared once the working block holds a trustworthy record.
pub const WORKING_BLOCK_VALID: u8 = 1 << 0;
/// Bit cleared once that record has been consumed.
pub const WORKING_BLOCK_INVALID: u8 = 1 << 1;

/// The two working-block flags, read together.
///
/// Each flag is asserted by clearing its bit. A record is trustworthy only
/// while `WorkingBlockValid` is asserted and `WorkingBlockInvalid` is not.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkingBlockState {
    /// Neither flag asserted: never started, or torn before validation.
    Erased = 0xFF,
    /// Record trustworthy.
    Valid = 0xFE,
    /// Record cleared.
    Invalid = 0xFC,
}

impl WorkingBlockState {
    /// Whether the record behind these flags must be acted upon.
    pub const fn is_trustworthy(self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl FlashMarker for WorkingBlockState {
    fn to_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(byte: u8) -> Option<Self> {
        // Any encoding is meaningful: the flags are independent bits.
        if byte & WORKING_BLOCK_INVALID == 0 {
            Some(Self::Invalid)
        } else if byte & WORKING_BLOCK_VALID == 0 {
            Some(Self::Valid)
        } else {
            Some(Self::Erased)
        }
    }
}

/// Health marker of the store header.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreHealth {
    /// The log scanned cleanly.
    Healthy = 0xFE,
    /// The log holds a damaged record; the next mutation reclaims.
    Damaged = 0x00,
}

impl FlashMarker for StoreHealth {
    fn to_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xFE => Some(Self::Healthy),
            0x00 => Some(Self::Damaged),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lattice_only_moves_down() {
        let state = RecordState::Erased;
        let state = state.downgrade(RecordState::HeaderValidOnly).unwrap();
        let state = state.downgrade(RecordState::Added).unwrap();
        let state = state.downgrade(RecordState::InDeletedTransition).unwrap();
        let state = state.downgrade(RecordState::Deleted).unwrap();

        let err = state.downgrade(RecordState::Added).unwrap_err();
        assert_eq!(err, IllegalTransition { from: 0x3C, to: 0x3F });
    }

    #[test]
    fn test_added_can_jump_to_deleted() {
        assert_eq!(
            RecordState::Added.downgrade(RecordState::Deleted),
            Ok(RecordState::Deleted)
        );
        assert!(RecordState::Deleted.downgrade(RecordState::InDeletedTransition).is_err());
    }

    #[test]
    fn test_same_state_is_idempotent() {
        assert_eq!(
            TxnPhase::SpareComplete.downgrade(TxnPhase::SpareComplete),
            Ok(TxnPhase::SpareComplete)
        );
        assert!(TxnPhase::DestinationComplete.downgrade(TxnPhase::Allocated).is_err());
    }

    #[test]
    fn test_working_block_flags_decode_by_bit() {
        assert_eq!(WorkingBlockState::from_byte(0xFF), Some(WorkingBlockState::Erased));
        assert_eq!(WorkingBlockState::from_byte(0xFE), Some(WorkingBlockState::Valid));
        assert_eq!(WorkingBlockState::from_byte(0xFC), Some(WorkingBlockState::Invalid));
        // Invalid asserted without Valid still means cleared.
        assert_eq!(WorkingBlockState::from_byte(0xFD), Some(WorkingBlockState::Invalid));
        assert!(WorkingBlockState::Valid.is_trustworthy());
        assert!(!WorkingBlockState::Invalid.is_trustworthy());
    }

    #[test]
    fn test_unknown_bytes_are_rejected() {
        assert_eq!(RecordState::from_byte(0x3D), None);
        assert_eq!(TxnPhase::from_byte(0x00), None);
        assert_eq!(StoreHealth::from_byte(0xFF), None);
    }

    #[test]
    fn test_live_states() {
        assert!(RecordState::Added.is_live());
        assert!(RecordState::InDeletedTransition.is_live());
        assert!(!RecordState::Deleted.is_live());
        assert!(!RecordState::HeaderValidOnly.is_live());
    }
}
