//! Adapter-level errors.

use core::fmt;

/// Errors reported by the simulated [`RamFlash`](crate::RamFlash) part.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Access falls outside the part.
    OutOfBounds {
        /// Requested offset.
        offset: u32,
        /// Requested length.
        len: u32,
    },
    /// Erase range is not aligned to the erase size.
    Misaligned {
        /// Requested offset.
        offset: u32,
        /// Requested length.
        len: u32,
    },
    /// A write tried to turn a `0` bit back into `1` without an erase.
    BitSet {
        /// First offending byte.
        offset: u32,
    },
    /// Supply was cut; the medium may hold a torn operation.
    PowerLoss,
    /// Failure injected by a test.
    Injected,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds { offset, len } => {
                write!(f, "Flash access {:#x}+{:#x} out of bounds", offset, len)
            }
            Self::Misaligned { offset, len } => {
                write!(f, "Erase {:#x}+{:#x} not aligned to erase size", offset, len)
            }
            Self::BitSet { offset } => {
                write!(f, "Write at {:#x} would set bits without an erase", offset)
            }
            Self::PowerLoss => write!(f, "Power lost during flash operation"),
            Self::Injected => write!(f, "Injected flash failure"),
        }
    }
}

impl core::error::Error for FlashError {}
