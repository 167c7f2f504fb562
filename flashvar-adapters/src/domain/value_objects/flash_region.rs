//! Type-safe flash region value object.

use core::fmt;

/// A validated, half-open byte range `[offset, offset + len)` on a flash part.
///
/// Regions are how the store, the spare area and the working block are
/// described. Construction rejects empty and overflowing ranges, so code
/// holding a `FlashRegion` can compute `end()` without checking.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlashRegion {
    offset: u32,
    len: u32,
}

impl FlashRegion {
    /// Create a new region.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or `offset + len` overflows.
    ///
    /// # Examples
    ///
    /// ```
    /// use flashvar_adapters::FlashRegion;
    ///
    /// let region = FlashRegion::new(0x1000, 0x2000).unwrap();
    /// assert_eq!(region.end(), 0x3000);
    /// ```
    pub const fn new(offset: u32, len: u32) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::Empty);
        }
        if offset.checked_add(len).is_none() {
            return Err(RegionError::Overflow { offset, len });
        }
        Ok(Self { offset, len })
    }

    /// Create a region whose offset and length are multiples of `erase_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is invalid or misaligned.
    pub const fn aligned(offset: u32, len: u32, erase_size: u32) -> Result<Self, RegionError> {
        let region = match Self::new(offset, len) {
            Ok(region) => region,
            Err(e) => return Err(e),
        };
        if !region.is_aligned_to(erase_size) {
            return Err(RegionError::Misaligned {
                offset,
                len,
                erase_size,
            });
        }
        Ok(region)
    }

    /// Start offset in bytes.
    #[inline]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Length in bytes.
    #[inline]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Regions are never empty; provided for API symmetry.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.offset + self.len
    }

    /// Whether both ends fall on `erase_size` boundaries.
    #[inline]
    pub const fn is_aligned_to(&self, erase_size: u32) -> bool {
        erase_size != 0 && self.offset % erase_size == 0 && self.len % erase_size == 0
    }

    /// Whether `[offset, offset + len)` lies inside this region.
    #[inline]
    pub const fn contains_range(&self, offset: u32, len: u32) -> bool {
        match offset.checked_add(len) {
            Some(end) => offset >= self.offset && end <= self.end(),
            None => false,
        }
    }

    /// Whether the two regions share at least one byte.
    #[inline]
    pub const fn overlaps(&self, other: &FlashRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Grow `[offset, offset + len)` outward to erase-block boundaries.
    ///
    /// Returns `None` when the widened span would overflow `u32`.
    pub const fn erase_span(offset: u32, len: u32, erase_size: u32) -> Option<FlashRegion> {
        if erase_size == 0 || len == 0 {
            return None;
        }
        let start = offset - offset % erase_size;
        let end = match offset.checked_add(len) {
            Some(end) => end,
            None => return None,
        };
        let end = match end.checked_add(erase_size - 1) {
            Some(padded) => padded - padded % erase_size,
            None => return None,
        };
        Some(FlashRegion {
            offset: start,
            len: end - start,
        })
    }
}

impl fmt::Display for FlashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.offset, self.end())
    }
}

/// Errors that can occur when creating a [`FlashRegion`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// Length is zero.
    Empty,
    /// `offset + len` does not fit in `u32`.
    Overflow {
        /// Requested offset.
        offset: u32,
        /// Requested length.
        len: u32,
    },
    /// Offset or length is not a multiple of the erase size.
    Misaligned {
        /// Requested offset.
        offset: u32,
        /// Requested length.
        len: u32,
        /// Erase granularity of the part.
        erase_size: u32,
    },
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Region length cannot be zero"),
            Self::Overflow { offset, len } => {
                write!(f, "Region {:#x}+{:#x} overflows the address space", offset, len)
            }
            Self::Misaligned {
                offset,
                len,
                erase_size,
            } => write!(
                f,
                "Region {:#x}+{:#x} is not aligned to erase size {:#x}",
                offset, len, erase_size
            ),
        }
    }
}

impl core::error::Error for RegionError {}
