//! Configuration for the store, the FTW engine and the relay.
//!
//! Region placement comes from the platform's flash map; the limits and the
//! checksum are policy, exposed here rather than baked into the engines.

use core::fmt;

use flashvar_adapters::FlashRegion;

use crate::variable::record::{RECORD_ALIGNMENT, RECORD_HEADER_LEN};

/// Bounds on variable names and values.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    /// Maximum name length in bytes (UTF-8).
    pub max_name_len: u32,
    /// Maximum value length in bytes.
    pub max_value_len: u32,
}

impl RecordLimits {
    /// 256-byte names, 8 KiB values.
    pub const DEFAULT: RecordLimits = RecordLimits::new(256, 8 * 1024);

    /// Create limits.
    pub const fn new(max_name_len: u32, max_value_len: u32) -> Self {
        Self {
            max_name_len,
            max_value_len,
        }
    }

    /// Set the name limit.
    pub const fn with_max_name_len(mut self, max_name_len: u32) -> Self {
        self.max_name_len = max_name_len;
        self
    }

    /// Set the value limit.
    pub const fn with_max_value_len(mut self, max_value_len: u32) -> Self {
        self.max_value_len = max_value_len;
        self
    }

    /// Size of the largest record these limits allow, padding included.
    ///
    /// `None` if it does not fit in 32 bits.
    pub const fn max_record_size(&self) -> Option<u32> {
        record_size(self.max_name_len, self.max_value_len)
    }
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// On-flash size of a record, padding included. Overflow-checked.
pub(crate) const fn record_size(name_len: u32, value_len: u32) -> Option<u32> {
    let Some(body) = name_len.checked_add(value_len) else {
        return None;
    };
    let Some(raw) = body.checked_add(RECORD_HEADER_LEN as u32) else {
        return None;
    };
    let Some(padded) = raw.checked_add(RECORD_ALIGNMENT - 1) else {
        return None;
    };
    Some(padded & !(RECORD_ALIGNMENT - 1))
}

/// Placement and limits of the variable store.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Region holding the store header and the record log. Must be
    /// erase-aligned and no larger than the FTW spare region.
    pub region: FlashRegion,
    /// Name and value bounds.
    pub limits: RecordLimits,
}

impl StoreConfig {
    /// Store over `region` with default limits.
    pub const fn new(region: FlashRegion) -> Self {
        Self {
            region,
            limits: RecordLimits::DEFAULT,
        }
    }

    /// Replace the record limits.
    pub const fn with_limits(mut self, limits: RecordLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Placement and checksum of the FTW engine.
#[derive(Clone, Copy)]
pub struct FtwConfig {
    /// Region whose first erase block holds the working-block header.
    pub working_region: FlashRegion,
    /// Scratch region staging new content. Bounds the transaction size.
    pub spare_region: FlashRegion,
    /// Caller memory where the transaction record is staged for the relay.
    pub record_address: u64,
    /// Checksum for the working-block header and the spare payload.
    pub crc: &'static crc::Algorithm<u32>,
}

impl FtwConfig {
    /// Default record staging address.
    pub const DEFAULT_RECORD_ADDRESS: u64 = 0x1000;

    /// Create a configuration with CRC-32 (ISO-HDLC).
    pub const fn new(working_region: FlashRegion, spare_region: FlashRegion) -> Self {
        Self {
            working_region,
            spare_region,
            record_address: Self::DEFAULT_RECORD_ADDRESS,
            crc: &crc::CRC_32_ISO_HDLC,
        }
    }

    /// Stage the transaction record at `address`.
    pub const fn with_record_address(mut self, address: u64) -> Self {
        self.record_address = address;
        self
    }

    /// Use another CRC-32 variant.
    pub const fn with_crc(mut self, crc: &'static crc::Algorithm<u32>) -> Self {
        self.crc = crc;
        self
    }
}

impl fmt::Debug for FtwConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtwConfig")
            .field("working_region", &self.working_region)
            .field("spare_region", &self.spare_region)
            .field("record_address", &self.record_address)
            .field("crc_check", &self.crc.check)
            .finish()
    }
}

/// Capacity of the isolated context behind the relay.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Total bytes of saved buffers.
    pub capacity_bytes: usize,
    /// Number of distinct tags.
    pub max_entries: usize,
}

impl RelayConfig {
    /// 4 KiB across 16 tags.
    pub const DEFAULT: RelayConfig = RelayConfig::new(4096, 16);

    /// Create a configuration.
    pub const fn new(capacity_bytes: usize, max_entries: usize) -> Self {
        Self {
            capacity_bytes,
            max_entries,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_is_padded() {
        assert_eq!(record_size(1, 1), Some(40));
        assert_eq!(record_size(0, 0), Some(36));
        assert_eq!(record_size(4, 0), Some(40));
        assert_eq!(record_size(5, 0), Some(44));
    }

    #[test]
    fn test_record_size_overflow_is_detected() {
        assert_eq!(record_size(u32::MAX, 1), None);
        assert_eq!(record_size(u32::MAX - 40, 0), None);
        assert_eq!(RecordLimits::new(u32::MAX, u32::MAX).max_record_size(), None);
    }

    #[test]
    fn test_default_limits() {
        let limits = RecordLimits::default();
        assert_eq!(limits.max_name_len, 256);
        assert_eq!(limits.max_value_len, 8192);
        assert_eq!(limits.max_record_size(), Some(36 + 256 + 8192));
    }

    #[test]
    fn test_builders() {
        let region = FlashRegion::new(0, 4096).unwrap();
        let config = StoreConfig::new(region).with_limits(RecordLimits::DEFAULT.with_max_value_len(64));
        assert_eq!(config.limits.max_value_len, 64);

        let ftw = FtwConfig::new(region, region).with_record_address(0x2000);
        assert_eq!(ftw.record_address, 0x2000);
        assert_eq!(ftw.crc.check, crc::CRC_32_ISO_HDLC.check);
    }
}
