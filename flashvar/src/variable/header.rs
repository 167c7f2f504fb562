//! Store header at the start of the store region.

use flashvar_adapters::ERASED_BYTE;

use crate::marker::{FlashMarker, StoreHealth};

/// Identifies a formatted store.
pub const STORE_SIGNATURE: [u8; 4] = *b"FVS1";
/// Header length; the first record follows it.
pub const STORE_HEADER_LEN: u32 = 32;
/// Format marker value.
pub const FORMATTED: u8 = 0x5A;
/// Offset of the health marker.
pub const HEALTH_OFFSET: u32 = 9;

/// What the header at the start of a region says.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// Erased, half-written or foreign: the region needs formatting.
    Unformatted,
    /// Formatted, with the given health.
    Formatted(StoreHealth),
}

/// Header of a freshly formatted region.
pub fn encode(region_len: u32) -> [u8; STORE_HEADER_LEN as usize] {
    let mut buf = [ERASED_BYTE; STORE_HEADER_LEN as usize];
    buf[0..4].copy_from_slice(&STORE_SIGNATURE);
    buf[4..8].copy_from_slice(&region_len.to_le_bytes());
    buf[8] = FORMATTED;
    buf[HEALTH_OFFSET as usize] = StoreHealth::Healthy.to_byte();
    buf
}

/// Classify a header read from a region of `region_len` bytes.
pub fn inspect(buf: &[u8; STORE_HEADER_LEN as usize], region_len: u32) -> HeaderStatus {
    let size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if buf[0..4] != STORE_SIGNATURE || size != region_len || buf[8] != FORMATTED {
        return HeaderStatus::Unformatted;
    }
    // Anything but the healthy encoding means a downgrade was at least begun.
    let health = StoreHealth::from_byte(buf[HEALTH_OFFSET as usize]).unwrap_or(StoreHealth::Damaged);
    HeaderStatus::Formatted(health)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_header_is_healthy() {
        let buf = encode(4096);
        assert_eq!(&buf[0..4], b"FVS1");
        assert_eq!(buf[8], 0x5A);
        assert_eq!(buf[9], 0xFE);
        assert!(buf[10..].iter().all(|b| *b == 0xFF));
        assert_eq!(inspect(&buf, 4096), HeaderStatus::Formatted(StoreHealth::Healthy));
    }

    #[test]
    fn test_unformatted_regions() {
        assert_eq!(inspect(&[0xFF; 32], 4096), HeaderStatus::Unformatted);
        // Size from another layout.
        assert_eq!(inspect(&encode(8192), 4096), HeaderStatus::Unformatted);
        // Torn before the format marker landed.
        let mut torn = encode(4096);
        torn[8] = 0xFF;
        assert_eq!(inspect(&torn, 4096), HeaderStatus::Unformatted);
    }

    #[test]
    fn test_damaged_health() {
        let mut buf = encode(4096);
        buf[9] = StoreHealth::Damaged.to_byte();
        assert_eq!(inspect(&buf, 4096), HeaderStatus::Formatted(StoreHealth::Damaged));
    }
}
