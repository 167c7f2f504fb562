//! NOR Flash adapter for embedded-storage traits
//!
//! This module provides an adapter that wraps types implementing
//! `embedded-storage` NOR flash traits and exposes a window of the part as a
//! [`FlashDevice`].
//!
//! # Example
//!
//! ```ignore
//! use esp_storage::FlashStorage as EspFlash;
//! use flashvar_adapters::{NorFlashAdapter, NorFlashConfig};
//!
//! let esp_flash = EspFlash::new();
//! let config = NorFlashConfig::new(0x3C_0000, 0x4_0000); // 256KB at offset
//! let device = NorFlashAdapter::new(esp_flash, config);
//! ```

use aligned::{A4, Aligned};
use embedded_storage::nor_flash::{NorFlash, NorFlashError as _, NorFlashErrorKind, ReadNorFlash};

use crate::domain::{ERASED_BYTE, FlashDevice};

/// Size of the aligned bounce buffer used to satisfy `READ_SIZE`/`WRITE_SIZE`.
const BOUNCE_SIZE: usize = 256;

/// Default sector size assumed by the presets (4KB).
pub const NOR_FLASH_SECTOR_SIZE: u32 = 4096;

/// Configuration for the flash window used by the store.
///
/// Defines where in flash the window starts and how large it is.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NorFlashConfig {
    /// Start offset in flash (must be sector-aligned)
    pub start_offset: u32,
    /// Size of the window in bytes (must be a multiple of the sector size)
    pub size: u32,
}

impl NorFlashConfig {
    /// Create a new flash configuration
    ///
    /// # Arguments
    /// * `start_offset` - Byte offset in flash
    /// * `size` - Window size in bytes
    ///
    /// Alignment against the part's erase size is checked by
    /// [`NorFlashAdapter::new`].
    pub const fn new(start_offset: u32, size: u32) -> Self {
        Self { start_offset, size }
    }

    /// Default config using the last 256KB of a 4MB flash
    pub const fn default_4mb() -> Self {
        Self::new(0x3C_0000, 64 * NOR_FLASH_SECTOR_SIZE)
    }

    /// Default config using the last 1MB of a 16MB flash
    pub const fn default_16mb() -> Self {
        Self::new(0xF0_0000, 256 * NOR_FLASH_SECTOR_SIZE)
    }

    /// One past the last byte of the window on the underlying part.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.start_offset + self.size
    }
}

impl Default for NorFlashConfig {
    fn default() -> Self {
        Self::default_4mb()
    }
}

/// Error type for NOR flash operations
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NorFlashError {
    /// Access falls outside the configured window.
    OutOfWindow {
        /// Offset relative to the window.
        offset: u32,
        /// Length of the access.
        len: u32,
    },
    /// The part reported an alignment violation.
    NotAligned,
    /// The part reported an out-of-bounds access.
    OutOfBounds,
    /// Any other failure reported by the part.
    Other,
}

impl NorFlashError {
    fn from_kind(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::NotAligned => Self::NotAligned,
            NorFlashErrorKind::OutOfBounds => Self::OutOfBounds,
            _ => Self::Other,
        }
    }
}

impl core::fmt::Display for NorFlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfWindow { offset, len } => {
                write!(f, "NOR flash access {:#x}+{:#x} outside window", offset, len)
            }
            Self::NotAligned => write!(f, "NOR flash alignment error"),
            Self::OutOfBounds => write!(f, "NOR flash out of bounds"),
            Self::Other => write!(f, "NOR flash error"),
        }
    }
}

impl core::error::Error for NorFlashError {}

/// Adapter that exposes a window of an embedded-storage NOR part as a
/// [`FlashDevice`].
///
/// Works with ESP32 internal flash, external SPI flash, or any other
/// `embedded-storage` compatible part. Accesses that are not aligned to the
/// part's `READ_SIZE`/`WRITE_SIZE` go through a 4-byte aligned bounce buffer;
/// write padding uses `0xFF`, which leaves already-programmed bits untouched.
///
/// # Example
///
/// ```ignore
/// use esp_storage::FlashStorage as EspFlash;
/// use flashvar_adapters::{NorFlashAdapter, NorFlashConfig};
///
/// let flash = EspFlash::new();
/// let adapter = NorFlashAdapter::new(flash, NorFlashConfig::default_4mb());
/// ```
pub struct NorFlashAdapter<F> {
    flash: F,
    config: NorFlashConfig,
}

impl<F: NorFlash> NorFlashAdapter<F> {
    /// Create a new NOR flash adapter
    ///
    /// # Panics
    /// Panics if the window is not aligned to `F::ERASE_SIZE`, does not fit on
    /// the part, or the part's read/write granularity exceeds the bounce buffer.
    pub fn new(flash: F, config: NorFlashConfig) -> Self {
        let erase = F::ERASE_SIZE as u32;
        assert!(
            config.start_offset % erase == 0 && config.size % erase == 0,
            "window must be aligned to the erase size"
        );
        assert!(
            config.start_offset.checked_add(config.size).is_some()
                && config.end() as usize <= flash.capacity(),
            "window must fit on the part"
        );
        assert!(
            BOUNCE_SIZE % F::READ_SIZE == 0 && BOUNCE_SIZE % F::WRITE_SIZE == 0,
            "read/write granularity must divide the bounce buffer"
        );
        Self { flash, config }
    }
}

impl<F> NorFlashAdapter<F> {
    /// Get the configuration
    pub fn config(&self) -> &NorFlashConfig {
        &self.config
    }

    /// Consume the adapter and return the underlying flash
    pub fn into_inner(self) -> F {
        self.flash
    }

    fn check_window(&self, offset: u32, len: u32) -> Result<u32, NorFlashError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.config.size => Ok(self.config.start_offset + offset),
            _ => Err(NorFlashError::OutOfWindow { offset, len }),
        }
    }
}

impl<F> FlashDevice for NorFlashAdapter<F>
where
    F: NorFlash + ReadNorFlash,
{
    type Error = NorFlashError;

    async fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let mut absolute = self.check_window(offset, dest.len() as u32)?;
        let granule = F::READ_SIZE as u32;
        let mut bounce: Aligned<A4, [u8; BOUNCE_SIZE]> = Aligned([0u8; BOUNCE_SIZE]);
        let mut done = 0usize;

        while done < dest.len() {
            let aligned_start = absolute - absolute % granule;
            let skip = (absolute - aligned_start) as usize;
            let wanted = (dest.len() - done).min(BOUNCE_SIZE - skip);
            let span = (skip + wanted).next_multiple_of(F::READ_SIZE);

            self.flash
                .read(aligned_start, &mut bounce[..span])
                .map_err(|e| NorFlashError::from_kind(e.kind()))?;
            dest[done..done + wanted].copy_from_slice(&bounce[skip..skip + wanted]);

            done += wanted;
            absolute += wanted as u32;
        }
        Ok(())
    }

    async fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), Self::Error> {
        let mut absolute = self.check_window(offset, src.len() as u32)?;
        let granule = F::WRITE_SIZE as u32;
        let mut bounce: Aligned<A4, [u8; BOUNCE_SIZE]> = Aligned([ERASED_BYTE; BOUNCE_SIZE]);
        let mut done = 0usize;

        while done < src.len() {
            let aligned_start = absolute - absolute % granule;
            let skip = (absolute - aligned_start) as usize;
            let wanted = (src.len() - done).min(BOUNCE_SIZE - skip);
            let span = (skip + wanted).next_multiple_of(F::WRITE_SIZE);

            bounce[..span].fill(ERASED_BYTE);
            bounce[skip..skip + wanted].copy_from_slice(&src[done..done + wanted]);
            self.flash
                .write(aligned_start, &bounce[..span])
                .map_err(|e| NorFlashError::from_kind(e.kind()))?;

            done += wanted;
            absolute += wanted as u32;
        }
        Ok(())
    }

    async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Self::Error> {
        let from = self.check_window(offset, len)?;
        self.flash
            .erase(from, from + len)
            .map_err(|e| NorFlashError::from_kind(e.kind()))
    }

    fn capacity(&self) -> u32 {
        self.config.size
    }

    fn erase_size(&self) -> u32 {
        F::ERASE_SIZE as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTOR: usize = NOR_FLASH_SECTOR_SIZE as usize;

    /// Mock NOR flash with 4-byte program granularity, like most SPI parts
    /// behind a cache controller.
    struct MockFlash {
        data: [[u8; SECTOR]; 8],
    }

    impl MockFlash {
        fn new() -> Self {
            Self {
                data: [[0xFF; SECTOR]; 8],
            }
        }

        fn byte(&self, absolute: usize) -> u8 {
            self.data[absolute / SECTOR][absolute % SECTOR]
        }
    }

    impl embedded_storage::nor_flash::ErrorType for MockFlash {
        type Error = MockFlashError;
    }

    #[derive(Debug)]
    struct MockFlashError(NorFlashErrorKind);

    impl embedded_storage::nor_flash::NorFlashError for MockFlashError {
        fn kind(&self) -> NorFlashErrorKind {
            self.0
        }
    }

    impl ReadNorFlash for MockFlash {
        const READ_SIZE: usize = 4;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            if offset as usize % Self::READ_SIZE != 0 || bytes.len() % Self::READ_SIZE != 0 {
                return Err(MockFlashError(NorFlashErrorKind::NotAligned));
            }
            for (i, byte) in bytes.iter_mut().enumerate() {
                let absolute = offset as usize + i;
                if absolute >= self.capacity() {
                    return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
                }
                *byte = self.byte(absolute);
            }
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len() * SECTOR
        }
    }

    impl NorFlash for MockFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from as usize % SECTOR != 0 || to as usize % SECTOR != 0 {
                return Err(MockFlashError(NorFlashErrorKind::NotAligned));
            }
            for sector in (from as usize / SECTOR)..(to as usize / SECTOR) {
                self.data[sector] = [0xFF; SECTOR];
            }
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
                return Err(MockFlashError(NorFlashErrorKind::NotAligned));
            }
            for (i, byte) in bytes.iter().enumerate() {
                let absolute = offset as usize + i;
                self.data[absolute / SECTOR][absolute % SECTOR] &= *byte;
            }
            Ok(())
        }
    }

    fn block_on<F: core::future::Future>(f: F) -> F::Output {
        use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

        fn raw_waker() -> RawWaker {
            fn no_op(_: *const ()) {}
            fn clone(_: *const ()) -> RawWaker { raw_waker() }
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
            RawWaker::new(core::ptr::null(), &VTABLE)
        }

        let waker = unsafe { Waker::from_raw(raw_waker()) };
        let mut cx = Context::from_waker(&waker);
        let mut f = core::pin::pin!(f);

        loop {
            match f.as_mut().poll(&mut cx) {
                Poll::Ready(val) => return val,
                Poll::Pending => {}
            }
        }
    }

    #[test]
    fn test_unaligned_write_and_read_back() {
        block_on(async {
            let config = NorFlashConfig::new(SECTOR as u32, 2 * SECTOR as u32);
            let mut adapter = NorFlashAdapter::new(MockFlash::new(), config);

            adapter.write(3, &[0x11, 0x22, 0x33]).await.unwrap();

            let mut out = [0u8; 5];
            adapter.read(2, &mut out).await.unwrap();
            assert_eq!(out, [0xFF, 0x11, 0x22, 0x33, 0xFF]);

            // Window start is honoured on the raw part.
            let flash = adapter.into_inner();
            assert_eq!(flash.byte(SECTOR + 3), 0x11);
        });
    }

    #[test]
    fn test_write_spanning_bounce_buffer() {
        block_on(async {
            let config = NorFlashConfig::new(0, 2 * SECTOR as u32);
            let mut adapter = NorFlashAdapter::new(MockFlash::new(), config);

            let payload: [u8; 700] = core::array::from_fn(|i| i as u8);
            adapter.write(1, &payload).await.unwrap();

            let mut out = [0u8; 700];
            adapter.read(1, &mut out).await.unwrap();
            assert_eq!(out, payload);
        });
    }

    #[test]
    fn test_erase_restores_ones() {
        block_on(async {
            let config = NorFlashConfig::new(0, 2 * SECTOR as u32);
            let mut adapter = NorFlashAdapter::new(MockFlash::new(), config);

            adapter.write(0, &[0u8; 8]).await.unwrap();
            adapter.erase(0, SECTOR as u32).await.unwrap();

            let mut out = [0u8; 8];
            adapter.read(0, &mut out).await.unwrap();
            assert_eq!(out, [0xFF; 8]);
            assert_eq!(adapter.erase_size(), SECTOR as u32);
            assert_eq!(adapter.capacity(), 2 * SECTOR as u32);
        });
    }

    #[test]
    fn test_access_outside_window_rejected() {
        block_on(async {
            let config = NorFlashConfig::new(0, SECTOR as u32);
            let mut adapter = NorFlashAdapter::new(MockFlash::new(), config);

            let err = adapter.write(SECTOR as u32 - 1, &[0, 0]).await.unwrap_err();
            assert!(matches!(err, NorFlashError::OutOfWindow { .. }));
        });
    }

    #[test]
    fn test_config_presets() {
        let config_4mb = NorFlashConfig::default_4mb();
        assert_eq!(config_4mb.start_offset, 0x3C_0000);
        assert_eq!(config_4mb.size, 0x4_0000);

        let config_16mb = NorFlashConfig::default_16mb();
        assert_eq!(config_16mb.start_offset, 0xF0_0000);
        assert_eq!(config_16mb.end(), 0x100_0000);
    }

    #[test]
    #[should_panic(expected = "aligned to the erase size")]
    fn test_config_unaligned() {
        let _ = NorFlashAdapter::new(MockFlash::new(), NorFlashConfig::new(0x100, SECTOR as u32));
    }
}
