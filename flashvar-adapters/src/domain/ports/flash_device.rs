//! FlashDevice port - Secondary (driven) port for raw flash I/O.
//!
//! This port defines what the storage engine needs from the physical medium.
//! It deliberately mirrors NOR flash semantics rather than block-device
//! semantics: writes can only clear bits, and the only way to set bits back
//! to `1` is an erase of whole erase blocks.

use core::fmt;

/// Value of every byte after an erase.
pub const ERASED_BYTE: u8 = 0xFF;

/// Port for raw flash operations at byte offsets.
///
/// This is a **secondary (driven) port** in hexagonal architecture terms.
/// The variable store and the fault-tolerant write engine depend on this
/// abstraction; adapters provide it on top of real or simulated parts.
///
/// ```text
/// ┌─────────────────────┐
/// │  Store / FTW engine │
/// └──────────┬──────────┘
///            │ depends on
///            ▼
/// ┌─────────────────────┐
/// │  FlashDevice Port   │  ◄── This trait
/// └──────────┬──────────┘
///            │ implemented by
///            ▼
/// ┌─────────────────────┐
/// │  NorFlashAdapter    │
/// │  RamFlash           │
/// └─────────────────────┘
/// ```
///
/// # Contract
///
/// - `write` never erases implicitly. Programming a byte stores
///   `old & new`; callers must only rely on bit-clearing transitions.
/// - `erase` works on whole erase blocks and leaves them reading
///   [`ERASED_BYTE`].
/// - Every operation either succeeds or reports an error. A failed
///   operation may have been partially applied (that is what a power cut
///   looks like), but success is never reported for partial work.
#[allow(async_fn_in_trait)]
pub trait FlashDevice {
    /// The error type reported by the medium.
    type Error: fmt::Debug + fmt::Display;

    /// Read `dest.len()` bytes starting at `offset`.
    async fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Program `src` at `offset` (bit-clear only).
    async fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), Self::Error>;

    /// Erase `len` bytes starting at `offset`.
    ///
    /// Both values must be multiples of [`FlashDevice::erase_size`].
    async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Self::Error>;

    /// Total addressable size in bytes.
    fn capacity(&self) -> u32;

    /// Erase granularity in bytes.
    fn erase_size(&self) -> u32;
}

impl<T: FlashDevice + ?Sized> FlashDevice for &mut T {
    type Error = T::Error;

    async fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        T::read(self, offset, dest).await
    }

    async fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), Self::Error> {
        T::write(self, offset, src).await
    }

    async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Self::Error> {
        T::erase(self, offset, len).await
    }

    fn capacity(&self) -> u32 {
        T::capacity(self)
    }

    fn erase_size(&self) -> u32 {
        T::erase_size(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal in-test flash so the port contract can be exercised without
    // pulling in the full simulated part.
    struct TinyFlash {
        data: [u8; 64],
    }

    #[derive(Debug)]
    struct TinyError;

    impl fmt::Display for TinyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "tiny flash error")
        }
    }

    impl FlashDevice for TinyFlash {
        type Error = TinyError;

        async fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start.checked_add(dest.len()).ok_or(TinyError)?;
            dest.copy_from_slice(self.data.get(start..end).ok_or(TinyError)?);
            Ok(())
        }

        async fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start.checked_add(src.len()).ok_or(TinyError)?;
            let cells = self.data.get_mut(start..end).ok_or(TinyError)?;
            for (cell, byte) in cells.iter_mut().zip(src) {
                *cell &= *byte;
            }
            Ok(())
        }

        async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + len as usize;
            self.data[start..end].fill(ERASED_BYTE);
            Ok(())
        }

        fn capacity(&self) -> u32 {
            self.data.len() as u32
        }

        fn erase_size(&self) -> u32 {
            16
        }
    }

    #[tokio::test]
    async fn test_write_only_clears_bits() {
        let mut flash = TinyFlash { data: [ERASED_BYTE; 64] };

        flash.write(0, &[0xF0]).await.unwrap();
        flash.write(0, &[0x0F]).await.unwrap();

        let mut out = [0u8; 1];
        flash.read(0, &mut out).await.unwrap();
        assert_eq!(out[0], 0x00);
    }

    #[tokio::test]
    async fn test_mut_ref_forwards() {
        let mut flash = TinyFlash { data: [ERASED_BYTE; 64] };
        {
            let mut borrowed = &mut flash;
            borrowed.write(16, &[0x12, 0x34]).await.unwrap();
            borrowed.erase(0, 16).await.unwrap();
            assert_eq!(borrowed.erase_size(), 16);
        }

        let mut out = [0u8; 2];
        flash.read(16, &mut out).await.unwrap();
        assert_eq!(out, [0x12, 0x34]);
    }
}
