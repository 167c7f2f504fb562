//! Simulated NOR flash part held in RAM.
//!
//! `RamFlash` behaves like a NOR part as far as the engine can tell: writes
//! can only clear bits, erases work on whole erase blocks, and power can be
//! cut after a precise number of programming steps. The last property is what
//! the crash-safety tests sweep over.
//!
//! # Power cuts
//!
//! Every programmed byte and every erased block costs one *step*. With
//! [`RamFlash::cut_power_after`] armed, the operation that exhausts the budget
//! is applied only up to the step that ran out (a torn write or a partial
//! multi-block erase) and fails with [`FlashError::PowerLoss`]. Every later
//! operation fails the same way until [`RamFlash::power_cycle`] is called.

extern crate alloc;

use alloc::vec::Vec;

use crate::adapters::error::FlashError;
use crate::domain::{ERASED_BYTE, FlashDevice};

/// Operation counters, useful for wear and step accounting in tests.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    /// Number of `write` calls that programmed at least one byte.
    pub writes: u64,
    /// Number of erase blocks erased.
    pub blocks_erased: u64,
    /// Number of bytes programmed.
    pub bytes_programmed: u64,
    /// Steps consumed (programmed bytes + erased blocks).
    pub steps: u64,
}

/// Simulated NOR flash with bit-clear writes and power-cut injection.
#[derive(Debug, Clone)]
pub struct RamFlash {
    data: Vec<u8>,
    erase_size: u32,
    strict: bool,
    budget: Option<u64>,
    powered: bool,
    fail_next_write: bool,
    stats: FlashStats,
}

impl RamFlash {
    /// Create an erased part of `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `erase_size` is zero or does not divide `capacity`.
    pub fn new(capacity: u32, erase_size: u32) -> Self {
        Self::from_image(alloc::vec![ERASED_BYTE; capacity as usize], erase_size)
    }

    /// Create a part from an existing image, e.g. one taken before a crash.
    ///
    /// # Panics
    /// Panics if `erase_size` is zero or does not divide the image length.
    pub fn from_image(data: Vec<u8>, erase_size: u32) -> Self {
        assert!(
            erase_size != 0 && data.len() % erase_size as usize == 0,
            "image length must be a multiple of the erase size"
        );
        Self {
            data,
            erase_size,
            strict: true,
            budget: None,
            powered: true,
            fail_next_write: false,
            stats: FlashStats::default(),
        }
    }

    /// Allow writes that would need to set bits (they are silently ANDed).
    ///
    /// Strict mode is on by default and turns such writes into
    /// [`FlashError::BitSet`], which catches engine bugs early.
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    /// Arm a power cut after `steps` more programming steps.
    pub fn cut_power_after(&mut self, steps: u64) {
        self.budget = Some(steps);
    }

    /// Restore power and disarm any pending cut. Flash contents are kept.
    pub fn power_cycle(&mut self) {
        self.powered = true;
        self.budget = None;
    }

    /// Whether the simulated supply is currently on.
    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Make the next `write` fail with [`FlashError::Injected`] without
    /// touching the medium.
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    /// Raw contents of the part.
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw contents, for corrupting images in tests.
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Operation counters.
    pub fn stats(&self) -> FlashStats {
        self.stats
    }

    fn check_powered(&self) -> Result<(), FlashError> {
        if self.powered {
            Ok(())
        } else {
            Err(FlashError::PowerLoss)
        }
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(FlashError::OutOfBounds {
                offset,
                len: len as u32,
            }),
        }
    }

    /// Take one step from the budget. Returns `false` once power is gone.
    fn take_step(&mut self) -> bool {
        match self.budget.as_mut() {
            Some(0) => {
                self.powered = false;
                false
            }
            Some(remaining) => {
                *remaining -= 1;
                self.stats.steps += 1;
                true
            }
            None => {
                self.stats.steps += 1;
                true
            }
        }
    }
}

impl FlashDevice for RamFlash {
    type Error = FlashError;

    async fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        self.check_powered()?;
        let range = self.range(offset, dest.len())?;
        dest.copy_from_slice(&self.data[range]);
        Ok(())
    }

    async fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), Self::Error> {
        self.check_powered()?;
        if core::mem::take(&mut self.fail_next_write) {
            return Err(FlashError::Injected);
        }
        let range = self.range(offset, src.len())?;

        if self.strict {
            for (i, (old, new)) in self.data[range.clone()].iter().zip(src).enumerate() {
                if old & new != *new {
                    return Err(FlashError::BitSet {
                        offset: offset + i as u32,
                    });
                }
            }
        }

        if !src.is_empty() {
            self.stats.writes += 1;
        }
        for (i, byte) in src.iter().enumerate() {
            if !self.take_step() {
                return Err(FlashError::PowerLoss);
            }
            self.data[range.start + i] &= *byte;
            self.stats.bytes_programmed += 1;
        }
        Ok(())
    }

    async fn erase(&mut self, offset: u32, len: u32) -> Result<(), Self::Error> {
        self.check_powered()?;
        if offset % self.erase_size != 0 || len % self.erase_size != 0 {
            return Err(FlashError::Misaligned { offset, len });
        }
        let range = self.range(offset, len as usize)?;

        for block in range.step_by(self.erase_size as usize) {
            if !self.take_step() {
                return Err(FlashError::PowerLoss);
            }
            self.data[block..block + self.erase_size as usize].fill(ERASED_BYTE);
            self.stats.blocks_erased += 1;
        }
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase_size(&self) -> u32 {
        self.erase_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_program_and_read() {
        let mut flash = RamFlash::new(256, 64);
        flash.write(10, &[0x12, 0x34]).await.unwrap();

        let mut out = [0u8; 4];
        flash.read(9, &mut out).await.unwrap();
        assert_eq!(out, [0xFF, 0x12, 0x34, 0xFF]);
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_bit_set() {
        let mut flash = RamFlash::new(256, 64);
        flash.write(0, &[0x0F]).await.unwrap();

        let err = flash.write(0, &[0xF0]).await.unwrap_err();
        assert_eq!(err, FlashError::BitSet { offset: 0 });

        let mut lenient = RamFlash::new(256, 64).lenient();
        lenient.write(0, &[0x0F]).await.unwrap();
        lenient.write(0, &[0xF0]).await.unwrap();
        assert_eq!(lenient.image()[0], 0x00);
    }

    #[tokio::test]
    async fn test_erase_is_block_granular() {
        let mut flash = RamFlash::new(256, 64);
        flash.write(0, &[0u8; 128]).await.unwrap();
        flash.erase(64, 64).await.unwrap();

        assert!(flash.image()[..64].iter().all(|b| *b == 0));
        assert!(flash.image()[64..128].iter().all(|b| *b == ERASED_BYTE));
        assert_eq!(
            flash.erase(1, 64).await.unwrap_err(),
            FlashError::Misaligned { offset: 1, len: 64 }
        );
    }

    #[tokio::test]
    async fn test_power_cut_tears_write() {
        let mut flash = RamFlash::new(256, 64);
        flash.cut_power_after(3);

        let err = flash.write(0, &[0u8; 8]).await.unwrap_err();
        assert_eq!(err, FlashError::PowerLoss);
        assert_eq!(&flash.image()[..4], &[0, 0, 0, 0xFF]);
        assert!(!flash.is_powered());

        let mut out = [0u8; 1];
        assert_eq!(flash.read(0, &mut out).await.unwrap_err(), FlashError::PowerLoss);

        flash.power_cycle();
        flash.read(0, &mut out).await.unwrap();
        assert_eq!(out[0], 0);
    }

    #[tokio::test]
    async fn test_power_cut_during_multi_block_erase() {
        let mut flash = RamFlash::new(256, 64);
        flash.write(0, &[0u8; 256]).await.unwrap();
        flash.cut_power_after(2);

        assert_eq!(flash.erase(0, 256).await.unwrap_err(), FlashError::PowerLoss);
        assert!(flash.image()[..128].iter().all(|b| *b == ERASED_BYTE));
        assert!(flash.image()[128..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_injected_write_failure_leaves_medium_untouched() {
        let mut flash = RamFlash::new(128, 64);
        flash.fail_next_write();

        assert_eq!(flash.write(0, &[0]).await.unwrap_err(), FlashError::Injected);
        assert_eq!(flash.image()[0], ERASED_BYTE);
        flash.write(0, &[0]).await.unwrap();
        assert_eq!(flash.image()[0], 0);
    }

    #[tokio::test]
    async fn test_stats_count_steps() {
        let mut flash = RamFlash::new(128, 64);
        flash.write(0, &[0u8; 5]).await.unwrap();
        flash.erase(0, 128).await.unwrap();

        let stats = flash.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_programmed, 5);
        assert_eq!(stats.blocks_erased, 2);
        assert_eq!(stats.steps, 7);
    }
}
