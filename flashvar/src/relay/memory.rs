//! Physical memory shared by both sides of the relay.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::relay::RelayError;

/// Byte-addressed memory both the caller and the isolated context can reach.
pub trait PhysicalMemory {
    /// Copy `dest.len()` bytes starting at `address`.
    fn read(&self, address: u64, dest: &mut [u8]) -> Result<(), RelayError>;

    /// Copy `src` to `address`.
    fn write(&mut self, address: u64, src: &[u8]) -> Result<(), RelayError>;
}

/// In-process [`PhysicalMemory`]: a window of RAM starting at `base`.
///
/// Clones share the same bytes, so the caller side and the isolated side
/// can each hold one.
#[derive(Debug, Clone)]
pub struct SharedMemory {
    base: u64,
    cells: Rc<RefCell<Vec<u8>>>,
}

impl SharedMemory {
    /// Zero-filled window `[base, base + len)`.
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            cells: Rc::new(RefCell::new(alloc::vec![0; len])),
        }
    }

    /// First address of the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Window length.
    pub fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite `[address, address + len)` with `byte`, e.g. to simulate a
    /// lost RAM image.
    pub fn fill(&self, address: u64, len: usize, byte: u8) -> Result<(), RelayError> {
        let range = self.range(address, len)?;
        self.cells.borrow_mut()[range].fill(byte);
        Ok(())
    }

    fn range(&self, address: u64, len: usize) -> Result<core::ops::Range<usize>, RelayError> {
        let outside = RelayError::InvalidParameter("address outside physical memory");
        let start = address
            .checked_sub(self.base)
            .and_then(|rel| usize::try_from(rel).ok())
            .ok_or(outside)?;
        let end = start.checked_add(len).ok_or(outside)?;
        if end > self.cells.borrow().len() {
            return Err(outside);
        }
        Ok(start..end)
    }
}

impl PhysicalMemory for SharedMemory {
    fn read(&self, address: u64, dest: &mut [u8]) -> Result<(), RelayError> {
        let range = self.range(address, dest.len())?;
        dest.copy_from_slice(&self.cells.borrow()[range]);
        Ok(())
    }

    fn write(&mut self, address: u64, src: &[u8]) -> Result<(), RelayError> {
        let range = self.range(address, src.len())?;
        self.cells.borrow_mut()[range].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_bytes() {
        let mut a = SharedMemory::new(0x1000, 64);
        let b = a.clone();
        a.write(0x1010, &[1, 2, 3]).unwrap();

        let mut out = [0u8; 3];
        b.read(0x1010, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_out_of_window_access_is_rejected() {
        let mut mem = SharedMemory::new(0x1000, 64);
        let mut out = [0u8; 4];
        assert!(mem.read(0xFFF, &mut out).is_err());
        assert!(mem.read(0x103E, &mut out).is_err());
        assert!(mem.write(u64::MAX, &[0]).is_err());
        assert!(mem.read(0x103C, &mut out).is_ok());
    }

    #[test]
    fn test_fill() {
        let mem = SharedMemory::new(0, 8);
        mem.fill(2, 4, 0xAA).unwrap();
        let mut out = [0u8; 8];
        mem.read(0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0xAA, 0xAA, 0xAA, 0xAA, 0, 0]);
    }
}
