//! Ports define the interfaces between the storage engine and the medium.
//!
//! This module contains the **secondary (driven) ports** that the engine
//! depends on for raw flash access.

mod flash_device;

pub use flash_device::{ERASED_BYTE, FlashDevice};
