//! Raw flash adapters with hexagonal architecture.
//!
//! This crate provides the Block I/O port used by `flashvar` together with
//! adapters for real and simulated NOR flash, structured using hexagonal
//! architecture (ports and adapters pattern).
//!
//! # Architecture
//!
//! ## Domain Layer (`domain`)
//! Flash semantics with no infrastructure dependencies:
//! - **Value Objects**: `FlashRegion`
//! - **Ports**: `FlashDevice` interface (bit-clear writes, block erases)
//!
//! ## Adapter Layer (`adapters`)
//! Concrete implementations connecting the port to a medium:
//! - **`NorFlashAdapter`**: any `embedded-storage` NOR part
//! - **`RamFlash`**: RAM-backed part with power-cut injection (requires `alloc`)
//!
//! # Quick Start
//!
//! ```ignore
//! use flashvar_adapters::{FlashDevice, NorFlashAdapter, NorFlashConfig};
//!
//! let mut device = NorFlashAdapter::new(MyFlash::new(), NorFlashConfig::default_4mb());
//! device.erase(0, device.erase_size()).await?;
//! device.write(0, b"FVS1").await?;
//! ```
//!
//! # Features
//!
//! - `embedded-storage`: Enable the NOR flash adapter (default)
//! - `alloc`: Enable the simulated `RamFlash` part (default)
//! - `defmt`: Enable defmt formatting for embedded

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![allow(async_fn_in_trait)]

pub mod adapters;
pub mod domain;

pub use domain::{ERASED_BYTE, FlashDevice, FlashRegion, RegionError};

pub use adapters::FlashError;

#[cfg(feature = "alloc")]
pub use adapters::{FlashStats, RamFlash};

#[cfg(feature = "embedded-storage")]
pub use adapters::{NOR_FLASH_SECTOR_SIZE, NorFlashAdapter, NorFlashConfig, NorFlashError};
