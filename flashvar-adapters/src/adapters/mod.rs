//! Adapter layer - Concrete implementations of the flash port.
//!
//! ```text
//!     ┌──────────────────────────────────┐
//!     │      Domain Layer                │
//!     │  - FlashDevice (port)            │
//!     └────────────┬─────────────────────┘
//!                  │ implements
//!                  ▼
//!     ┌──────────────────────────────────┐
//!     │      Adapter Layer               │  ◄── This module
//!     │  - NorFlashAdapter               │
//!     │  - RamFlash                      │
//!     └────────────┬─────────────────────┘
//!                  │ uses
//!                  ▼
//!     ┌──────────────────────────────────┐
//!     │  Infrastructure (NOR part / RAM) │
//!     └──────────────────────────────────┘
//! ```
//!
//! # Available Adapters
//!
//! - **`NorFlashAdapter`**: window of an `embedded-storage` NOR part
//! - **`RamFlash`**: simulated part with power-cut injection (requires `alloc`)

mod error;

#[cfg(feature = "alloc")]
mod ram_flash;

#[cfg(feature = "embedded-storage")]
mod nor_flash_adapter;

pub use error::FlashError;

#[cfg(feature = "alloc")]
pub use ram_flash::{FlashStats, RamFlash};

#[cfg(feature = "embedded-storage")]
pub use nor_flash_adapter::{NOR_FLASH_SECTOR_SIZE, NorFlashAdapter, NorFlashConfig, NorFlashError};
