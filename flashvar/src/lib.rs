//! A crash-safe variable store for raw NOR flash.
//!
//! `flashvar` keeps small named values (boot configuration, platform
//! settings, error records) on flash that can only clear bits and erase whole
//! blocks, and survives power loss at any instant.
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────────────────┐
//!   │     VariableStore      │  get / put / delete / enumerate / reclaim
//!   └───────────┬────────────┘
//!               │ appends and in-place downgrades; reclaim via transaction
//!               ▼
//!   ┌────────────────────────┐        ┌────────────────────────┐
//!   │       FtwEngine        │ ─────► │  SecureRelay (relay)   │
//!   │  working block + spare │ record │  isolated buffer copy  │
//!   └───────────┬────────────┘  copy  └────────────────────────┘
//!               │ FlashDevice port
//!               ▼
//!   ┌────────────────────────┐
//!   │   flashvar-adapters    │  NorFlashAdapter, RamFlash
//!   └────────────────────────┘
//! ```
//!
//! - [`variable`]: the record log, its index and the store operations
//! - [`ftw`]: two-phase fault-tolerant writes through a spare region
//! - [`relay`]: buffers kept by an isolated execution context
//!
//! # Usage
//!
//! ```ignore
//! use flashvar::{Attributes, FtwConfig, FtwEngine, Guid, StoreConfig, VariableStore};
//! use flashvar_adapters::{FlashRegion, RamFlash};
//!
//! let flash = RamFlash::new(0x10000, 0x1000);
//! let ftw = FtwEngine::new(
//!     flash,
//!     relay,
//!     FtwConfig::new(FlashRegion::new(0xE000, 0x1000)?, FlashRegion::new(0x8000, 0x6000)?),
//! )?;
//! let mut store = VariableStore::open(ftw, StoreConfig::new(FlashRegion::new(0, 0x6000)?)).await?;
//!
//! store.put(VENDOR, "Timeout", &5u16.to_le_bytes(), Attributes::NV_BS_RT).await?;
//! ```
//!
//! # Features
//!
//! - `std`: implement `std` traits for errors (default)
//! - `log`: log through the `log` crate (default)
//! - `defmt`: log through `defmt` and derive `defmt::Format`

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![allow(async_fn_in_trait)]

extern crate alloc;

#[macro_use]
mod log_macros;

mod config;
mod error;
pub mod ftw;
mod guid;
mod marker;
pub mod relay;
pub mod variable;

pub use config::{FtwConfig, RecordLimits, RelayConfig, StoreConfig};
pub use error::Error;
pub use ftw::{FtwEngine, FtwState, RecoveryOutcome, TransactionHandle, TransactionWriter};
pub use guid::Guid;
pub use marker::{
    FlashMarker, IllegalTransition, RecordState, StoreHealth, TxnPhase, WorkingBlockState,
};
pub use relay::{RelayClient, RelayError, RelayService, RestorePolicy, SecureRelay, SharedMemory};
pub use variable::{Attributes, StoreInfo, StoreStats, Variable, VariableKey, VariableStore};
