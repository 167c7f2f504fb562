//! Domain layer - flash semantics with zero infrastructure dependencies.
//!
//! The domain layer contains:
//! - **Value Objects**: validated data (e.g., `FlashRegion`)
//! - **Ports**: the interface to the physical medium (`FlashDevice`)
//!
//! # Hexagonal Architecture
//!
//! ```text
//!     ┌──────────────────────────────────┐
//!     │      Domain Layer (Core)         │
//!     │  ┌────────────────────────────┐  │
//!     │  │  Value Objects             │  │
//!     │  │  - FlashRegion             │  │
//!     │  └────────────────────────────┘  │
//!     │  ┌────────────────────────────┐  │
//!     │  │  Ports (Interfaces)        │  │
//!     │  │  - FlashDevice             │  │
//!     │  └────────────────────────────┘  │
//!     └──────────────────────────────────┘
//!                    ▲
//!                    │ implemented by
//!     ┌──────────────────────────────────┐
//!     │      Adapter Layer               │
//!     │  - NorFlashAdapter               │
//!     │  - RamFlash                      │
//!     └──────────────────────────────────┘
//! ```

pub mod ports;
pub mod value_objects;

pub use ports::{ERASED_BYTE, FlashDevice};
pub use value_objects::{FlashRegion, RegionError};
