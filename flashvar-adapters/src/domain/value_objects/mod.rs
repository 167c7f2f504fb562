//! Value objects for the domain layer.
//!
//! Value objects are immutable, validated data types. They keep raw `u32`
//! offsets from being mixed up with lengths or unchecked ranges.

mod flash_region;

pub use flash_region::{FlashRegion, RegionError};
