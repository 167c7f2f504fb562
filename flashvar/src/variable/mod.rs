//! Persistent variable store.
//!
//! Variables are `(namespace, name) -> (attributes, value)` pairs kept as an
//! append-only log of records in one flash region:
//!
//! ```text
//!  ┌────────────┬──────────┬──────────┬──────────┬─────────────────────┐
//!  │ store hdr  │ record 0 │ record 1 │ record 2 │ erased (0xFF) ...   │
//!  │ (32 bytes) │          │          │          │                     │
//!  └────────────┴──────────┴──────────┴──────────┴─────────────────────┘
//!                                                ▲ tail
//! ```
//!
//! A record moves through its states by clearing bits of one byte:
//!
//! ```text
//!  erased ──► header-valid-only ──► added ──► in-deleted-transition ──► deleted
//!   0xFF           0x7F              0x3F             0x3E                0x3C
//! ```
//!
//! Updating a variable downgrades its live record to
//! `in-deleted-transition` before the replacement is appended, so after a
//! power loss at any point a scan still finds exactly one value to serve.

mod attributes;
mod header;
mod index;
mod lock;
pub mod record;
mod store;

pub use attributes::Attributes;
pub use header::{HeaderStatus, STORE_HEADER_LEN, STORE_SIGNATURE};
pub use index::VariableKey;
pub use lock::LockError;
pub use store::{StoreInfo, StoreStats, Variable, VariableStore, Variables};
