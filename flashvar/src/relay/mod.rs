//! Secure buffer relay.
//!
//! Hands caller buffers to an isolated execution context that keeps them in
//! its own storage and gives them back on request, or writes them back to
//! their original address at a checkpoint.
//!
//! ```text
//!     caller side                          isolated side
//!   ┌─────────────────┐   call(cmd, ParamBlock)   ┌──────────────────┐
//!   │  RelayClient    │ ─────────────────────────► │  RelayService    │
//!   │  (SecureRelay)  │ ◄───────────────────────── │  saved buffers   │
//!   └────────┬────────┘    RelayResponse           └────────┬─────────┘
//!            │ stage / read back                            │ copy in / out
//!            ▼                                              ▼
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │                    PhysicalMemory (shared)                       │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The FTW engine uses the relay to keep a copy of its in-flight transaction
//! record, tagged [`RestorePolicy::RestoreInPlace`].

use alloc::vec::Vec;
use core::fmt;

use crate::guid::Guid;

mod client;
mod memory;
mod protocol;
mod service;

pub use client::RelayClient;
pub use memory::{PhysicalMemory, SharedMemory};
pub use protocol::{
    IsolatedContext, PARAM_BLOCK_LEN, ParamBlock, RelayCommand, RelayResponse, RelayStatus,
    RestorePolicy,
};
pub use service::RelayService;

/// Errors reported across the relay boundary.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// Bad tag, range, policy or command.
    InvalidParameter(&'static str),
    /// Unknown tag.
    NotFound,
    /// Isolated storage exhausted.
    OutOfResources,
    /// Tag already saved.
    AlreadyExists,
    /// Relay locked for this boot.
    AccessDenied,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter(what) => write!(f, "Invalid relay parameter: {}", what),
            Self::NotFound => write!(f, "Relay tag not found"),
            Self::OutOfResources => write!(f, "Relay storage exhausted"),
            Self::AlreadyExists => write!(f, "Relay tag already saved"),
            Self::AccessDenied => write!(f, "Relay is locked"),
        }
    }
}

impl core::error::Error for RelayError {}

/// Caller-side view of the relay.
///
/// Implemented by [`RelayClient`]; the FTW engine takes any implementation
/// so platforms can route the calls through their own boundary.
pub trait SecureRelay {
    /// Copy `length` bytes at `address` into isolated storage under `tag`.
    fn save(&mut self, tag: Guid, address: u64, length: u64) -> Result<(), RelayError>;

    /// Overwrite `length` bytes of a saved buffer, starting at `offset`,
    /// with the bytes at `address`.
    fn update(&mut self, tag: Guid, offset: u64, address: u64, length: u64)
    -> Result<(), RelayError>;

    /// Choose what happens to the buffer at the restore checkpoint.
    fn set_restore_policy(&mut self, tag: Guid, policy: RestorePolicy) -> Result<(), RelayError>;

    /// Read a saved buffer back.
    fn restore(&mut self, tag: Guid) -> Result<Vec<u8>, RelayError>;

    /// Copy a saved buffer to `address`, which has room for `capacity` bytes.
    fn restore_to(&mut self, tag: Guid, address: u64, capacity: u64) -> Result<(), RelayError>;

    /// Copy every [`RestorePolicy::RestoreInPlace`] buffer back to where it
    /// was saved from.
    fn restore_all_in_place(&mut self) -> Result<(), RelayError>;

    /// Refuse further saves, updates and policy changes for this boot.
    fn lock(&mut self) -> Result<(), RelayError>;

    /// Place `bytes` in caller memory at `address`, ready for `save`/`update`.
    fn stage(&mut self, address: u64, bytes: &[u8]) -> Result<(), RelayError>;
}

impl<T: SecureRelay + ?Sized> SecureRelay for &mut T {
    fn save(&mut self, tag: Guid, address: u64, length: u64) -> Result<(), RelayError> {
        (**self).save(tag, address, length)
    }

    fn update(
        &mut self,
        tag: Guid,
        offset: u64,
        address: u64,
        length: u64,
    ) -> Result<(), RelayError> {
        (**self).update(tag, offset, address, length)
    }

    fn set_restore_policy(&mut self, tag: Guid, policy: RestorePolicy) -> Result<(), RelayError> {
        (**self).set_restore_policy(tag, policy)
    }

    fn restore(&mut self, tag: Guid) -> Result<Vec<u8>, RelayError> {
        (**self).restore(tag)
    }

    fn restore_to(&mut self, tag: Guid, address: u64, capacity: u64) -> Result<(), RelayError> {
        (**self).restore_to(tag, address, capacity)
    }

    fn restore_all_in_place(&mut self) -> Result<(), RelayError> {
        (**self).restore_all_in_place()
    }

    fn lock(&mut self) -> Result<(), RelayError> {
        (**self).lock()
    }

    fn stage(&mut self, address: u64, bytes: &[u8]) -> Result<(), RelayError> {
        (**self).stage(address, bytes)
    }
}
