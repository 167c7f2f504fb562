//! Wire format of the isolated-context call.
//!
//! One synchronous entry point takes a command code and a fixed 64-byte
//! parameter block:
//!
//! | Off | Size | Field   |
//! |-----|------|---------|
//! | 0   | 16   | tag     |
//! | 16  | 8    | address |
//! | 24  | 8    | length  |
//! | 32  | 8    | offset  |
//! | 40  | 4    | policy  |
//! | 44  | 20   | zero    |

use alloc::vec::Vec;

use crate::guid::Guid;
use crate::relay::RelayError;

/// Size of an encoded [`ParamBlock`].
pub const PARAM_BLOCK_LEN: usize = 64;

/// Commands understood by the isolated context.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RelayCommand {
    /// Copy a buffer in.
    Save = 1,
    /// Patch a saved buffer.
    Update = 2,
    /// Copy a saved buffer out.
    Restore = 3,
    /// Change the restore policy.
    SetAttributes = 4,
    /// Write every in-place buffer back to its address.
    RestoreAllInPlace = 5,
    /// Lock the relay for the rest of the boot.
    Lock = 6,
}

impl RelayCommand {
    /// Command code on the wire.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decode a command code.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Save),
            2 => Some(Self::Update),
            3 => Some(Self::Restore),
            4 => Some(Self::SetAttributes),
            5 => Some(Self::RestoreAllInPlace),
            6 => Some(Self::Lock),
            _ => None,
        }
    }
}

/// What the isolated context does with a buffer at the restore checkpoint.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum RestorePolicy {
    /// Only explicit restores.
    #[default]
    None = 0,
    /// Copied back to its saved address by `RestoreAllInPlace`.
    RestoreInPlace = 1,
    /// May grow through updates past its saved length.
    AppendOnly = 2,
}

impl RestorePolicy {
    /// Policy code on the wire.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decode a policy code.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::RestoreInPlace),
            2 => Some(Self::AppendOnly),
            _ => None,
        }
    }
}

/// Arguments of one call. Unused fields are zero.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamBlock {
    /// Buffer tag.
    pub tag: Guid,
    /// Physical address in shared memory.
    pub address: u64,
    /// Byte count.
    pub length: u64,
    /// Offset inside the saved buffer.
    pub offset: u64,
    /// Restore policy.
    pub policy: RestorePolicy,
}

impl ParamBlock {
    /// Parameters naming only a tag.
    pub const fn for_tag(tag: Guid) -> Self {
        Self {
            tag,
            address: 0,
            length: 0,
            offset: 0,
            policy: RestorePolicy::None,
        }
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> [u8; PARAM_BLOCK_LEN] {
        let mut buf = [0u8; PARAM_BLOCK_LEN];
        buf[0..16].copy_from_slice(self.tag.as_bytes());
        buf[16..24].copy_from_slice(&self.address.to_le_bytes());
        buf[24..32].copy_from_slice(&self.length.to_le_bytes());
        buf[32..40].copy_from_slice(&self.offset.to_le_bytes());
        buf[40..44].copy_from_slice(&self.policy.code().to_le_bytes());
        buf
    }

    /// Decode and validate the wire layout.
    pub fn decode(buf: &[u8; PARAM_BLOCK_LEN]) -> Result<Self, RelayError> {
        if buf[44..].iter().any(|b| *b != 0) {
            return Err(RelayError::InvalidParameter("reserved parameter bytes set"));
        }
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&buf[0..16]);
        let policy = RestorePolicy::from_code(read_u32(buf, 40))
            .ok_or(RelayError::InvalidParameter("unknown restore policy"))?;

        Ok(Self {
            tag: Guid::from_bytes(tag),
            address: read_u64(buf, 16),
            length: read_u64(buf, 24),
            offset: read_u64(buf, 32),
            policy,
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

/// Result code returned across the boundary.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RelayStatus {
    /// Call succeeded.
    Success = 0,
    /// Bad parameter or command.
    InvalidParameter = 1,
    /// Unknown tag.
    NotFound = 2,
    /// Storage exhausted.
    OutOfResources = 3,
    /// Tag already saved.
    AlreadyExists = 4,
    /// Relay locked.
    AccessDenied = 5,
}

impl From<RelayError> for RelayStatus {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidParameter(_) => Self::InvalidParameter,
            RelayError::NotFound => Self::NotFound,
            RelayError::OutOfResources => Self::OutOfResources,
            RelayError::AlreadyExists => Self::AlreadyExists,
            RelayError::AccessDenied => Self::AccessDenied,
        }
    }
}

/// Reply of the isolated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    /// Result code.
    pub status: RelayStatus,
    /// Bytes returned by `Restore`; empty otherwise.
    pub data: Vec<u8>,
}

impl RelayResponse {
    /// Success carrying restored bytes.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            status: RelayStatus::Success,
            data,
        }
    }

    /// Failure.
    pub fn failure(err: RelayError) -> Self {
        Self {
            status: err.into(),
            data: Vec::new(),
        }
    }

    /// Turn the status code back into a `Result`.
    pub fn into_result(self) -> Result<Vec<u8>, RelayError> {
        match self.status {
            RelayStatus::Success => Ok(self.data),
            RelayStatus::InvalidParameter => Err(RelayError::InvalidParameter(
                "rejected by isolated context",
            )),
            RelayStatus::NotFound => Err(RelayError::NotFound),
            RelayStatus::OutOfResources => Err(RelayError::OutOfResources),
            RelayStatus::AlreadyExists => Err(RelayError::AlreadyExists),
            RelayStatus::AccessDenied => Err(RelayError::AccessDenied),
        }
    }
}

/// The synchronous entry point into the isolated execution context.
///
/// The caller blocks until the call returns. `command` is passed raw because
/// it crosses a trust boundary; unknown codes must be rejected.
pub trait IsolatedContext {
    /// Run one command.
    fn call(&mut self, command: u32, params: &[u8; PARAM_BLOCK_LEN]) -> RelayResponse;
}

impl<T: IsolatedContext + ?Sized> IsolatedContext for &mut T {
    fn call(&mut self, command: u32, params: &[u8; PARAM_BLOCK_LEN]) -> RelayResponse {
        (**self).call(command, params)
    }
}
