//! Error types shared by the store, the FTW engine and the relay.

use core::fmt;

use crate::marker::IllegalTransition;
use crate::relay::RelayError;

/// Errors returned by the variable store and the FTW engine.
///
/// `E` is the error type of the underlying [`FlashDevice`](flashvar_adapters::FlashDevice).
#[derive(Debug)]
#[non_exhaustive]
pub enum Error<E> {
    /// Malformed key or value, oversized record, bad tag or out-of-range
    /// request.
    InvalidParameter(&'static str),

    /// Missing key or relay tag.
    NotFound,

    /// Region full, transaction already open or relay storage exhausted.
    OutOfResources(&'static str),

    /// The flash device reported a failure.
    ///
    /// Failures during a transaction's commit leave the transaction for the
    /// next [`FtwEngine::recover`](crate::FtwEngine::recover).
    Device(E),

    /// On-flash metadata failed its integrity check where recovery cannot
    /// safely proceed.
    Corrupt(&'static str),

    /// A relay buffer with this tag is already saved.
    AlreadyExists,

    /// The operation is no longer allowed in this boot phase.
    AccessDenied,

    /// The variable is locked against writes.
    WriteProtected,
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter(what) => write!(f, "Invalid parameter: {}", what),
            Self::NotFound => write!(f, "Not found"),
            Self::OutOfResources(what) => write!(f, "Out of resources: {}", what),
            Self::Device(e) => write!(f, "Device error: {}", e),
            Self::Corrupt(what) => write!(f, "Corrupt flash metadata: {}", what),
            Self::AlreadyExists => write!(f, "Already exists"),
            Self::AccessDenied => write!(f, "Access denied"),
            Self::WriteProtected => write!(f, "Write protected"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> core::error::Error for Error<E> {}

impl<E> From<RelayError> for Error<E> {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidParameter(what) => Self::InvalidParameter(what),
            RelayError::NotFound => Self::NotFound,
            RelayError::OutOfResources => Self::OutOfResources("relay storage exhausted"),
            RelayError::AlreadyExists => Self::AlreadyExists,
            RelayError::AccessDenied => Self::AccessDenied,
        }
    }
}

impl<E> From<IllegalTransition> for Error<E> {
    fn from(_: IllegalTransition) -> Self {
        Self::Corrupt("flash marker cannot move to the requested state")
    }
}

impl<E: fmt::Debug + fmt::Display> embedded_io_async::Error for Error<E> {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        use embedded_io_async::ErrorKind;
        match self {
            Self::InvalidParameter(_) => ErrorKind::InvalidInput,
            Self::NotFound => ErrorKind::NotFound,
            Self::OutOfResources(_) => ErrorKind::OutOfMemory,
            Self::Corrupt(_) => ErrorKind::InvalidData,
            Self::AlreadyExists => ErrorKind::AlreadyExists,
            Self::AccessDenied | Self::WriteProtected => ErrorKind::PermissionDenied,
            Self::Device(_) => ErrorKind::Other,
        }
    }
}
