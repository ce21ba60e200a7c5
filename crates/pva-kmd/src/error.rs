use pva_protocol::WireError;
use thiserror::Error;

use crate::devmem::DeviceMemoryError;

pub type Result<T, E = KmdError> = core::result::Result<T, E>;

/// Error type shared by every KMD operation.
///
/// The variants follow the firmware interface's error taxonomy so op responses can report them
/// to user space unchanged. `Internal` marks a violated driver invariant and is paired with a
/// `debug_assert!` at the detection site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KmdError {
    #[error("out of memory")]
    NoMem,

    #[error("no free resource id")]
    NoResourceId,

    #[error("submission queue full")]
    QueueFull,

    #[error("timed out waiting for firmware")]
    TimedOut,

    #[error("invalid argument: {0}")]
    Inval(&'static str),

    #[error("bad parameter: {0}")]
    BadParameter(&'static str),

    #[error("internal error: {0}")]
    Internal(&'static str),

    #[error(transparent)]
    DeviceMemory(#[from] DeviceMemoryError),

    #[error("malformed wire data: {0}")]
    Wire(#[from] WireError),
}
