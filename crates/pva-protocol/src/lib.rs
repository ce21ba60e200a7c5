//! Host/firmware wire formats for the PVA command interface.
//!
//! Every structure here is a fixed little-endian layout shared with the on-device firmware
//! through device memory. The layouts are not versioned at this layer; both sides are built from
//! the same definitions.
//!
//! - [`resource`]: resource table entries (`ResourceEntry`) and resource ID constants.
//! - [`cmd`]: command headers, the `LinkChunk` chaining command and the privileged commands.
//! - [`cmd_writer`]: a safe builder for privileged command streams.
//! - [`submit`]: submission queue header, `SubmitInfo` records and fences.
//! - [`status`]: the async status ring the firmware uses to report errors.
#![forbid(unsafe_code)]

mod le;

pub mod cmd;
pub mod cmd_writer;
pub mod resource;
pub mod status;
pub mod submit;

use core::fmt;

pub use cmd::{Cmd, CmdHeader, CmdOpcode, CmdStream, LinkChunk, RawCmds, PRIV_QUEUE_ID};
pub use cmd_writer::PvaCmdWriter;
pub use resource::{
    ResourceAccess, ResourceEntry, ResourceType, RESOURCE_ID_BASE, RESOURCE_ID_INVALID,
    RESOURCE_MAX_ADDR,
};
pub use status::{StatusKind, StatusRecord, StatusRingHeader, STATUS_INTERFACE};
pub use submit::{Fence, FenceKind, StatusDesc, SubmitInfo, SubmitQueueHeader};

/// Error decoding or encoding a wire structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    BufferTooSmall { needed: usize, found: usize },
    UnknownOpcode(u8),
    BadCmdLen { opcode: u8, len_words: u8 },
    UnknownResourceType(u8),
    UnknownFenceKind(u8),
    UnknownStatusKind(u8),
    CountOverflow { field: &'static str, count: usize, max: usize },
    ValueOutOfRange { field: &'static str, value: u64 },
    ReservedBitsSet,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WireError::BufferTooSmall { needed, found } => {
                write!(f, "buffer too small: need {needed} bytes, have {found}")
            }
            WireError::UnknownOpcode(op) => write!(f, "unknown command opcode 0x{op:02x}"),
            WireError::BadCmdLen { opcode, len_words } => {
                write!(f, "bad length {len_words} words for opcode 0x{opcode:02x}")
            }
            WireError::UnknownResourceType(ty) => write!(f, "unknown resource type {ty}"),
            WireError::UnknownFenceKind(kind) => write!(f, "unknown fence kind {kind}"),
            WireError::UnknownStatusKind(kind) => write!(f, "unknown status kind {kind}"),
            WireError::CountOverflow { field, count, max } => {
                write!(f, "{field} count {count} exceeds capacity {max}")
            }
            WireError::ValueOutOfRange { field, value } => {
                write!(f, "{field} value 0x{value:x} does not fit the wire field")
            }
            WireError::ReservedBitsSet => write!(f, "reserved bits set"),
        }
    }
}

impl std::error::Error for WireError {}

pub(crate) fn ensure_len(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::BufferTooSmall {
            needed,
            found: buf.len(),
        });
    }
    Ok(())
}
