//! Async status ring.
//!
//! Each CCQ hands the firmware a shared DRAM buffer (interface [`STATUS_INTERFACE`]) laid out as
//! a [`StatusRingHeader`] followed by `capacity` [`StatusRecord`]s. Firmware appends records and
//! advances `write_idx`; the host drains up to `write_idx` and stores `read_idx`. Indices are
//! free-running and taken modulo `capacity` when addressing a record.

use crate::le::{LeReader, LeWriter};
use crate::{ensure_len, WireError};

pub const STATUS_INTERFACE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRingHeader {
    pub write_idx: u32,
    pub read_idx: u32,
    pub capacity: u32,
}

impl StatusRingHeader {
    pub const SIZE_BYTES: usize = 16;

    pub const WRITE_IDX_OFFSET: usize = 0;
    pub const READ_IDX_OFFSET: usize = 4;
    pub const CAPACITY_OFFSET: usize = 8;

    /// Bytes needed for a ring of `capacity` records.
    pub const fn ring_bytes(capacity: u32) -> usize {
        Self::SIZE_BYTES + capacity as usize * StatusRecord::SIZE_BYTES
    }

    /// Byte offset of the record slot for free-running index `idx`.
    pub const fn record_offset(&self, idx: u32) -> usize {
        Self::SIZE_BYTES + (idx % self.capacity) as usize * StatusRecord::SIZE_BYTES
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    CmdError = 1,
    ExecTimeout = 2,
    InvalidFence = 3,
}

impl StatusKind {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::CmdError),
            2 => Some(Self::ExecTimeout),
            3 => Some(Self::InvalidFence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub queue_id: u8,
    pub kind: StatusKind,
    pub code: u32,
    pub submit_id: u64,
}

impl StatusRecord {
    pub const SIZE_BYTES: usize = 16;

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut out = [0u8; Self::SIZE_BYTES];
        LeWriter::new(&mut out)
            .u8(self.queue_id)
            .u8(self.kind as u8)
            .u16(0)
            .u32(self.code)
            .u64(self.submit_id);
        out
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        let mut r = LeReader::new(buf);
        let queue_id = r.u8();
        let raw_kind = r.u8();
        r.skip(2);
        let kind = StatusKind::from_u8(raw_kind).ok_or(WireError::UnknownStatusKind(raw_kind))?;
        Ok(Self {
            queue_id,
            kind,
            code: r.u32(),
            submit_id: r.u64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_offsets_wrap_at_capacity() {
        let hdr = StatusRingHeader {
            capacity: 4,
            ..Default::default()
        };
        assert_eq!(StatusRingHeader::ring_bytes(4), 16 + 64);
        assert_eq!(hdr.record_offset(0), 16);
        assert_eq!(hdr.record_offset(3), 16 + 48);
        assert_eq!(hdr.record_offset(4), 16);
    }

    #[test]
    fn record_roundtrip() {
        let rec = StatusRecord {
            queue_id: 3,
            kind: StatusKind::ExecTimeout,
            code: 0xdead,
            submit_id: 77,
        };
        assert_eq!(StatusRecord::decode_le(&rec.to_le_bytes()).unwrap(), rec);
    }
}
