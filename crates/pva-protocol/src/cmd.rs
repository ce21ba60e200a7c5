//! Command encoding.
//!
//! A command is a 4-byte [`CmdHeader`] followed by an opcode-specific payload. The header's `len`
//! counts 32-bit words including the header itself, so every command is 4-byte aligned and at
//! most `255 * 4` bytes long.
//!
//! Opcodes with the high bit set are privileged: the firmware accepts them only on a CCQ's
//! privileged queue ([`PRIV_QUEUE_ID`]).

use crate::le::{join40, split40, LeReader, LeWriter};
use crate::resource::ResourceEntry;
use crate::{ensure_len, WireError};

/// Queue ID of each CCQ's privileged queue.
pub const PRIV_QUEUE_ID: u8 = 0xFF;

pub const CMD_PRIVILEGED_BIT: u8 = 0x80;

/// Largest encodable command, in bytes.
pub const CMD_MAX_SIZE_BYTES: usize = u8::MAX as usize * 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdOpcode {
    Noop = 0x00,
    LinkChunk = 0x01,
    InitResourceTable = 0x80,
    DeinitResourceTable = 0x81,
    UpdateResourceTable = 0x82,
    UnregisterResource = 0x83,
    InitQueue = 0x84,
    DeinitQueue = 0x85,
    InitSharedDramBuffer = 0x86,
    DeinitSharedDramBuffer = 0x87,
    SuspendFw = 0x88,
    ResumeFw = 0x89,
    SetTraceLevel = 0x8A,
}

impl CmdOpcode {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Noop),
            0x01 => Some(Self::LinkChunk),
            0x80 => Some(Self::InitResourceTable),
            0x81 => Some(Self::DeinitResourceTable),
            0x82 => Some(Self::UpdateResourceTable),
            0x83 => Some(Self::UnregisterResource),
            0x84 => Some(Self::InitQueue),
            0x85 => Some(Self::DeinitQueue),
            0x86 => Some(Self::InitSharedDramBuffer),
            0x87 => Some(Self::DeinitSharedDramBuffer),
            0x88 => Some(Self::SuspendFw),
            0x89 => Some(Self::ResumeFw),
            0x8A => Some(Self::SetTraceLevel),
            _ => None,
        }
    }

    pub const fn is_privileged(self) -> bool {
        (self as u8) & CMD_PRIVILEGED_BIT != 0
    }

    /// Encoded size of a command with this opcode, header included.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Noop | Self::SuspendFw | Self::ResumeFw => CmdHeader::SIZE_BYTES,
            Self::LinkChunk => LinkChunk::SIZE_BYTES,
            Self::InitResourceTable => 16,
            Self::DeinitResourceTable => 8,
            Self::UpdateResourceTable => 12 + ResourceEntry::SIZE_BYTES,
            Self::UnregisterResource => 12,
            Self::InitQueue => 20,
            Self::DeinitQueue => 8,
            Self::InitSharedDramBuffer => 16,
            Self::DeinitSharedDramBuffer => 8,
            Self::SetTraceLevel => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub opcode: u8,
    pub flags: u8,
    /// Command length in 32-bit words, header included.
    pub len: u8,
}

impl CmdHeader {
    pub const SIZE_BYTES: usize = 4;

    pub const fn for_opcode(opcode: CmdOpcode) -> Self {
        Self {
            opcode: opcode as u8,
            flags: 0,
            len: (opcode.size_bytes() / 4) as u8,
        }
    }

    pub fn size_bytes(&self) -> usize {
        usize::from(self.len) * 4
    }

    pub fn write_le(&self, out: &mut [u8]) {
        LeWriter::new(&mut out[..Self::SIZE_BYTES])
            .u8(self.opcode)
            .u8(self.flags)
            .u8(self.len)
            .u8(0);
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        let hdr = Self {
            opcode: buf[0],
            flags: buf[1],
            len: buf[2],
        };
        if hdr.len == 0 {
            return Err(WireError::BadCmdLen {
                opcode: hdr.opcode,
                len_words: 0,
            });
        }
        Ok(hdr)
    }
}

/// Chains one command-buffer chunk to the next.
///
/// Every chunk starts with a `LinkChunk` describing the chunk that follows it. The last chunk of a
/// chain carries `next_chunk_resource_id == RESOURCE_ID_INVALID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkChunk {
    pub next_chunk_offset: u64,
    pub next_chunk_resource_id: u32,
    pub next_chunk_size: u32,
}

impl LinkChunk {
    pub const SIZE_BYTES: usize = 20;

    pub const NEXT_CHUNK_OFFSET_HI_OFFSET: usize = 4;
    pub const NEXT_CHUNK_OFFSET_LO_OFFSET: usize = 8;
    pub const NEXT_CHUNK_RESOURCE_ID_OFFSET: usize = 12;
    pub const NEXT_CHUNK_SIZE_OFFSET: usize = 16;

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut out = [0u8; Self::SIZE_BYTES];
        Cmd::LinkChunk(*self).write_le(&mut out);
        out
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self, WireError> {
        match Cmd::decode_le(buf)? {
            (Cmd::LinkChunk(link), _) => Ok(link),
            (other, _) => Err(WireError::UnknownOpcode(other.opcode() as u8)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitResourceTable {
    pub resource_table_id: u8,
    pub iova: u64,
    pub max_n_entries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResourceTable {
    pub resource_table_id: u8,
    pub resource_id: u32,
    pub entry: ResourceEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterResource {
    pub resource_table_id: u8,
    pub resource_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitQueue {
    pub ccq_id: u8,
    pub queue_id: u8,
    pub iova: u64,
    pub max_n_submits: u32,
    pub syncpoint_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitSharedDramBuffer {
    pub interface: u8,
    pub iova: u64,
    pub size: u32,
}

/// A decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Noop,
    LinkChunk(LinkChunk),
    InitResourceTable(InitResourceTable),
    DeinitResourceTable { resource_table_id: u8 },
    UpdateResourceTable(UpdateResourceTable),
    UnregisterResource(UnregisterResource),
    InitQueue(InitQueue),
    DeinitQueue { ccq_id: u8, queue_id: u8 },
    InitSharedDramBuffer(InitSharedDramBuffer),
    DeinitSharedDramBuffer { interface: u8 },
    SuspendFw,
    ResumeFw,
    SetTraceLevel { level: u32 },
}

impl Cmd {
    pub fn opcode(&self) -> CmdOpcode {
        match self {
            Cmd::Noop => CmdOpcode::Noop,
            Cmd::LinkChunk(_) => CmdOpcode::LinkChunk,
            Cmd::InitResourceTable(_) => CmdOpcode::InitResourceTable,
            Cmd::DeinitResourceTable { .. } => CmdOpcode::DeinitResourceTable,
            Cmd::UpdateResourceTable(_) => CmdOpcode::UpdateResourceTable,
            Cmd::UnregisterResource(_) => CmdOpcode::UnregisterResource,
            Cmd::InitQueue(_) => CmdOpcode::InitQueue,
            Cmd::DeinitQueue { .. } => CmdOpcode::DeinitQueue,
            Cmd::InitSharedDramBuffer(_) => CmdOpcode::InitSharedDramBuffer,
            Cmd::DeinitSharedDramBuffer { .. } => CmdOpcode::DeinitSharedDramBuffer,
            Cmd::SuspendFw => CmdOpcode::SuspendFw,
            Cmd::ResumeFw => CmdOpcode::ResumeFw,
            Cmd::SetTraceLevel { .. } => CmdOpcode::SetTraceLevel,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.opcode().size_bytes()
    }

    /// Encodes into the first `self.size_bytes()` bytes of `out`.
    pub fn write_le(&self, out: &mut [u8]) {
        let size = self.size_bytes();
        let out = &mut out[..size];
        CmdHeader::for_opcode(self.opcode()).write_le(out);
        let mut w = LeWriter::new(&mut out[CmdHeader::SIZE_BYTES..]);
        match *self {
            Cmd::Noop | Cmd::SuspendFw | Cmd::ResumeFw => {}
            Cmd::LinkChunk(link) => {
                let (hi, lo) = split40(link.next_chunk_offset);
                w.u8(hi)
                    .zeros(3)
                    .u32(lo)
                    .u32(link.next_chunk_resource_id)
                    .u32(link.next_chunk_size);
            }
            Cmd::InitResourceTable(c) => {
                let (hi, lo) = split40(c.iova);
                w.u8(c.resource_table_id)
                    .u8(hi)
                    .u16(0)
                    .u32(lo)
                    .u32(c.max_n_entries);
            }
            Cmd::DeinitResourceTable { resource_table_id } => {
                w.u8(resource_table_id).zeros(3);
            }
            Cmd::UpdateResourceTable(c) => {
                w.u8(c.resource_table_id)
                    .zeros(3)
                    .u32(c.resource_id)
                    .bytes(&c.entry.to_le_bytes());
            }
            Cmd::UnregisterResource(c) => {
                w.u8(c.resource_table_id).zeros(3).u32(c.resource_id);
            }
            Cmd::InitQueue(c) => {
                let (hi, lo) = split40(c.iova);
                w.u8(c.ccq_id)
                    .u8(c.queue_id)
                    .u8(hi)
                    .u8(0)
                    .u32(lo)
                    .u32(c.max_n_submits)
                    .u32(c.syncpoint_id);
            }
            Cmd::DeinitQueue { ccq_id, queue_id } => {
                w.u8(ccq_id).u8(queue_id).u16(0);
            }
            Cmd::InitSharedDramBuffer(c) => {
                let (hi, lo) = split40(c.iova);
                w.u8(c.interface).u8(hi).u16(0).u32(lo).u32(c.size);
            }
            Cmd::DeinitSharedDramBuffer { interface } => {
                w.u8(interface).zeros(3);
            }
            Cmd::SetTraceLevel { level } => {
                w.u32(level);
            }
        }
        debug_assert_eq!(w.position() + CmdHeader::SIZE_BYTES, size);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size_bytes()];
        self.write_le(&mut out);
        out
    }

    /// Decodes one command from the front of `buf`, returning it with its encoded size.
    pub fn decode_le(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let hdr = CmdHeader::decode_le(buf)?;
        let opcode = CmdOpcode::from_u8(hdr.opcode).ok_or(WireError::UnknownOpcode(hdr.opcode))?;
        let size = hdr.size_bytes();
        if size != opcode.size_bytes() {
            return Err(WireError::BadCmdLen {
                opcode: hdr.opcode,
                len_words: hdr.len,
            });
        }
        ensure_len(buf, size)?;

        let mut r = LeReader::new(&buf[CmdHeader::SIZE_BYTES..size]);
        let cmd = match opcode {
            CmdOpcode::Noop => Cmd::Noop,
            CmdOpcode::SuspendFw => Cmd::SuspendFw,
            CmdOpcode::ResumeFw => Cmd::ResumeFw,
            CmdOpcode::LinkChunk => {
                let hi = r.u8();
                r.skip(3);
                let lo = r.u32();
                Cmd::LinkChunk(LinkChunk {
                    next_chunk_offset: join40(hi, lo),
                    next_chunk_resource_id: r.u32(),
                    next_chunk_size: r.u32(),
                })
            }
            CmdOpcode::InitResourceTable => {
                let resource_table_id = r.u8();
                let hi = r.u8();
                r.skip(2);
                let lo = r.u32();
                Cmd::InitResourceTable(InitResourceTable {
                    resource_table_id,
                    iova: join40(hi, lo),
                    max_n_entries: r.u32(),
                })
            }
            CmdOpcode::DeinitResourceTable => Cmd::DeinitResourceTable {
                resource_table_id: r.u8(),
            },
            CmdOpcode::UpdateResourceTable => {
                let resource_table_id = r.u8();
                r.skip(3);
                let resource_id = r.u32();
                let entry = ResourceEntry::decode_le(r.rest())?;
                Cmd::UpdateResourceTable(UpdateResourceTable {
                    resource_table_id,
                    resource_id,
                    entry,
                })
            }
            CmdOpcode::UnregisterResource => {
                let resource_table_id = r.u8();
                r.skip(3);
                Cmd::UnregisterResource(UnregisterResource {
                    resource_table_id,
                    resource_id: r.u32(),
                })
            }
            CmdOpcode::InitQueue => {
                let ccq_id = r.u8();
                let queue_id = r.u8();
                let hi = r.u8();
                r.skip(1);
                let lo = r.u32();
                Cmd::InitQueue(InitQueue {
                    ccq_id,
                    queue_id,
                    iova: join40(hi, lo),
                    max_n_submits: r.u32(),
                    syncpoint_id: r.u32(),
                })
            }
            CmdOpcode::DeinitQueue => Cmd::DeinitQueue {
                ccq_id: r.u8(),
                queue_id: r.u8(),
            },
            CmdOpcode::InitSharedDramBuffer => {
                let interface = r.u8();
                let hi = r.u8();
                r.skip(2);
                let lo = r.u32();
                Cmd::InitSharedDramBuffer(InitSharedDramBuffer {
                    interface,
                    iova: join40(hi, lo),
                    size: r.u32(),
                })
            }
            CmdOpcode::DeinitSharedDramBuffer => Cmd::DeinitSharedDramBuffer {
                interface: r.u8(),
            },
            CmdOpcode::SetTraceLevel => Cmd::SetTraceLevel { level: r.u32() },
        };
        Ok((cmd, size))
    }
}

/// Iterates the commands of a byte stream, stopping at the first decode error.
#[derive(Debug, Clone)]
pub struct CmdStream<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> CmdStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

impl<'a> Iterator for CmdStream<'a> {
    type Item = Result<Cmd, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        match Cmd::decode_le(self.buf) {
            Ok((cmd, size)) => {
                self.buf = &self.buf[size..];
                Some(Ok(cmd))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Splits a byte stream into raw commands using only the header lengths.
///
/// Unlike [`CmdStream`] this does not require the opcodes to be known, which lets the host pass
/// through commands it does not interpret.
#[derive(Debug, Clone)]
pub struct RawCmds<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> RawCmds<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for RawCmds<'a> {
    type Item = Result<&'a [u8], WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        let res = CmdHeader::decode_le(self.buf).and_then(|hdr| {
            let size = hdr.size_bytes();
            ensure_len(self.buf, size)?;
            Ok(size)
        });
        match res {
            Ok(size) => {
                let (cmd, rest) = self.buf.split_at(size);
                self.buf = rest;
                Some(Ok(cmd))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceAccess, ResourceType};

    #[test]
    fn opcode_sizes_are_word_multiples() {
        for raw in 0..=u8::MAX {
            if let Some(op) = CmdOpcode::from_u8(raw) {
                assert_eq!(op.size_bytes() % 4, 0, "{op:?}");
                assert_eq!(op as u8, raw);
                assert_eq!(op.is_privileged(), raw >= 0x80);
            }
        }
    }

    #[test]
    fn link_chunk_field_offsets_match_encoding() {
        let link = LinkChunk {
            next_chunk_offset: 0x01_0000_0400,
            next_chunk_resource_id: 9,
            next_chunk_size: 0x1234,
        };
        let bytes = link.to_le_bytes();
        assert_eq!(bytes[0], CmdOpcode::LinkChunk as u8);
        assert_eq!(bytes[2], 5);
        assert_eq!(bytes[LinkChunk::NEXT_CHUNK_OFFSET_HI_OFFSET], 0x01);
        let word = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        assert_eq!(word(LinkChunk::NEXT_CHUNK_OFFSET_LO_OFFSET), 0x400);
        assert_eq!(word(LinkChunk::NEXT_CHUNK_RESOURCE_ID_OFFSET), 9);
        assert_eq!(word(LinkChunk::NEXT_CHUNK_SIZE_OFFSET), 0x1234);
        assert_eq!(LinkChunk::decode_le(&bytes).unwrap(), link);
    }

    #[test]
    fn update_resource_table_embeds_entry() {
        let entry =
            ResourceEntry::new(ResourceType::Dram, ResourceAccess::READ, 2, 0x1000, 0x40).unwrap();
        let cmd = Cmd::UpdateResourceTable(UpdateResourceTable {
            resource_table_id: 2,
            resource_id: 17,
            entry,
        });
        let bytes = cmd.to_vec();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[12..], &entry.to_le_bytes());
        assert_eq!(Cmd::decode_le(&bytes).unwrap(), (cmd, 28));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut bytes = Cmd::SetTraceLevel { level: 3 }.to_vec();
        bytes[2] = 3;
        bytes.extend_from_slice(&[0; 4]);
        assert_eq!(
            Cmd::decode_le(&bytes),
            Err(WireError::BadCmdLen {
                opcode: CmdOpcode::SetTraceLevel as u8,
                len_words: 3
            })
        );
    }

    #[test]
    fn stream_stops_after_first_error() {
        let mut bytes = Cmd::Noop.to_vec();
        bytes.extend_from_slice(&[0x7F, 0, 1, 0]);
        bytes.extend_from_slice(&Cmd::SuspendFw.to_vec());

        let mut stream = CmdStream::new(&bytes);
        assert_eq!(stream.next(), Some(Ok(Cmd::Noop)));
        assert_eq!(stream.next(), Some(Err(WireError::UnknownOpcode(0x7F))));
        assert_eq!(stream.next(), None);

        // The raw splitter only needs lengths, so it walks past the unknown opcode.
        let raw: Vec<_> = RawCmds::new(&bytes).collect::<Result<_, _>>().unwrap();
        assert_eq!(raw.len(), 3);
    }

    #[test]
    fn raw_split_rejects_truncated_command() {
        let bytes = Cmd::SetTraceLevel { level: 1 }.to_vec();
        let mut raw = RawCmds::new(&bytes[..6]);
        assert_eq!(
            raw.next(),
            Some(Err(WireError::BufferTooSmall { needed: 8, found: 6 }))
        );
        assert_eq!(raw.next(), None);
    }
}
