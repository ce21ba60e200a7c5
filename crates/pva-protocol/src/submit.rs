//! Submission queue records.
//!
//! A submission queue is one device-memory region holding a [`SubmitQueueHeader`] followed by a
//! ring of [`SubmitInfo`] records. The host owns `cb_tail`, the firmware owns `cb_head`.

use crate::le::{join40, split40, LeReader, LeWriter};
use crate::{ensure_len, WireError};

pub const MAX_PREFENCES: usize = 4;
pub const MAX_POSTFENCES: usize = 4;
pub const MAX_INPUT_STATUS: usize = 2;
pub const MAX_OUTPUT_STATUS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitQueueHeader {
    pub cb_head: u32,
    pub cb_tail: u32,
}

impl SubmitQueueHeader {
    pub const SIZE_BYTES: usize = 8;

    pub const CB_HEAD_OFFSET: usize = 0;
    pub const CB_TAIL_OFFSET: usize = 4;
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceKind {
    /// A 32-bit word at `offset` inside resource `id`.
    Semaphore = 1,
    /// Hardware syncpoint `id`.
    Syncpoint = 2,
}

impl FenceKind {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Semaphore),
            2 => Some(Self::Syncpoint),
            _ => None,
        }
    }
}

/// A memory location or syncpoint plus the value that signals it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence {
    pub kind: FenceKind,
    pub id: u32,
    pub offset: u64,
    pub value: u32,
}

impl Fence {
    pub const SIZE_BYTES: usize = 16;

    pub const fn semaphore(resource_id: u32, offset: u64, value: u32) -> Self {
        Self {
            kind: FenceKind::Semaphore,
            id: resource_id,
            offset,
            value,
        }
    }

    pub const fn syncpoint(syncpoint_id: u32, value: u32) -> Self {
        Self {
            kind: FenceKind::Syncpoint,
            id: syncpoint_id,
            offset: 0,
            value,
        }
    }

    fn write(&self, w: &mut LeWriter<'_>) {
        let (hi, lo) = split40(self.offset);
        w.u8(self.kind as u8)
            .u8(hi)
            .u16(0)
            .u32(self.id)
            .u32(lo)
            .u32(self.value);
    }

    fn read(r: &mut LeReader<'_>) -> Result<Self, WireError> {
        let raw_kind = r.u8();
        let hi = r.u8();
        r.skip(2);
        let id = r.u32();
        let lo = r.u32();
        let value = r.u32();
        let kind = FenceKind::from_u8(raw_kind).ok_or(WireError::UnknownFenceKind(raw_kind))?;
        Ok(Self {
            kind,
            id,
            offset: join40(hi, lo),
            value,
        })
    }
}

/// Where firmware writes completion status words for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDesc {
    pub resource_id: u32,
    pub offset: u64,
}

impl StatusDesc {
    pub const SIZE_BYTES: usize = 12;

    fn write(&self, w: &mut LeWriter<'_>) {
        let (hi, lo) = split40(self.offset);
        w.u32(self.resource_id).u32(lo).u8(hi).zeros(3);
    }

    fn read(r: &mut LeReader<'_>) -> Self {
        let resource_id = r.u32();
        let lo = r.u32();
        let hi = r.u8();
        r.skip(3);
        Self {
            resource_id,
            offset: join40(hi, lo),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitInfo {
    pub flags: u32,
    pub first_chunk_resource_id: u32,
    pub first_chunk_offset: u64,
    pub first_chunk_size: u32,
    pub execution_timeout_ms: u32,
    pub submit_id: u64,
    pub prefences: Vec<Fence>,
    pub postfences: Vec<Fence>,
    pub input_status: Vec<StatusDesc>,
    pub output_status: Vec<StatusDesc>,
}

impl SubmitInfo {
    pub const SIZE_BYTES: usize = 216;

    pub const NUM_PREFENCES_OFFSET: usize = 0;
    pub const NUM_POSTFENCES_OFFSET: usize = 1;
    pub const FLAGS_OFFSET: usize = 4;
    pub const FIRST_CHUNK_RESOURCE_ID_OFFSET: usize = 8;
    pub const FIRST_CHUNK_OFFSET_LO_OFFSET: usize = 12;
    pub const FIRST_CHUNK_OFFSET_HI_OFFSET: usize = 16;
    pub const FIRST_CHUNK_SIZE_OFFSET: usize = 20;
    pub const EXECUTION_TIMEOUT_MS_OFFSET: usize = 24;
    pub const SUBMIT_ID_OFFSET: usize = 32;
    pub const PREFENCES_OFFSET: usize = 40;
    pub const POSTFENCES_OFFSET: usize = Self::PREFENCES_OFFSET + MAX_PREFENCES * Fence::SIZE_BYTES;
    pub const INPUT_STATUS_OFFSET: usize =
        Self::POSTFENCES_OFFSET + MAX_POSTFENCES * Fence::SIZE_BYTES;
    pub const OUTPUT_STATUS_OFFSET: usize =
        Self::INPUT_STATUS_OFFSET + MAX_INPUT_STATUS * StatusDesc::SIZE_BYTES;

    pub fn validate(&self) -> Result<(), WireError> {
        check_count("prefences", self.prefences.len(), MAX_PREFENCES)?;
        check_count("postfences", self.postfences.len(), MAX_POSTFENCES)?;
        check_count("input_status", self.input_status.len(), MAX_INPUT_STATUS)?;
        check_count("output_status", self.output_status.len(), MAX_OUTPUT_STATUS)?;
        Ok(())
    }

    pub fn encode_le(&self) -> Result<[u8; Self::SIZE_BYTES], WireError> {
        self.validate()?;
        let mut out = [0u8; Self::SIZE_BYTES];
        let (off_hi, off_lo) = split40(self.first_chunk_offset);
        let mut w = LeWriter::new(&mut out);
        w.u8(self.prefences.len() as u8)
            .u8(self.postfences.len() as u8)
            .u8(self.input_status.len() as u8)
            .u8(self.output_status.len() as u8)
            .u32(self.flags)
            .u32(self.first_chunk_resource_id)
            .u32(off_lo)
            .u8(off_hi)
            .zeros(3)
            .u32(self.first_chunk_size)
            .u32(self.execution_timeout_ms)
            .u32(0)
            .u64(self.submit_id);
        write_fences(&mut w, &self.prefences, MAX_PREFENCES);
        write_fences(&mut w, &self.postfences, MAX_POSTFENCES);
        write_status(&mut w, &self.input_status, MAX_INPUT_STATUS);
        write_status(&mut w, &self.output_status, MAX_OUTPUT_STATUS);
        debug_assert_eq!(w.position(), Self::SIZE_BYTES);
        Ok(out)
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        let mut r = LeReader::new(&buf[..Self::SIZE_BYTES]);
        let num_prefences = usize::from(r.u8());
        let num_postfences = usize::from(r.u8());
        let num_input_status = usize::from(r.u8());
        let num_output_status = usize::from(r.u8());
        check_count("prefences", num_prefences, MAX_PREFENCES)?;
        check_count("postfences", num_postfences, MAX_POSTFENCES)?;
        check_count("input_status", num_input_status, MAX_INPUT_STATUS)?;
        check_count("output_status", num_output_status, MAX_OUTPUT_STATUS)?;

        let flags = r.u32();
        let first_chunk_resource_id = r.u32();
        let off_lo = r.u32();
        let off_hi = r.u8();
        r.skip(3);
        let first_chunk_size = r.u32();
        let execution_timeout_ms = r.u32();
        r.skip(4);
        let submit_id = r.u64();

        let prefences = read_fences(&mut r, num_prefences, MAX_PREFENCES)?;
        let postfences = read_fences(&mut r, num_postfences, MAX_POSTFENCES)?;
        let input_status = read_status(&mut r, num_input_status, MAX_INPUT_STATUS);
        let output_status = read_status(&mut r, num_output_status, MAX_OUTPUT_STATUS);

        Ok(Self {
            flags,
            first_chunk_resource_id,
            first_chunk_offset: join40(off_hi, off_lo),
            first_chunk_size,
            execution_timeout_ms,
            submit_id,
            prefences,
            postfences,
            input_status,
            output_status,
        })
    }
}

fn check_count(field: &'static str, count: usize, max: usize) -> Result<(), WireError> {
    if count > max {
        return Err(WireError::CountOverflow { field, count, max });
    }
    Ok(())
}

fn write_fences(w: &mut LeWriter<'_>, fences: &[Fence], cap: usize) {
    for fence in fences {
        fence.write(w);
    }
    w.zeros((cap - fences.len()) * Fence::SIZE_BYTES);
}

fn read_fences(r: &mut LeReader<'_>, count: usize, cap: usize) -> Result<Vec<Fence>, WireError> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(Fence::read(r)?);
    }
    r.skip((cap - count) * Fence::SIZE_BYTES);
    Ok(out)
}

fn write_status(w: &mut LeWriter<'_>, descs: &[StatusDesc], cap: usize) {
    for desc in descs {
        desc.write(w);
    }
    w.zeros((cap - descs.len()) * StatusDesc::SIZE_BYTES);
}

fn read_status(r: &mut LeReader<'_>, count: usize, cap: usize) -> Vec<StatusDesc> {
    let out: Vec<StatusDesc> = (0..count).map(|_| StatusDesc::read(r)).collect();
    r.skip((cap - count) * StatusDesc::SIZE_BYTES);
    out
}

const _: () = {
    assert!(
        SubmitInfo::OUTPUT_STATUS_OFFSET + MAX_OUTPUT_STATUS * StatusDesc::SIZE_BYTES
            == SubmitInfo::SIZE_BYTES
    );
    assert!(SubmitInfo::POSTFENCES_OFFSET == 104);
    assert!(SubmitInfo::INPUT_STATUS_OFFSET == 168);
};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> SubmitInfo {
        SubmitInfo {
            flags: 0x5,
            first_chunk_resource_id: 3,
            first_chunk_offset: 0x02_0000_1000,
            first_chunk_size: 96,
            execution_timeout_ms: 1000,
            submit_id: 0x1_0000_0002,
            prefences: vec![Fence::syncpoint(4, 10)],
            postfences: vec![Fence::semaphore(3, 0x8000, 1), Fence::syncpoint(4, 11)],
            input_status: vec![],
            output_status: vec![StatusDesc {
                resource_id: 5,
                offset: 0x40,
            }],
        }
    }

    #[test]
    fn encode_places_fields_at_documented_offsets() {
        let bytes = sample().encode_le().unwrap();
        assert_eq!(bytes[SubmitInfo::NUM_PREFENCES_OFFSET], 1);
        assert_eq!(bytes[SubmitInfo::NUM_POSTFENCES_OFFSET], 2);
        assert_eq!(bytes[SubmitInfo::FIRST_CHUNK_OFFSET_HI_OFFSET], 0x02);
        let word = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        assert_eq!(word(SubmitInfo::FIRST_CHUNK_RESOURCE_ID_OFFSET), 3);
        assert_eq!(word(SubmitInfo::FIRST_CHUNK_OFFSET_LO_OFFSET), 0x1000);
        assert_eq!(word(SubmitInfo::FIRST_CHUNK_SIZE_OFFSET), 96);
        assert_eq!(word(SubmitInfo::EXECUTION_TIMEOUT_MS_OFFSET), 1000);
        assert_eq!(bytes[SubmitInfo::POSTFENCES_OFFSET], FenceKind::Semaphore as u8);
        assert_eq!(
            bytes[SubmitInfo::POSTFENCES_OFFSET + Fence::SIZE_BYTES],
            FenceKind::Syncpoint as u8
        );
        assert_eq!(SubmitInfo::decode_le(&bytes).unwrap(), sample());
    }

    #[test]
    fn encode_rejects_too_many_postfences() {
        let mut info = sample();
        info.postfences = vec![Fence::syncpoint(0, 0); MAX_POSTFENCES + 1];
        assert_eq!(
            info.encode_le(),
            Err(WireError::CountOverflow {
                field: "postfences",
                count: 5,
                max: 4
            })
        );
    }

    #[test]
    fn decode_rejects_oversized_counts() {
        let mut bytes = sample().encode_le().unwrap();
        bytes[SubmitInfo::NUM_PREFENCES_OFFSET] = 9;
        assert!(matches!(
            SubmitInfo::decode_le(&bytes),
            Err(WireError::CountOverflow {
                field: "prefences",
                ..
            })
        ));
    }
}
