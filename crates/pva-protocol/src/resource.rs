//! Resource table entries.
//!
//! The firmware dereferences buffers, executables and DMA configurations through a per-CCQ table
//! of [`ResourceEntry`] values indexed by resource ID. ID 0 is reserved and never describes a
//! resource; it doubles as the chain terminator in `LinkChunk`.

use bitflags::bitflags;

use crate::le::{join40, split40, LeReader, LeWriter};
use crate::{ensure_len, WireError};

pub const RESOURCE_ID_INVALID: u32 = 0;
pub const RESOURCE_ID_BASE: u32 = 1;

/// Largest address or size that fits an entry's 40-bit fields.
pub const RESOURCE_MAX_ADDR: u64 = (1 << 40) - 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceType {
    #[default]
    Invalid = 0,
    Dram = 1,
    ExecBin = 2,
    DmaConfig = 3,
}

impl ResourceType {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Invalid),
            1 => Some(Self::Dram),
            2 => Some(Self::ExecBin),
            3 => Some(Self::DmaConfig),
            _ => None,
        }
    }
}

const ACCESS_MASK: u8 = 0b0000_0011;
const RESERVED_MASK: u8 = 0b1100_1100;
const TYPE_SHIFT: u8 = 4;
const TYPE_MASK: u8 = 0b0011_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceEntry {
    pub ty: ResourceType,
    pub access: ResourceAccess,
    pub smmu_context_id: u8,
    pub addr: u64,
    pub size: u64,
}

impl ResourceEntry {
    pub const SIZE_BYTES: usize = 16;

    pub const FLAGS_OFFSET: usize = 0;
    pub const SMMU_CONTEXT_ID_OFFSET: usize = 1;
    pub const ADDR_HI_OFFSET: usize = 2;
    pub const SIZE_HI_OFFSET: usize = 3;
    pub const ADDR_LO_OFFSET: usize = 4;
    pub const SIZE_LO_OFFSET: usize = 8;

    pub const INVALID: Self = Self {
        ty: ResourceType::Invalid,
        access: ResourceAccess::empty(),
        smmu_context_id: 0,
        addr: 0,
        size: 0,
    };

    /// Builds an entry, returning `None` if `addr` or `size` does not fit 40 bits.
    pub fn new(
        ty: ResourceType,
        access: ResourceAccess,
        smmu_context_id: u8,
        addr: u64,
        size: u64,
    ) -> Option<Self> {
        if addr > RESOURCE_MAX_ADDR || size > RESOURCE_MAX_ADDR {
            return None;
        }
        Some(Self {
            ty,
            access,
            smmu_context_id,
            addr,
            size,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.ty != ResourceType::Invalid
    }

    pub fn write_le(&self, out: &mut [u8]) {
        let (addr_hi, addr_lo) = split40(self.addr);
        let (size_hi, size_lo) = split40(self.size);
        let flags = (self.access.bits() & ACCESS_MASK) | ((self.ty as u8) << TYPE_SHIFT);
        LeWriter::new(&mut out[..Self::SIZE_BYTES])
            .u8(flags)
            .u8(self.smmu_context_id)
            .u8(addr_hi)
            .u8(size_hi)
            .u32(addr_lo)
            .u32(size_lo)
            .zeros(4);
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut out = [0u8; Self::SIZE_BYTES];
        self.write_le(&mut out);
        out
    }

    pub fn decode_le(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        let mut r = LeReader::new(buf);
        let flags = r.u8();
        if flags & RESERVED_MASK != 0 {
            return Err(WireError::ReservedBitsSet);
        }
        let raw_ty = (flags & TYPE_MASK) >> TYPE_SHIFT;
        let ty = ResourceType::from_u8(raw_ty).ok_or(WireError::UnknownResourceType(raw_ty))?;
        let smmu_context_id = r.u8();
        let addr_hi = r.u8();
        let size_hi = r.u8();
        let addr_lo = r.u32();
        let size_lo = r.u32();
        Ok(Self {
            ty,
            access: ResourceAccess::from_bits_truncate(flags & ACCESS_MASK),
            smmu_context_id,
            addr: join40(addr_hi, addr_lo),
            size: join40(size_hi, size_lo),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_byte_packs_access_then_type() {
        let entry = ResourceEntry::new(
            ResourceType::DmaConfig,
            ResourceAccess::READ | ResourceAccess::WRITE,
            7,
            0x12_3456_7000,
            0x2000,
        )
        .unwrap();
        let bytes = entry.to_le_bytes();
        assert_eq!(bytes[ResourceEntry::FLAGS_OFFSET], 0b0011_0011);
        assert_eq!(bytes[ResourceEntry::SMMU_CONTEXT_ID_OFFSET], 7);
        assert_eq!(bytes[ResourceEntry::ADDR_HI_OFFSET], 0x12);
        assert_eq!(bytes[ResourceEntry::SIZE_HI_OFFSET], 0);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            0x3456_7000
        );
        assert_eq!(ResourceEntry::decode_le(&bytes).unwrap(), entry);
    }

    #[test]
    fn rejects_wide_addresses() {
        assert!(ResourceEntry::new(
            ResourceType::Dram,
            ResourceAccess::READ,
            0,
            RESOURCE_MAX_ADDR + 1,
            4
        )
        .is_none());
    }

    #[test]
    fn decode_rejects_reserved_bits() {
        let mut bytes = ResourceEntry::INVALID.to_le_bytes();
        bytes[0] = 0b0000_0100;
        assert_eq!(
            ResourceEntry::decode_le(&bytes),
            Err(WireError::ReservedBitsSet)
        );
    }
}
