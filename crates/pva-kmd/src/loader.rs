//! Executable and DMA-configuration loaders.
//!
//! The resource table treats both loaders as external collaborators: it hands them the user's
//! blob and gets back a validated structure sized for one resource-table entry. The flat formats
//! implemented here are the bring-up container used by tests and tooling; production ELF parsing
//! and DMA address math plug in through the same traits.

use std::collections::HashSet;
use std::sync::Arc;

use pva_protocol::{ResourceAccess, ResourceEntry, ResourceType};

use crate::devmem::{DeviceMemory, DeviceMemoryProvider};
use crate::error::{KmdError, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Data = 0,
    Code = 1,
    SharedBuffer = 2,
}

impl SymbolKind {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Data),
            1 => Some(Self::Code),
            2 => Some(Self::SharedBuffer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub id: u32,
    pub kind: SymbolKind,
    pub name: String,
    pub addr: u32,
    pub size: u32,
}

/// An executable placed in device memory.
#[derive(Debug)]
pub struct LoadedExecutable {
    pub metadata: DeviceMemory,
    pub symbols: Vec<SymbolInfo>,
}

pub trait ExecutableLoader: Send + Sync {
    /// Parses `bytes` and places the image in memory allocated from `provider`.
    ///
    /// On error every allocation made by the loader has already been released.
    fn load(
        &self,
        bytes: &[u8],
        provider: &dyn DeviceMemoryProvider,
        smmu_context_id: u8,
    ) -> Result<LoadedExecutable>;
}

/// Counts carried alongside a DMA-config blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaConfigHeader {
    pub num_descriptors: u16,
    pub num_channels: u8,
    pub num_static_bindings: u8,
    pub num_dynamic_slots: u16,
}

/// A DMA configuration ready to be copied into its pooled buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDmaConfig {
    pub image: Vec<u8>,
    pub num_dynamic_slots: u16,
}

/// Resolves a statically bound resource ID to its entry, taking a reference on it.
///
/// Returns `None` if the ID is not live. References taken here are owned by the caller, who
/// drops them if loading fails or when the configuration is released.
pub type BindingResolver<'a> = dyn FnMut(u32) -> Option<ResourceEntry> + 'a;

pub trait DmaConfigLoader: Send + Sync {
    fn load(
        &self,
        header: &DmaConfigHeader,
        bytes: &[u8],
        max_image_size: u64,
        resolve: &mut BindingResolver<'_>,
    ) -> Result<LoadedDmaConfig>;
}

/// The loader pair a resource table delegates to.
#[derive(Clone)]
pub struct Loaders {
    pub executable: Arc<dyn ExecutableLoader>,
    pub dma_config: Arc<dyn DmaConfigLoader>,
}

impl Default for Loaders {
    fn default() -> Self {
        Self {
            executable: Arc::new(FlatExecutableLoader),
            dma_config: Arc::new(StaticDmaConfigLoader),
        }
    }
}

pub const FLAT_EXEC_MAGIC: [u8; 4] = *b"PVAX";
pub const FLAT_EXEC_VERSION: u16 = 1;
const FLAT_EXEC_HEADER_BYTES: usize = 16;
const FLAT_EXEC_SYMBOL_BYTES: usize = 48;
const SYMBOL_NAME_BYTES: usize = 32;

/// Loader for the flat `PVAX` container.
///
/// Layout: 16-byte header (`magic`, `version u16`, `num_symbols u16`, `code_len u32`, reserved),
/// then `num_symbols` 48-byte records (`id u32`, `kind u8`, 3 pad, `name [u8; 32]` NUL padded,
/// `addr u32`, `size u32`), then `code_len` bytes of image.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatExecutableLoader;

impl FlatExecutableLoader {
    pub fn encode(symbols: &[SymbolInfo], code: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            FLAT_EXEC_HEADER_BYTES + symbols.len() * FLAT_EXEC_SYMBOL_BYTES + code.len(),
        );
        out.extend_from_slice(&FLAT_EXEC_MAGIC);
        out.extend_from_slice(&FLAT_EXEC_VERSION.to_le_bytes());
        out.extend_from_slice(&(symbols.len() as u16).to_le_bytes());
        out.extend_from_slice(&(code.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        for sym in symbols {
            out.extend_from_slice(&sym.id.to_le_bytes());
            out.push(sym.kind as u8);
            out.extend_from_slice(&[0; 3]);
            let mut name = [0u8; SYMBOL_NAME_BYTES];
            let n = sym.name.len().min(SYMBOL_NAME_BYTES);
            name[..n].copy_from_slice(&sym.name.as_bytes()[..n]);
            out.extend_from_slice(&name);
            out.extend_from_slice(&sym.addr.to_le_bytes());
            out.extend_from_slice(&sym.size.to_le_bytes());
        }
        out.extend_from_slice(code);
        out
    }

    fn parse(bytes: &[u8]) -> Result<(Vec<SymbolInfo>, &[u8])> {
        if bytes.len() < FLAT_EXEC_HEADER_BYTES || bytes[..4] != FLAT_EXEC_MAGIC {
            return Err(KmdError::BadParameter("executable magic mismatch"));
        }
        if le16(bytes, 4) != FLAT_EXEC_VERSION {
            return Err(KmdError::BadParameter("unsupported executable version"));
        }
        let num_symbols = usize::from(le16(bytes, 6));
        let code_len = le32(bytes, 8) as usize;
        let code_start = FLAT_EXEC_HEADER_BYTES + num_symbols * FLAT_EXEC_SYMBOL_BYTES;
        if code_len == 0 || bytes.len() != code_start + code_len {
            return Err(KmdError::BadParameter("executable length mismatch"));
        }

        let mut seen = HashSet::new();
        let mut symbols = Vec::with_capacity(num_symbols);
        for rec in bytes[FLAT_EXEC_HEADER_BYTES..code_start].chunks_exact(FLAT_EXEC_SYMBOL_BYTES) {
            let id = le32(rec, 0);
            let kind =
                SymbolKind::from_u8(rec[4]).ok_or(KmdError::BadParameter("unknown symbol kind"))?;
            let raw_name = &rec[8..8 + SYMBOL_NAME_BYTES];
            let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(SYMBOL_NAME_BYTES);
            let name = std::str::from_utf8(&raw_name[..name_len])
                .map_err(|_| KmdError::BadParameter("symbol name is not utf-8"))?
                .to_owned();
            let addr = le32(rec, 40);
            let size = le32(rec, 44);
            if u64::from(addr) + u64::from(size) > code_len as u64 {
                return Err(KmdError::BadParameter("symbol outside executable image"));
            }
            if !seen.insert(id) {
                return Err(KmdError::BadParameter("duplicate symbol id"));
            }
            symbols.push(SymbolInfo {
                id,
                kind,
                name,
                addr,
                size,
            });
        }
        Ok((symbols, &bytes[code_start..]))
    }
}

impl ExecutableLoader for FlatExecutableLoader {
    fn load(
        &self,
        bytes: &[u8],
        provider: &dyn DeviceMemoryProvider,
        smmu_context_id: u8,
    ) -> Result<LoadedExecutable> {
        let (symbols, code) = Self::parse(bytes)?;
        let metadata = provider.allocate(code.len() as u64, smmu_context_id)?;
        if let Err(err) = metadata.write_from(0, code) {
            provider.release(metadata);
            return Err(err.into());
        }
        Ok(LoadedExecutable { metadata, symbols })
    }
}

pub const DMA_MAX_CHANNELS: u8 = 16;
pub const DMA_MAX_DESCRIPTORS: u16 = 64;
pub const DMA_DESCRIPTOR_BYTES: usize = 32;
const DMA_BINDING_BYTES: usize = 16;
const DMA_IMAGE_HEADER_BYTES: usize = 8;

/// Loader that copies descriptors verbatim and resolves static bindings to addresses.
///
/// Input: `num_descriptors` 32-byte descriptors followed by `num_static_bindings` 16-byte
/// bindings (`slot u16`, `access u16`, `resource_id u32`, `offset u32`, `size u32`). Output image:
/// an 8-byte count header, the descriptors, then one 16-byte resolved binding per static binding
/// (`slot u16`, pad, `size u32`, `iova u64`).
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticDmaConfigLoader;

impl StaticDmaConfigLoader {
    pub fn image_size(header: &DmaConfigHeader) -> usize {
        DMA_IMAGE_HEADER_BYTES
            + usize::from(header.num_descriptors) * DMA_DESCRIPTOR_BYTES
            + usize::from(header.num_static_bindings) * DMA_BINDING_BYTES
    }

    pub fn encode_binding(
        slot: u16,
        access: ResourceAccess,
        resource_id: u32,
        offset: u32,
        size: u32,
    ) -> [u8; 16] {
        let mut out = [0u8; DMA_BINDING_BYTES];
        out[0..2].copy_from_slice(&slot.to_le_bytes());
        out[2..4].copy_from_slice(&u16::from(access.bits()).to_le_bytes());
        out[4..8].copy_from_slice(&resource_id.to_le_bytes());
        out[8..12].copy_from_slice(&offset.to_le_bytes());
        out[12..16].copy_from_slice(&size.to_le_bytes());
        out
    }
}

impl DmaConfigLoader for StaticDmaConfigLoader {
    fn load(
        &self,
        header: &DmaConfigHeader,
        bytes: &[u8],
        max_image_size: u64,
        resolve: &mut BindingResolver<'_>,
    ) -> Result<LoadedDmaConfig> {
        if header.num_channels == 0 || header.num_channels > DMA_MAX_CHANNELS {
            return Err(KmdError::BadParameter("dma channel count out of range"));
        }
        if header.num_descriptors == 0 || header.num_descriptors > DMA_MAX_DESCRIPTORS {
            return Err(KmdError::BadParameter("dma descriptor count out of range"));
        }
        let desc_bytes = usize::from(header.num_descriptors) * DMA_DESCRIPTOR_BYTES;
        let binding_bytes = usize::from(header.num_static_bindings) * DMA_BINDING_BYTES;
        if bytes.len() != desc_bytes + binding_bytes {
            return Err(KmdError::BadParameter("dma config length mismatch"));
        }
        let image_size = Self::image_size(header);
        if image_size as u64 > max_image_size {
            return Err(KmdError::BadParameter("dma config exceeds pooled buffer"));
        }

        let mut image = Vec::with_capacity(image_size);
        image.extend_from_slice(&header.num_descriptors.to_le_bytes());
        image.push(header.num_channels);
        image.push(header.num_static_bindings);
        image.extend_from_slice(&header.num_dynamic_slots.to_le_bytes());
        image.extend_from_slice(&[0; 2]);
        image.extend_from_slice(&bytes[..desc_bytes]);

        let mut slots = HashSet::new();
        for rec in bytes[desc_bytes..].chunks_exact(DMA_BINDING_BYTES) {
            let slot = le16(rec, 0);
            let access = ResourceAccess::from_bits(le16(rec, 2) as u8)
                .filter(|a| !a.is_empty())
                .ok_or(KmdError::BadParameter("invalid binding access"))?;
            let resource_id = le32(rec, 4);
            let offset = le32(rec, 8);
            let size = le32(rec, 12);
            if !slots.insert(slot) {
                return Err(KmdError::BadParameter("duplicate static binding slot"));
            }
            let entry = resolve(resource_id)
                .ok_or(KmdError::BadParameter("static binding to unknown resource"))?;
            if entry.ty != ResourceType::Dram {
                return Err(KmdError::BadParameter("static binding to non-dram resource"));
            }
            if !entry.access.contains(access) {
                return Err(KmdError::BadParameter("static binding access not permitted"));
            }
            if u64::from(offset) + u64::from(size) > entry.size {
                return Err(KmdError::BadParameter("static binding outside resource"));
            }
            image.extend_from_slice(&slot.to_le_bytes());
            image.extend_from_slice(&[0; 2]);
            image.extend_from_slice(&size.to_le_bytes());
            image.extend_from_slice(&(entry.addr + u64::from(offset)).to_le_bytes());
        }
        debug_assert_eq!(image.len(), image_size);

        Ok(LoadedDmaConfig {
            image,
            num_dynamic_slots: header.num_dynamic_slots,
        })
    }
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devmem::SystemMemoryProvider;

    fn sym(id: u32, name: &str, addr: u32, size: u32) -> SymbolInfo {
        SymbolInfo {
            id,
            kind: SymbolKind::Data,
            name: name.to_owned(),
            addr,
            size,
        }
    }

    #[test]
    fn flat_executable_places_code_and_symbols() {
        let provider = SystemMemoryProvider::new();
        let code = [0x11u8; 64];
        let blob =
            FlatExecutableLoader::encode(&[sym(1, "input", 0, 16), sym(2, "out", 16, 8)], &code);

        let exe = FlatExecutableLoader.load(&blob, &provider, 4).unwrap();
        assert_eq!(exe.symbols.len(), 2);
        assert_eq!(exe.symbols[1].name, "out");
        assert_eq!(exe.metadata.size(), 64);
        assert_eq!(exe.metadata.smmu_context_id(), 4);
        assert_eq!(exe.metadata.read_vec(0, 64).unwrap(), code.to_vec());
        provider.release(exe.metadata);
    }

    #[test]
    fn flat_executable_rejects_symbol_past_image() {
        let provider = SystemMemoryProvider::new();
        let blob = FlatExecutableLoader::encode(&[sym(1, "x", 60, 8)], &[0; 64]);
        assert_eq!(
            FlatExecutableLoader.load(&blob, &provider, 0).unwrap_err(),
            KmdError::BadParameter("symbol outside executable image")
        );
        assert_eq!(provider.stats().allocations, 0);
    }

    #[test]
    fn flat_executable_rejects_bad_magic() {
        let provider = SystemMemoryProvider::new();
        let mut blob = FlatExecutableLoader::encode(&[], &[0; 4]);
        blob[0] = b'X';
        assert!(FlatExecutableLoader.load(&blob, &provider, 0).is_err());
    }

    fn dram_entry(addr: u64, size: u64) -> ResourceEntry {
        ResourceEntry::new(ResourceType::Dram, ResourceAccess::all(), 1, addr, size).unwrap()
    }

    #[test]
    fn static_bindings_resolve_to_addresses() {
        let header = DmaConfigHeader {
            num_descriptors: 1,
            num_channels: 1,
            num_static_bindings: 1,
            num_dynamic_slots: 2,
        };
        let mut bytes = vec![0xD5; DMA_DESCRIPTOR_BYTES];
        bytes.extend_from_slice(&StaticDmaConfigLoader::encode_binding(
            3,
            ResourceAccess::READ,
            7,
            0x10,
            0x20,
        ));

        let mut resolved = Vec::new();
        let mut resolve = |id: u32| {
            resolved.push(id);
            (id == 7).then(|| dram_entry(0x4000_0000, 0x100))
        };
        let cfg = StaticDmaConfigLoader
            .load(&header, &bytes, 4096, &mut resolve)
            .unwrap();
        assert_eq!(resolved, vec![7]);
        assert_eq!(cfg.num_dynamic_slots, 2);
        assert_eq!(cfg.image.len(), StaticDmaConfigLoader::image_size(&header));
        let tail = &cfg.image[cfg.image.len() - 8..];
        assert_eq!(tail, &0x4000_0010u64.to_le_bytes());
    }

    #[test]
    fn static_binding_outside_resource_is_rejected() {
        let header = DmaConfigHeader {
            num_descriptors: 1,
            num_channels: 1,
            num_static_bindings: 1,
            num_dynamic_slots: 0,
        };
        let mut bytes = vec![0; DMA_DESCRIPTOR_BYTES];
        bytes.extend_from_slice(&StaticDmaConfigLoader::encode_binding(
            0,
            ResourceAccess::READ,
            7,
            0xF0,
            0x20,
        ));
        let mut resolve = |_id: u32| Some(dram_entry(0x1000, 0x100));
        assert_eq!(
            StaticDmaConfigLoader
                .load(&header, &bytes, 4096, &mut resolve)
                .unwrap_err(),
            KmdError::BadParameter("static binding outside resource")
        );
    }
}
