//! Per-context table of reference-counted resources.
//!
//! Firmware addresses buffers, executables and DMA configurations by small integer IDs. The
//! table hands out those IDs, keeps the host-side record for each one, and mirrors the
//! firmware-format [`ResourceEntry`] array into `table_mem`. Once the table base has been given
//! to firmware the mirror is never patched directly again; later changes travel as
//! `UPDATE_RESOURCE_TABLE` commands.
//!
//! Lock order: the table mutex is never held while calling the provider, a loader, or the DMA
//! config pool on the release path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pva_protocol::{
    ResourceAccess, ResourceEntry, ResourceType, RESOURCE_ID_BASE, RESOURCE_MAX_ADDR,
};
use tracing::{debug, trace, warn};

use crate::block_alloc::BlockAllocator;
use crate::devmem::{DeviceMemory, DeviceMemoryProvider};
use crate::devmem_pool::{DevmemElement, DeviceMemoryPool};
use crate::error::{KmdError, Result};
use crate::loader::{DmaConfigHeader, LoadedExecutable, Loaders, SymbolInfo};
use crate::sync::{lock, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTableConfig {
    /// Also the CCQ the table belongs to.
    pub resource_table_id: u8,
    pub smmu_context_id: u8,
    pub n_entries: u32,
    pub sema_timeout: Duration,
    pub dma_config_size: u32,
    pub dma_config_pool_incr: u32,
}

#[derive(Debug)]
enum ResourceKind {
    Dram {
        mem: DeviceMemory,
        access: ResourceAccess,
    },
    ExecBin(LoadedExecutable),
    DmaConfig {
        buffer: DevmemElement,
        /// IDs whose references this configuration holds.
        static_bindings: Vec<u32>,
        num_dynamic_slots: u16,
    },
}

#[derive(Debug)]
struct ResourceRecord {
    ref_count: u32,
    /// `None` while the ID is reserved and the resource is still being built.
    kind: Option<ResourceKind>,
    /// Set once an unregister has been issued; the registration reference is dropped by
    /// whoever set it.
    unregistering: bool,
}

struct TableInner {
    records: BlockAllocator<ResourceRecord>,
    curr_max_resource_id: u32,
    fw_owned: bool,
}

pub struct ResourceTable {
    config: ResourceTableConfig,
    provider: Arc<dyn DeviceMemoryProvider>,
    loaders: Loaders,
    table_mem: DeviceMemory,
    dma_config_pool: DeviceMemoryPool,
    sema: Semaphore,
    inner: Mutex<TableInner>,
}

/// A held reference on a live resource. Dropping it drops the reference.
pub struct ResourceRef<'a> {
    table: &'a ResourceTable,
    id: u32,
    entry: ResourceEntry,
    memory: DeviceMemory,
    offset: u64,
}

impl ResourceRef<'_> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn entry(&self) -> ResourceEntry {
        self.entry
    }

    pub fn ty(&self) -> ResourceType {
        self.entry.ty
    }

    /// The allocation backing this resource and the resource's offset inside it.
    pub fn memory(&self) -> (&DeviceMemory, u64) {
        (&self.memory, self.offset)
    }
}

impl Drop for ResourceRef<'_> {
    fn drop(&mut self) {
        self.table.drop_resource(self.id);
    }
}

impl ResourceKind {
    fn entry(&self, table_smmu: u8) -> ResourceEntry {
        match self {
            Self::Dram { mem, access } => ResourceEntry {
                ty: ResourceType::Dram,
                access: *access,
                smmu_context_id: mem.smmu_context_id(),
                addr: mem.iova(),
                size: mem.size(),
            },
            Self::ExecBin(exe) => ResourceEntry {
                ty: ResourceType::ExecBin,
                access: ResourceAccess::READ,
                smmu_context_id: exe.metadata.smmu_context_id(),
                addr: exe.metadata.iova(),
                size: exe.metadata.size(),
            },
            Self::DmaConfig { buffer, .. } => ResourceEntry {
                ty: ResourceType::DmaConfig,
                access: ResourceAccess::READ,
                smmu_context_id: table_smmu,
                addr: buffer.iova(),
                size: buffer.size(),
            },
        }
    }

    fn memory(&self) -> (DeviceMemory, u64) {
        match self {
            Self::Dram { mem, .. } => (mem.clone(), 0),
            Self::ExecBin(exe) => (exe.metadata.clone(), 0),
            Self::DmaConfig { buffer, .. } => {
                let (mem, offset) = buffer.memory();
                (mem.clone(), offset)
            }
        }
    }
}

impl ResourceTable {
    /// Bytes of `table_mem` for `n_entries` resources; slot 0 is the invalid ID.
    pub fn table_bytes(n_entries: u32) -> u64 {
        (u64::from(n_entries) + 1) * ResourceEntry::SIZE_BYTES as u64
    }

    pub fn new(
        config: ResourceTableConfig,
        provider: Arc<dyn DeviceMemoryProvider>,
        loaders: Loaders,
    ) -> Result<Self> {
        if config.n_entries == 0 || config.dma_config_size == 0 || config.dma_config_pool_incr == 0
        {
            return Err(KmdError::Inval("empty resource table"));
        }
        let table_mem =
            provider.allocate(Self::table_bytes(config.n_entries), config.smmu_context_id)?;
        let dma_config_pool = DeviceMemoryPool::new(
            Arc::clone(&provider),
            config.smmu_context_id,
            u64::from(config.dma_config_size),
            config.dma_config_pool_incr,
        );
        debug!(
            resource_table_id = config.resource_table_id,
            n_entries = config.n_entries,
            iova = table_mem.iova(),
            "resource table created"
        );
        Ok(Self {
            config,
            provider,
            loaders,
            table_mem,
            dma_config_pool,
            sema: Semaphore::new(config.n_entries),
            inner: Mutex::new(TableInner {
                records: BlockAllocator::new(RESOURCE_ID_BASE, config.n_entries),
                curr_max_resource_id: 0,
                fw_owned: false,
            }),
        })
    }

    pub fn resource_table_id(&self) -> u8 {
        self.config.resource_table_id
    }

    pub fn smmu_context_id(&self) -> u8 {
        self.config.smmu_context_id
    }

    pub fn n_entries(&self) -> u32 {
        self.config.n_entries
    }

    /// Entry count handed to firmware, including the invalid slot 0.
    pub fn max_n_entries(&self) -> u32 {
        self.config.n_entries + 1
    }

    pub fn table_mem(&self) -> &DeviceMemory {
        &self.table_mem
    }

    pub fn curr_max_resource_id(&self) -> u32 {
        lock(&self.inner).curr_max_resource_id
    }

    pub fn live_count(&self) -> u32 {
        lock(&self.inner).records.num_allocated()
    }

    pub fn dma_config_pool(&self) -> &DeviceMemoryPool {
        &self.dma_config_pool
    }

    fn reserve_id(&self) -> Result<u32> {
        if !self.sema.acquire_timeout(self.config.sema_timeout) {
            debug!(
                resource_table_id = self.config.resource_table_id,
                "timed out waiting for a free resource id"
            );
            return Err(KmdError::NoResourceId);
        }
        let mut inner = lock(&self.inner);
        match inner.records.alloc(ResourceRecord {
            ref_count: 0,
            kind: None,
            unregistering: false,
        }) {
            Ok(id) => {
                inner.curr_max_resource_id = inner.curr_max_resource_id.max(id);
                Ok(id)
            }
            Err(err) => {
                drop(inner);
                self.sema.release();
                Err(err)
            }
        }
    }

    fn abandon_id(&self, id: u32) {
        lock(&self.inner).records.free(id);
        self.sema.release();
    }

    fn commit(&self, id: u32, kind: ResourceKind) {
        let mut inner = lock(&self.inner);
        match inner.records.get_mut(id) {
            Some(record) => {
                record.ref_count = 1;
                record.kind = Some(kind);
            }
            None => debug_assert!(false, "reserved resource id {id} vanished"),
        }
    }

    /// Registers `mem` as a DRAM buffer. The table owns `mem` from here on and releases it to
    /// the provider when the last reference goes, or immediately if registration fails.
    pub fn add_dram_buffer_resource(
        &self,
        mem: DeviceMemory,
        access: ResourceAccess,
    ) -> Result<u32> {
        if access.is_empty() {
            self.provider.release(mem);
            return Err(KmdError::BadParameter("dram resource without access rights"));
        }
        if mem.iova() > RESOURCE_MAX_ADDR || mem.size() > RESOURCE_MAX_ADDR {
            self.provider.release(mem);
            return Err(KmdError::BadParameter("dram resource beyond 40-bit address space"));
        }
        let id = match self.reserve_id() {
            Ok(id) => id,
            Err(err) => {
                self.provider.release(mem);
                return Err(err);
            }
        };
        trace!(id, iova = mem.iova(), size = mem.size(), "dram resource added");
        self.commit(id, ResourceKind::Dram { mem, access });
        Ok(id)
    }

    pub fn add_vpu_bin_resource(&self, bytes: &[u8]) -> Result<u32> {
        let id = self.reserve_id()?;
        match self
            .loaders
            .executable
            .load(bytes, self.provider.as_ref(), self.config.smmu_context_id)
        {
            Ok(exe) => {
                trace!(id, symbols = exe.symbols.len(), "executable resource added");
                self.commit(id, ResourceKind::ExecBin(exe));
                Ok(id)
            }
            Err(err) => {
                self.abandon_id(id);
                Err(err)
            }
        }
    }

    pub fn add_dma_config_resource(&self, header: &DmaConfigHeader, bytes: &[u8]) -> Result<u32> {
        let id = self.reserve_id()?;
        let buffer = match self.dma_config_pool.zalloc() {
            Ok(buffer) => buffer,
            Err(err) => {
                self.abandon_id(id);
                return Err(err);
            }
        };

        let mut bound = Vec::new();
        let loaded = {
            let mut resolve = |rid: u32| {
                let entry = self.acquire_entry(rid)?;
                bound.push(rid);
                Some(entry)
            };
            self.loaders
                .dma_config
                .load(header, bytes, buffer.size(), &mut resolve)
        };
        let written = loaded.and_then(|cfg| {
            buffer.write(0, &cfg.image)?;
            Ok(cfg)
        });

        match written {
            Ok(cfg) => {
                trace!(id, bindings = bound.len(), "dma config resource added");
                self.commit(
                    id,
                    ResourceKind::DmaConfig {
                        buffer,
                        static_bindings: bound,
                        num_dynamic_slots: cfg.num_dynamic_slots,
                    },
                );
                Ok(id)
            }
            Err(err) => {
                for rid in bound {
                    self.drop_resource(rid);
                }
                self.dma_config_pool.free(buffer);
                self.abandon_id(id);
                Err(err)
            }
        }
    }

    fn acquire_entry(&self, id: u32) -> Option<ResourceEntry> {
        let mut inner = lock(&self.inner);
        let record = inner.records.get_mut(id)?;
        if record.unregistering {
            return None;
        }
        let kind = record.kind.as_ref()?;
        record.ref_count = record.ref_count.checked_add(1)?;
        Some(kind.entry(self.config.smmu_context_id))
    }

    /// Takes a reference on `id`. Returns `None` if the ID is not live.
    pub fn use_resource(&self, id: u32) -> Option<ResourceRef<'_>> {
        let mut inner = lock(&self.inner);
        let record = inner.records.get_mut(id)?;
        let kind = record.kind.as_ref()?;
        let Some(ref_count) = record.ref_count.checked_add(1) else {
            warn!(id, "resource reference count saturated");
            return None;
        };
        record.ref_count = ref_count;
        let entry = kind.entry(self.config.smmu_context_id);
        let (memory, offset) = kind.memory();
        Some(ResourceRef {
            table: self,
            id,
            entry,
            memory,
            offset,
        })
    }

    /// Drops one reference. The last reference releases the resource and frees its ID.
    pub fn drop_resource(&self, id: u32) {
        let released = {
            let mut inner = lock(&self.inner);
            match inner.records.get_mut(id) {
                Some(ResourceRecord {
                    ref_count,
                    kind: Some(_),
                    ..
                }) => {
                    debug_assert!(*ref_count > 0);
                    *ref_count -= 1;
                    if *ref_count == 0 {
                        inner.records.free(id).and_then(|r| r.kind)
                    } else {
                        None
                    }
                }
                _ => {
                    warn!(
                        id,
                        resource_table_id = self.config.resource_table_id,
                        "drop of unknown resource id"
                    );
                    None
                }
            }
        };
        if let Some(kind) = released {
            trace!(id, "resource released");
            self.release_kind(kind, true);
            self.sema.release();
        }
    }

    /// Claims the registration reference of DRAM buffer `id` for an unregister.
    ///
    /// Exactly one caller wins the claim; it must follow up with
    /// [`ResourceTable::finish_unregister`] or [`ResourceTable::cancel_unregister`]. A claimed
    /// buffer can no longer be bound by new DMA configurations.
    pub fn begin_unregister(&self, id: u32) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Some(record) = inner.records.get_mut(id) else {
            return Err(KmdError::Inval("unknown resource id"));
        };
        match record.kind {
            None => Err(KmdError::Inval("unknown resource id")),
            Some(ResourceKind::Dram { .. }) if record.unregistering => {
                Err(KmdError::Inval("resource is already being unregistered"))
            }
            Some(ResourceKind::Dram { .. }) => {
                record.unregistering = true;
                Ok(())
            }
            Some(_) => Err(KmdError::Inval("resource is not a dram buffer")),
        }
    }

    /// Gives a claim back after the unregister command never reached firmware.
    pub fn cancel_unregister(&self, id: u32) {
        match lock(&self.inner).records.get_mut(id) {
            Some(record) if record.unregistering => record.unregistering = false,
            _ => debug_assert!(false, "cancelled unregister of unclaimed resource {id}"),
        }
    }

    /// Drops the registration reference once firmware has forgotten the entry.
    pub fn finish_unregister(&self, id: u32) {
        debug_assert!(
            lock(&self.inner).records.get(id).is_some_and(|r| r.unregistering),
            "finished unregister of unclaimed resource {id}"
        );
        self.drop_resource(id);
    }

    fn release_kind(&self, kind: ResourceKind, drop_bindings: bool) {
        match kind {
            ResourceKind::Dram { mem, .. } => self.provider.release(mem),
            ResourceKind::ExecBin(exe) => self.provider.release(exe.metadata),
            ResourceKind::DmaConfig {
                buffer,
                static_bindings,
                ..
            } => {
                self.dma_config_pool.free(buffer);
                if drop_bindings {
                    for rid in static_bindings {
                        self.drop_resource(rid);
                    }
                }
            }
        }
    }

    /// Snapshot of the firmware entry for `id`.
    pub fn make_resource_entry(&self, id: u32) -> Result<ResourceEntry> {
        self.use_resource(id)
            .map(|r| r.entry())
            .ok_or(KmdError::Inval("unknown resource id"))
    }

    pub fn exec_symbols(&self, id: u32) -> Result<Vec<SymbolInfo>> {
        let inner = lock(&self.inner);
        match inner.records.get(id).and_then(|r| r.kind.as_ref()) {
            Some(ResourceKind::ExecBin(exe)) => Ok(exe.symbols.clone()),
            Some(_) => Err(KmdError::Inval("resource is not an executable")),
            None => Err(KmdError::Inval("unknown resource id")),
        }
    }

    /// Number of dynamic slots a DMA configuration leaves for submit-time binding.
    pub fn dma_config_dynamic_slots(&self, id: u32) -> Result<u16> {
        let inner = lock(&self.inner);
        match inner.records.get(id).and_then(|r| r.kind.as_ref()) {
            Some(ResourceKind::DmaConfig {
                num_dynamic_slots, ..
            }) => Ok(*num_dynamic_slots),
            Some(_) => Err(KmdError::Inval("resource is not a dma config")),
            None => Err(KmdError::Inval("unknown resource id")),
        }
    }

    /// Writes every entry up to the high-water mark into `table_mem`.
    ///
    /// Only valid before firmware has been given the table.
    pub fn update_fw_resource_table(&self) -> Result<()> {
        let inner = lock(&self.inner);
        if inner.fw_owned {
            return Err(KmdError::Inval("resource table already owned by firmware"));
        }
        let smmu = self.config.smmu_context_id;
        for id in RESOURCE_ID_BASE..=inner.curr_max_resource_id {
            let entry = inner
                .records
                .get(id)
                .and_then(|r| r.kind.as_ref())
                .map_or(ResourceEntry::INVALID, |k| k.entry(smmu));
            self.table_mem.write_from(
                u64::from(id) * ResourceEntry::SIZE_BYTES as u64,
                &entry.to_le_bytes(),
            )?;
        }
        Ok(())
    }

    pub fn mark_fw_owned(&self) {
        lock(&self.inner).fw_owned = true;
    }

    pub fn is_fw_owned(&self) -> bool {
        lock(&self.inner).fw_owned
    }

    /// Releases every live resource regardless of its reference count. Returns how many were
    /// released.
    pub fn release_all(&self) -> usize {
        let released: Vec<(u32, ResourceKind)> = {
            let mut inner = lock(&self.inner);
            let max = inner.curr_max_resource_id;
            (RESOURCE_ID_BASE..=max)
                .filter(|&id| inner.records.get(id).is_some_and(|r| r.kind.is_some()))
                .collect::<Vec<_>>()
                .into_iter()
                .filter_map(|id| Some((id, inner.records.free(id)?.kind?)))
                .collect()
        };
        let count = released.len();
        for (id, kind) in released {
            trace!(id, "force releasing resource");
            // Bound IDs are in this same walk.
            self.release_kind(kind, false);
            self.sema.release();
        }
        if count > 0 {
            debug!(
                resource_table_id = self.config.resource_table_id,
                count, "force released live resources"
            );
        }
        count
    }
}

impl Drop for ResourceTable {
    fn drop(&mut self) {
        self.release_all();
        self.provider.release(self.table_mem.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devmem::SystemMemoryProvider;
    use crate::loader::{FlatExecutableLoader, StaticDmaConfigLoader, SymbolKind};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn config(n_entries: u32) -> ResourceTableConfig {
        ResourceTableConfig {
            resource_table_id: 2,
            smmu_context_id: 2,
            n_entries,
            sema_timeout: Duration::from_millis(20),
            dma_config_size: 512,
            dma_config_pool_incr: 2,
        }
    }

    /// Panics on any release of memory that was already released.
    struct StrictProvider {
        inner: SystemMemoryProvider,
        released: Mutex<HashSet<u64>>,
    }

    impl StrictProvider {
        fn new() -> Self {
            Self {
                inner: SystemMemoryProvider::new(),
                released: Mutex::new(HashSet::new()),
            }
        }
    }

    impl DeviceMemoryProvider for StrictProvider {
        fn allocate(&self, size: u64, smmu_context_id: u8) -> Result<DeviceMemory> {
            self.inner.allocate(size, smmu_context_id)
        }

        fn release(&self, mem: DeviceMemory) {
            assert!(
                self.released.lock().unwrap().insert(mem.iova()),
                "double free of iova 0x{:x}",
                mem.iova()
            );
            self.inner.release(mem);
        }
    }

    fn table(n_entries: u32) -> (Arc<SystemMemoryProvider>, ResourceTable) {
        let provider = Arc::new(SystemMemoryProvider::new());
        let table = ResourceTable::new(config(n_entries), provider.clone(), Loaders::default())
            .unwrap();
        (provider, table)
    }

    #[test]
    fn dram_entry_matches_memory_and_frees_once() {
        let provider = Arc::new(StrictProvider::new());
        let table =
            ResourceTable::new(config(4), provider.clone(), Loaders::default()).unwrap();
        let mem = provider.allocate(0x3000, 5).unwrap();
        let (iova, size) = (mem.iova(), mem.size());

        let id = table
            .add_dram_buffer_resource(mem, ResourceAccess::READ | ResourceAccess::WRITE)
            .unwrap();
        assert_eq!(id, 1);
        let entry = table.make_resource_entry(id).unwrap();
        assert_eq!(
            entry,
            ResourceEntry {
                ty: ResourceType::Dram,
                access: ResourceAccess::READ | ResourceAccess::WRITE,
                smmu_context_id: 5,
                addr: iova,
                size,
            }
        );

        let held = table.use_resource(id).unwrap();
        table.drop_resource(id);
        assert_eq!(provider.inner.stats().releases, 0);
        drop(held);
        assert_eq!(provider.inner.stats().releases, 1);
        assert_eq!(table.live_count(), 0);
        assert!(table.use_resource(id).is_none());

        drop(table);
        assert_eq!(provider.inner.stats().live, 0);
    }

    #[test]
    fn exhausted_table_times_out_and_reuses_freed_id() {
        let (provider, table) = table(4);
        for want in 1..=4 {
            let mem = provider.allocate(64, 2).unwrap();
            assert_eq!(table.add_dram_buffer_resource(mem, ResourceAccess::READ), Ok(want));
        }
        let mem = provider.allocate(64, 2).unwrap();
        assert_eq!(
            table.add_dram_buffer_resource(mem, ResourceAccess::READ),
            Err(KmdError::NoResourceId)
        );

        table.drop_resource(2);
        let mem = provider.allocate(64, 2).unwrap();
        assert_eq!(table.add_dram_buffer_resource(mem, ResourceAccess::READ), Ok(2));
        assert_eq!(table.curr_max_resource_id(), 4);

        drop(table);
        let stats = provider.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.double_releases, 0);
    }

    #[test]
    fn drop_of_unknown_id_is_ignored() {
        let (_provider, table) = table(2);
        table.drop_resource(1);
        table.drop_resource(99);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn failed_executable_load_returns_the_id() {
        let (_provider, table) = table(1);
        assert!(matches!(
            table.add_vpu_bin_resource(b"not an executable"),
            Err(KmdError::BadParameter(_))
        ));
        assert_eq!(table.live_count(), 0);

        let blob = FlatExecutableLoader::encode(
            &[SymbolInfo {
                id: 9,
                kind: SymbolKind::Data,
                name: "coeffs".into(),
                addr: 0,
                size: 4,
            }],
            &[1, 2, 3, 4],
        );
        let id = table.add_vpu_bin_resource(&blob).unwrap();
        assert_eq!(id, 1);
        assert_eq!(table.exec_symbols(id).unwrap()[0].name, "coeffs");
        assert_eq!(table.make_resource_entry(id).unwrap().ty, ResourceType::ExecBin);
    }

    fn dma_blob(resource_id: u32, offset: u32) -> (DmaConfigHeader, Vec<u8>) {
        let header = DmaConfigHeader {
            num_descriptors: 1,
            num_channels: 1,
            num_static_bindings: 1,
            num_dynamic_slots: 2,
        };
        let mut bytes = vec![0x11; 32];
        bytes.extend_from_slice(&StaticDmaConfigLoader::encode_binding(
            0,
            ResourceAccess::READ,
            resource_id,
            offset,
            0x40,
        ));
        (header, bytes)
    }

    #[test]
    fn dma_config_holds_its_bindings() {
        let (provider, table) = table(4);
        let mem = provider.allocate(0x100, 2).unwrap();
        let iova = mem.iova();
        let buf = table.add_dram_buffer_resource(mem, ResourceAccess::READ).unwrap();

        let (header, bytes) = dma_blob(buf, 0x20);
        let cfg = table.add_dma_config_resource(&header, &bytes).unwrap();
        assert_eq!(table.dma_config_dynamic_slots(cfg), Ok(2));

        let r = table.use_resource(cfg).unwrap();
        let (seg, offset) = r.memory();
        let image = seg.read_vec(offset, StaticDmaConfigLoader::image_size(&header)).unwrap();
        assert_eq!(&image[48..56], &(iova + 0x20).to_le_bytes());
        drop(r);

        // The configuration keeps the buffer alive after the owner's reference is gone.
        table.drop_resource(buf);
        assert!(table.use_resource(buf).is_some());
        table.drop_resource(cfg);
        assert!(table.use_resource(buf).is_none());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn unregister_claim_is_exclusive() {
        let (provider, table) = table(4);
        let mem = provider.allocate(0x100, 2).unwrap();
        let buf = table.add_dram_buffer_resource(mem, ResourceAccess::READ).unwrap();
        let (header, bytes) = dma_blob(buf, 0x20);
        let cfg = table.add_dma_config_resource(&header, &bytes).unwrap();

        assert!(matches!(table.begin_unregister(cfg), Err(KmdError::Inval(_))));
        table.begin_unregister(buf).unwrap();
        assert!(matches!(table.begin_unregister(buf), Err(KmdError::Inval(_))));
        // A claimed buffer takes no new bindings.
        assert!(matches!(
            table.add_dma_config_resource(&header, &bytes),
            Err(KmdError::BadParameter(_))
        ));
        table.cancel_unregister(buf);
        table.begin_unregister(buf).unwrap();

        table.finish_unregister(buf);
        assert!(table.use_resource(buf).is_some());
        assert!(matches!(table.begin_unregister(buf), Err(KmdError::Inval(_))));
        table.drop_resource(cfg);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn failed_dma_config_releases_buffer_bindings_and_id() {
        let (provider, table) = table(4);
        let mem = provider.allocate(0x40, 2).unwrap();
        let buf = table.add_dram_buffer_resource(mem, ResourceAccess::READ).unwrap();

        let (header, bytes) = dma_blob(buf, 0x20);
        assert!(table.add_dma_config_resource(&header, &bytes).is_err());
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.dma_config_pool().free_count(), 2);

        // Reference taken by the resolver was dropped: one drop now releases the buffer.
        table.drop_resource(buf);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn firmware_mirror_is_init_time_only() {
        let (provider, table) = table(3);
        let a = table
            .add_dram_buffer_resource(provider.allocate(64, 2).unwrap(), ResourceAccess::WRITE)
            .unwrap();
        let b = table
            .add_dram_buffer_resource(provider.allocate(64, 2).unwrap(), ResourceAccess::READ)
            .unwrap();
        table.drop_resource(a);
        table.update_fw_resource_table().unwrap();

        let slot = |id: u32| {
            let raw = table
                .table_mem()
                .read_vec(u64::from(id) * 16, ResourceEntry::SIZE_BYTES)
                .unwrap();
            ResourceEntry::decode_le(&raw).unwrap()
        };
        assert_eq!(slot(a), ResourceEntry::INVALID);
        assert_eq!(slot(b), table.make_resource_entry(b).unwrap());

        table.mark_fw_owned();
        assert!(matches!(
            table.update_fw_resource_table(),
            Err(KmdError::Inval(_))
        ));
    }

    #[test]
    fn release_all_ignores_reference_counts() {
        let (provider, table) = table(4);
        let mem = provider.allocate(0x100, 2).unwrap();
        let buf = table.add_dram_buffer_resource(mem, ResourceAccess::READ).unwrap();
        let (header, bytes) = dma_blob(buf, 0);
        table.add_dma_config_resource(&header, &bytes).unwrap();
        std::mem::forget(table.use_resource(buf));

        assert_eq!(table.release_all(), 2);
        assert_eq!(table.live_count(), 0);
        drop(table);
        let stats = provider.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.double_releases, 0);
    }
}
