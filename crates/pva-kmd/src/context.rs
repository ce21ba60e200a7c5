//! Client contexts.
//!
//! A context is one CCQ's worth of state: a resource table, a privileged queue with its own
//! chunk pool and submitter, the async status ring, and up to `max_queues_per_context` user
//! queues. [`Context`] is the handle the device hands out; everything created by a successful
//! init lives in [`ContextResources`], whose field order is the reverse of the init order so
//! that dropping it unwinds init step by step.
//!
//! Firmware sees a context only after `Device::context_init` has told it about the table and
//! the privileged queue. Teardown runs through `Device::context_destroy`.

use std::sync::{Arc, Mutex};

use pva_protocol::{
    PvaCmdWriter, ResourceAccess, StatusRecord, StatusRingHeader, PRIV_QUEUE_ID,
    STATUS_INTERFACE,
};
use tracing::{debug, info, warn};

use crate::block_alloc::BlockAllocator;
use crate::cmdbuf::CmdbufChunkPool;
use crate::config::{ContextInitParams, KmdConfig};
use crate::devmem::{DeviceMemory, DeviceMemoryProvider, OwnedMemory};
use crate::error::{KmdError, Result};
use crate::fw::FirmwareChannel;
use crate::loader::{DmaConfigHeader, Loaders, SymbolInfo};
use crate::queue::SubmissionQueue;
use crate::resource_table::{ResourceTable, ResourceTableConfig};
use crate::submitter::Submitter;
use crate::sync::lock;
use crate::syncpoint::{SyncpointLease, SyncpointPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Initialized,
    Destroying,
    Freed,
}

/// Device-level collaborators a context needs after init.
#[derive(Clone)]
pub(crate) struct ContextEnv {
    pub(crate) config: KmdConfig,
    pub(crate) provider: Arc<dyn DeviceMemoryProvider>,
    pub(crate) fw: Arc<dyn FirmwareChannel>,
    pub(crate) loaders: Loaders,
    pub(crate) syncpoints: Arc<SyncpointPool>,
}

/// A user queue of a context.
pub struct Queue {
    queue: SubmissionQueue,
    syncpoint: SyncpointLease,
    _mem: OwnedMemory,
}

impl Queue {
    pub fn queue_id(&self) -> u8 {
        self.queue.queue_id()
    }

    pub fn syncpoint_id(&self) -> u32 {
        self.syncpoint.id()
    }

    pub fn capacity(&self) -> u32 {
        self.queue.capacity()
    }

    pub fn submission_queue(&self) -> &SubmissionQueue {
        &self.queue
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("ccq_id", &self.queue.ccq_id())
            .field("queue_id", &self.queue.queue_id())
            .field("syncpoint", &self.syncpoint)
            .finish()
    }
}

enum QueueSlot {
    /// The ID is taken while firmware is told about a create or destroy.
    Reserved,
    Live(Arc<Queue>),
}

pub struct ContextResources {
    ccq_id: u8,
    env: ContextEnv,
    queues: Mutex<BlockAllocator<QueueSlot>>,
    status_lock: Mutex<()>,
    submitter: Submitter,
    _syncpoint: SyncpointLease,
    resource_table: ResourceTable,
    _priv_queue_mem: OwnedMemory,
    status_mem: OwnedMemory,
    status_capacity: u32,
}

impl ContextResources {
    /// Acquires everything a context owns. Any failure drops what was already acquired.
    pub(crate) fn create(
        env: &ContextEnv,
        ccq_id: u8,
        params: &ContextInitParams,
    ) -> Result<Self> {
        params.validate()?;
        let smmu = ccq_id;

        let status_capacity = env.config.status_ring_capacity;
        let status_bytes = StatusRingHeader::ring_bytes(status_capacity) as u64;
        let status_mem = OwnedMemory::allocate(&env.provider, status_bytes, smmu)?;
        status_mem.write_u32(StatusRingHeader::CAPACITY_OFFSET as u64, status_capacity)?;

        let resource_table = ResourceTable::new(
            ResourceTableConfig {
                resource_table_id: ccq_id,
                smmu_context_id: smmu,
                n_entries: params.n_resource_entries,
                sema_timeout: env.config.resource_sema_timeout,
                dma_config_size: env.config.dma_config_size,
                dma_config_pool_incr: env.config.dma_config_pool_incr,
            },
            Arc::clone(&env.provider),
            env.loaders.clone(),
        )?;

        let queue_bytes = SubmissionQueue::required_bytes(params.max_submits);
        let priv_queue_mem = OwnedMemory::allocate(&env.provider, queue_bytes, smmu)?;

        let chunk_bytes = CmdbufChunkPool::required_bytes(params.chunk_size, params.num_chunks);
        let chunk_mem = env.provider.allocate(chunk_bytes, smmu)?;
        let chunk_access = ResourceAccess::READ | ResourceAccess::WRITE;
        let chunk_resource_id =
            resource_table.add_dram_buffer_resource(chunk_mem.clone(), chunk_access)?;
        let chunk_pool = CmdbufChunkPool::new(
            chunk_mem,
            chunk_resource_id,
            params.chunk_size,
            params.num_chunks,
        )?;

        let syncpoint = env.syncpoints.lease()?;
        let queue = SubmissionQueue::new(
            ccq_id,
            PRIV_QUEUE_ID,
            (*priv_queue_mem).clone(),
            params.max_submits,
            Arc::clone(&env.fw),
        )?;
        let submitter = Submitter::new(
            queue,
            chunk_pool,
            syncpoint.id(),
            env.config.priv_execution_timeout_ms,
            Arc::clone(&env.fw),
            env.config.fw_timing,
        );
        resource_table.update_fw_resource_table()?;

        let max_queues = u32::from(env.config.max_queues_per_context);
        Ok(Self {
            ccq_id,
            env: env.clone(),
            queues: Mutex::new(BlockAllocator::new(0, max_queues)),
            status_lock: Mutex::new(()),
            submitter,
            _syncpoint: syncpoint,
            resource_table,
            _priv_queue_mem: priv_queue_mem,
            status_mem,
            status_capacity,
        })
    }

    pub fn ccq_id(&self) -> u8 {
        self.ccq_id
    }

    pub fn resource_table(&self) -> &ResourceTable {
        &self.resource_table
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub fn status_memory(&self) -> &DeviceMemory {
        &self.status_mem
    }

    pub fn priv_queue_memory(&self) -> &DeviceMemory {
        self.submitter.queue().memory()
    }

    pub fn num_queues(&self) -> u32 {
        lock(&self.queues).num_allocated()
    }

    pub(crate) fn init_status_buffer(&self) -> Result<()> {
        let size = u32::try_from(self.status_mem.size())
            .map_err(|_| KmdError::BadParameter("status buffer larger than 4 GiB"))?;
        let mut cmds = PvaCmdWriter::new();
        cmds.init_shared_dram_buffer(STATUS_INTERFACE, self.status_mem.iova(), size);
        self.submitter.submit_cmd_sync(cmds.as_bytes())
    }

    pub(crate) fn deinit_status_buffer(&self) -> Result<()> {
        let mut cmds = PvaCmdWriter::new();
        cmds.deinit_shared_dram_buffer(STATUS_INTERFACE);
        self.submitter.submit_cmd_sync(cmds.as_bytes())
    }

    /// Drains the records firmware appended since the last poll.
    pub fn poll_status(&self) -> Result<Vec<StatusRecord>> {
        let _guard = lock(&self.status_lock);
        let mem = &self.status_mem;
        let write_idx = mem.read_u32(StatusRingHeader::WRITE_IDX_OFFSET as u64)?;
        let mut read_idx = mem.read_u32(StatusRingHeader::READ_IDX_OFFSET as u64)?;
        let header = StatusRingHeader {
            write_idx,
            read_idx,
            capacity: self.status_capacity,
        };
        if write_idx.wrapping_sub(read_idx) > self.status_capacity {
            warn!(ccq_id = self.ccq_id, write_idx, read_idx, "status ring overrun");
            read_idx = write_idx.wrapping_sub(self.status_capacity);
        }

        let mut records = Vec::new();
        while read_idx != write_idx {
            let slot = header.record_offset(read_idx) as u64;
            let raw = mem.read_vec(slot, StatusRecord::SIZE_BYTES)?;
            match StatusRecord::decode_le(&raw) {
                Ok(record) => records.push(record),
                Err(err) => warn!(%err, ccq_id = self.ccq_id, read_idx, "bad status record"),
            }
            read_idx = read_idx.wrapping_add(1);
        }
        mem.write_u32(StatusRingHeader::READ_IDX_OFFSET as u64, read_idx)?;
        Ok(records)
    }

    pub fn queue(&self, queue_id: u8) -> Option<Arc<Queue>> {
        match lock(&self.queues).get(u32::from(queue_id)) {
            Some(QueueSlot::Live(queue)) => Some(Arc::clone(queue)),
            _ => None,
        }
    }

    /// Reserves a queue ID and builds the host side of a queue. Firmware is not told yet.
    pub(crate) fn build_queue(&self, max_submits: u32) -> Result<Arc<Queue>> {
        if max_submits < 2 {
            return Err(KmdError::Inval("queue capacity must be at least 2"));
        }
        let queue_id = lock(&self.queues).alloc(QueueSlot::Reserved)?;
        let built = self.build_queue_at(queue_id, max_submits);
        if built.is_err() {
            self.discard_queue(queue_id);
        }
        built
    }

    fn build_queue_at(&self, queue_id: u32, max_submits: u32) -> Result<Arc<Queue>> {
        let queue_id =
            u8::try_from(queue_id).map_err(|_| KmdError::Internal("queue id out of range"))?;
        let bytes = SubmissionQueue::required_bytes(max_submits);
        let mem = OwnedMemory::allocate(&self.env.provider, bytes, self.ccq_id)?;
        let syncpoint = self.env.syncpoints.lease()?;
        let queue = SubmissionQueue::new(
            self.ccq_id,
            queue_id,
            (*mem).clone(),
            max_submits,
            Arc::clone(&self.env.fw),
        )?;
        Ok(Arc::new(Queue {
            queue,
            syncpoint,
            _mem: mem,
        }))
    }

    pub(crate) fn init_queue_cmd(&self, cmds: &mut PvaCmdWriter, queue: &Queue) {
        cmds.init_queue(
            self.ccq_id,
            queue.queue_id(),
            queue.queue.memory().iova(),
            queue.capacity(),
            queue.syncpoint_id(),
        );
    }

    /// Makes a reserved queue visible to [`ContextResources::queue`].
    pub(crate) fn publish_queue(&self, queue: Arc<Queue>) {
        let id = u32::from(queue.queue_id());
        match lock(&self.queues).get_mut(id) {
            Some(slot) => *slot = QueueSlot::Live(queue),
            None => debug_assert!(false, "published queue {id} was not reserved"),
        }
    }

    /// Frees a queue ID. A live queue in the slot is released after the lock is dropped.
    pub(crate) fn discard_queue(&self, queue_id: u32) {
        let slot = lock(&self.queues).free(queue_id);
        drop(slot);
    }

    /// Pulls a live queue out of its slot, leaving the ID reserved.
    pub(crate) fn take_queue(&self, queue_id: u8) -> Result<Arc<Queue>> {
        let mut queues = lock(&self.queues);
        let slot = match queues.get_mut(u32::from(queue_id)) {
            Some(slot) if matches!(slot, QueueSlot::Live(_)) => slot,
            _ => return Err(KmdError::Inval("unknown queue id")),
        };
        match std::mem::replace(slot, QueueSlot::Reserved) {
            QueueSlot::Live(queue) => Ok(queue),
            QueueSlot::Reserved => Err(KmdError::Internal("queue slot changed under lock")),
        }
    }

    pub fn queue_create(&self, max_submits: u32) -> Result<u8> {
        let queue = self.build_queue(max_submits)?;
        let mut cmds = PvaCmdWriter::new();
        self.init_queue_cmd(&mut cmds, &queue);
        let queue_id = queue.queue_id();
        let value = match self.submitter.submit_cmds(cmds.as_bytes()) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, ccq_id = self.ccq_id, queue_id, "queue init not submitted");
                drop(queue);
                self.discard_queue(u32::from(queue_id));
                return Err(err);
            }
        };
        if let Err(err) = self.submitter.wait(value) {
            // Firmware may still adopt the queue, so its memory stays until it is destroyed.
            warn!(%err, ccq_id = self.ccq_id, queue_id, "queue init not acknowledged");
            self.publish_queue(queue);
            return Err(err);
        }
        self.publish_queue(queue);
        debug!(ccq_id = self.ccq_id, queue_id, max_submits, "queue created");
        Ok(queue_id)
    }

    /// Sends `DEINIT_QUEUE` and frees the queue. A queue firmware did not acknowledge stays in
    /// its slot so it outlives any firmware access.
    pub fn queue_destroy(&self, queue_id: u8) -> Result<()> {
        let queue = self.take_queue(queue_id)?;
        let mut cmds = PvaCmdWriter::new();
        cmds.deinit_queue(self.ccq_id, queue_id);
        let result = self.submitter.submit_cmd_sync(cmds.as_bytes());
        match &result {
            Ok(()) => {
                drop(queue);
                self.discard_queue(u32::from(queue_id));
                debug!(ccq_id = self.ccq_id, queue_id, "queue destroyed");
            }
            Err(err) => {
                warn!(%err, ccq_id = self.ccq_id, queue_id, "queue deinit failed; keeping memory");
                self.publish_queue(queue);
            }
        }
        result
    }

    /// Tears down every user queue. Returns the first failure.
    pub(crate) fn destroy_queues(&self) -> Option<KmdError> {
        let ids = lock(&self.queues).ids();
        let mut first_err = None;
        for id in ids {
            let Ok(queue_id) = u8::try_from(id) else {
                continue;
            };
            if let Err(err) = self.queue_destroy(queue_id) {
                first_err.get_or_insert(err);
            }
        }
        first_err
    }

    /// Tells firmware about a resource that was just added.
    ///
    /// The resource is dropped if the update never reached firmware. If it was submitted but
    /// not acknowledged, firmware may still install the entry, so the resource stays in the
    /// table until the context is torn down.
    fn publish_resource(&self, id: u32) -> Result<u32> {
        let submitted = self.resource_table.make_resource_entry(id).and_then(|entry| {
            let mut cmds = PvaCmdWriter::new();
            cmds.update_resource_table(self.ccq_id, id, entry);
            self.submitter.submit_cmds(cmds.as_bytes())
        });
        let value = match submitted {
            Ok(value) => value,
            Err(err) => {
                self.resource_table.drop_resource(id);
                return Err(err);
            }
        };
        match self.submitter.wait(value) {
            Ok(()) => Ok(id),
            Err(err) => {
                warn!(%err, ccq_id = self.ccq_id, id, "resource update not acknowledged");
                Err(err)
            }
        }
    }

    pub fn register_memory(&self, mem: DeviceMemory, access: ResourceAccess) -> Result<u32> {
        let id = self.resource_table.add_dram_buffer_resource(mem, access)?;
        self.publish_resource(id)
    }

    /// Claims DRAM buffer `id` for an unregister. See [`ResourceTable::begin_unregister`].
    pub(crate) fn begin_unregister(&self, id: u32) -> Result<()> {
        if id == self.submitter.chunk_pool().resource_id() {
            return Err(KmdError::Inval("resource is owned by the driver"));
        }
        self.resource_table.begin_unregister(id)
    }

    /// Sends `UNREGISTER_RESOURCE` and drops the registration reference once firmware has
    /// acknowledged it. An unacknowledged buffer stays claimed until the context is torn down.
    pub fn unregister_memory(&self, id: u32) -> Result<()> {
        self.begin_unregister(id)?;
        let mut cmds = PvaCmdWriter::new();
        cmds.unregister_resource(self.ccq_id, id);
        let value = match self.submitter.submit_cmds(cmds.as_bytes()) {
            Ok(value) => value,
            Err(err) => {
                self.resource_table.cancel_unregister(id);
                return Err(err);
            }
        };
        match self.submitter.wait(value) {
            Ok(()) => {
                self.resource_table.finish_unregister(id);
                Ok(())
            }
            Err(err) => {
                warn!(%err, ccq_id = self.ccq_id, id, "unregister not acknowledged");
                Err(err)
            }
        }
    }

    pub fn register_executable(&self, bytes: &[u8]) -> Result<u32> {
        let id = self.resource_table.add_vpu_bin_resource(bytes)?;
        self.publish_resource(id)
    }

    pub fn register_dma_config(&self, header: &DmaConfigHeader, bytes: &[u8]) -> Result<u32> {
        let id = self.resource_table.add_dma_config_resource(header, bytes)?;
        self.publish_resource(id)
    }

    pub fn exec_symbols(&self, id: u32) -> Result<Vec<SymbolInfo>> {
        self.resource_table.exec_symbols(id)
    }
}

/// Handle to one CCQ.
pub struct Context {
    ccq_id: u8,
    state: Mutex<ContextState>,
    resources: Mutex<Option<Arc<ContextResources>>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("ccq_id", &self.ccq_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(ccq_id: u8) -> Self {
        Self {
            ccq_id,
            state: Mutex::new(ContextState::Created),
            resources: Mutex::new(None),
        }
    }

    pub fn ccq_id(&self) -> u8 {
        self.ccq_id
    }

    pub fn state(&self) -> ContextState {
        *lock(&self.state)
    }

    /// Moves `from -> to`, failing if the context is in any other state.
    pub(crate) fn transition(&self, from: ContextState, to: ContextState) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(KmdError::Inval("context in wrong state"));
        }
        *state = to;
        Ok(())
    }

    pub(crate) fn set_state(&self, to: ContextState) {
        *lock(&self.state) = to;
    }

    pub(crate) fn install(&self, resources: ContextResources) {
        *lock(&self.resources) = Some(Arc::new(resources));
        info!(ccq_id = self.ccq_id, "context initialized");
    }

    pub(crate) fn take_resources(&self) -> Option<Arc<ContextResources>> {
        lock(&self.resources).take()
    }

    /// The live resources of an initialized context.
    pub fn resources(&self) -> Result<Arc<ContextResources>> {
        lock(&self.resources)
            .clone()
            .ok_or(KmdError::Inval("context is not initialized"))
    }

    pub fn register_memory(&self, mem: DeviceMemory, access: ResourceAccess) -> Result<u32> {
        self.resources()?.register_memory(mem, access)
    }

    pub fn unregister_memory(&self, id: u32) -> Result<()> {
        self.resources()?.unregister_memory(id)
    }

    pub fn register_executable(&self, bytes: &[u8]) -> Result<u32> {
        self.resources()?.register_executable(bytes)
    }

    pub fn register_dma_config(&self, header: &DmaConfigHeader, bytes: &[u8]) -> Result<u32> {
        self.resources()?.register_dma_config(header, bytes)
    }

    pub fn exec_symbols(&self, id: u32) -> Result<Vec<SymbolInfo>> {
        self.resources()?.exec_symbols(id)
    }

    pub fn queue_create(&self, max_submits: u32) -> Result<u8> {
        self.resources()?.queue_create(max_submits)
    }

    pub fn queue_destroy(&self, queue_id: u8) -> Result<()> {
        self.resources()?.queue_destroy(queue_id)
    }

    pub fn queue(&self, queue_id: u8) -> Option<Arc<Queue>> {
        self.resources().ok()?.queue(queue_id)
    }

    pub fn poll_status(&self) -> Result<Vec<StatusRecord>> {
        self.resources()?.poll_status()
    }
}
