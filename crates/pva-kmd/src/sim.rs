//! In-process firmware model.
//!
//! [`SimFirmware`] consumes submission queues out of [`SystemMemoryProvider`] memory the way the
//! real firmware would: it reads `SubmitInfo` records between head and tail, follows the
//! command-buffer chain through the submitting CCQ's resource table, executes privileged
//! commands against its own bookkeeping, signals post-fences and finally advances the head.
//! Command failures are appended to the CCQ's status ring.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pva_protocol::{
    Cmd, CmdStream, FenceKind, LinkChunk, ResourceAccess, ResourceEntry, StatusKind,
    StatusRecord, StatusRingHeader, SubmitInfo, SubmitQueueHeader, PRIV_QUEUE_ID,
    RESOURCE_ID_INVALID, STATUS_INTERFACE,
};
use tracing::{debug, trace, warn};

use crate::devmem::{DeviceMemory, SystemMemoryProvider};
use crate::error::{KmdError, Result};
use crate::fw::{BootParams, FirmwareChannel};
use crate::sync::lock;

/// Error codes carried in [`StatusRecord::code`] by the model.
pub mod codes {
    pub const MALFORMED_COMMAND: u32 = 1;
    pub const NOT_PERMITTED: u32 = 2;
    pub const ALREADY_EXISTS: u32 = 3;
    pub const NOT_FOUND: u32 = 4;
    pub const BAD_RESOURCE: u32 = 5;
}

const MAX_CHAIN_CHUNKS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Queues are consumed inside `ring_doorbell`.
    Immediate,
    /// Doorbells are queued until [`SimFirmware::process`].
    Deferred,
}

/// One executed command and the queue it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedCmd {
    pub ccq_id: u8,
    pub queue_id: u8,
    pub cmd: Cmd,
}

#[derive(Debug, Clone, Copy)]
struct TableView {
    iova: u64,
    max_n_entries: u32,
}

#[derive(Debug, Clone, Copy)]
struct QueueView {
    iova: u64,
    max_n_submits: u32,
}

#[derive(Debug, Clone, Copy)]
struct SharedBuffer {
    iova: u64,
    size: u32,
}

#[derive(Default)]
struct SimState {
    booted: bool,
    suspended: bool,
    trace_level: u32,
    tables: HashMap<u8, TableView>,
    queues: HashMap<(u8, u8), QueueView>,
    status_buffers: HashMap<u8, SharedBuffer>,
    pending: BTreeSet<(u8, u8)>,
    log: Vec<LoggedCmd>,
    dropped_status: u64,
}

pub struct SimFirmware {
    provider: Arc<SystemMemoryProvider>,
    mode: SimMode,
    responsive: AtomicBool,
    state: Mutex<SimState>,
    syncpoints: Mutex<HashMap<u32, u32>>,
}

impl SimFirmware {
    pub fn new(provider: Arc<SystemMemoryProvider>) -> Self {
        Self::with_mode(provider, SimMode::Immediate)
    }

    pub fn with_mode(provider: Arc<SystemMemoryProvider>, mode: SimMode) -> Self {
        Self {
            provider,
            mode,
            responsive: AtomicBool::new(true),
            state: Mutex::new(SimState::default()),
            syncpoints: Mutex::new(HashMap::new()),
        }
    }

    /// An unresponsive firmware still latches doorbells but consumes nothing.
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
        if responsive && self.mode == SimMode::Immediate {
            self.process();
        }
    }

    /// Consumes every queue whose doorbell rang since the last call.
    pub fn process(&self) -> usize {
        if !self.responsive.load(Ordering::SeqCst) {
            return 0;
        }
        let mut state = lock(&self.state);
        let pending = std::mem::take(&mut state.pending);
        pending
            .into_iter()
            .map(|(ccq, q)| self.consume_queue(&mut state, ccq, q))
            .sum()
    }

    pub fn is_booted(&self) -> bool {
        lock(&self.state).booted
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.state).suspended
    }

    pub fn trace_level(&self) -> u32 {
        lock(&self.state).trace_level
    }

    pub fn has_table(&self, resource_table_id: u8) -> bool {
        lock(&self.state).tables.contains_key(&resource_table_id)
    }

    pub fn has_queue(&self, ccq_id: u8, queue_id: u8) -> bool {
        lock(&self.state).queues.contains_key(&(ccq_id, queue_id))
    }

    pub fn has_status_buffer(&self, ccq_id: u8) -> bool {
        lock(&self.state).status_buffers.contains_key(&ccq_id)
    }

    pub fn commands(&self) -> Vec<LoggedCmd> {
        lock(&self.state).log.clone()
    }

    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    /// Status records that did not fit in a full ring.
    pub fn dropped_status(&self) -> u64 {
        lock(&self.state).dropped_status
    }

    /// The entry firmware currently sees for `resource_id`.
    pub fn fw_entry(&self, resource_table_id: u8, resource_id: u32) -> Option<ResourceEntry> {
        let state = lock(&self.state);
        self.table_entry(&state, resource_table_id, resource_id)
    }

    fn table_entry(
        &self,
        state: &SimState,
        table_id: u8,
        resource_id: u32,
    ) -> Option<ResourceEntry> {
        let table = state.tables.get(&table_id)?;
        if resource_id == RESOURCE_ID_INVALID || resource_id >= table.max_n_entries {
            return None;
        }
        let len = ResourceEntry::SIZE_BYTES as u64;
        let (mem, off) = self
            .provider
            .translate(table.iova + u64::from(resource_id) * len, len)?;
        let raw = mem.read_vec(off, ResourceEntry::SIZE_BYTES).ok()?;
        ResourceEntry::decode_le(&raw).ok().filter(ResourceEntry::is_valid)
    }

    fn write_table_entry(
        &self,
        state: &SimState,
        table_id: u8,
        resource_id: u32,
        entry: &ResourceEntry,
    ) -> core::result::Result<(), u32> {
        let table = state.tables.get(&table_id).ok_or(codes::NOT_FOUND)?;
        if resource_id == RESOURCE_ID_INVALID || resource_id >= table.max_n_entries {
            return Err(codes::BAD_RESOURCE);
        }
        let len = ResourceEntry::SIZE_BYTES as u64;
        let (mem, off) = self
            .provider
            .translate(table.iova + u64::from(resource_id) * len, len)
            .ok_or(codes::BAD_RESOURCE)?;
        mem.write_from(off, &entry.to_le_bytes())
            .map_err(|_| codes::BAD_RESOURCE)
    }

    /// Memory behind `[offset, offset + len)` of a resource of `ccq_id`.
    fn resolve(
        &self,
        state: &SimState,
        ccq_id: u8,
        resource_id: u32,
        offset: u64,
        len: u64,
        access: ResourceAccess,
    ) -> Option<(DeviceMemory, u64)> {
        let entry = self.table_entry(state, ccq_id, resource_id)?;
        if !entry.access.contains(access) || offset.checked_add(len)? > entry.size {
            return None;
        }
        self.provider.translate(entry.addr + offset, len)
    }

    fn consume_queue(&self, state: &mut SimState, ccq_id: u8, queue_id: u8) -> usize {
        let Some(view) = state.queues.get(&(ccq_id, queue_id)).copied() else {
            warn!(ccq_id, queue_id, "doorbell for unknown queue");
            return 0;
        };
        let bytes = SubmitQueueHeader::SIZE_BYTES as u64
            + u64::from(view.max_n_submits) * SubmitInfo::SIZE_BYTES as u64;
        let Some((mem, base)) = self.provider.translate(view.iova, bytes) else {
            warn!(ccq_id, queue_id, "queue memory is not mapped");
            return 0;
        };
        let head_off = base + SubmitQueueHeader::CB_HEAD_OFFSET as u64;
        let tail_off = base + SubmitQueueHeader::CB_TAIL_OFFSET as u64;
        let (Ok(mut head), Ok(tail)) = (mem.read_u32(head_off), mem.read_u32(tail_off)) else {
            return 0;
        };

        let mut consumed = 0;
        while head != tail && head < view.max_n_submits {
            let off = base
                + SubmitQueueHeader::SIZE_BYTES as u64
                + u64::from(head) * SubmitInfo::SIZE_BYTES as u64;
            let info = mem
                .read_vec(off, SubmitInfo::SIZE_BYTES)
                .map_err(KmdError::from)
                .and_then(|raw| SubmitInfo::decode_le(&raw).map_err(KmdError::from));
            match info {
                Ok(info) => self.execute_submission(state, ccq_id, queue_id, &info),
                Err(err) => warn!(%err, ccq_id, queue_id, "unreadable submit record"),
            }
            head = (head + 1) % view.max_n_submits;
            // Head moves only after every fence of the record was signalled.
            if mem.write_u32(head_off, head).is_err() {
                break;
            }
            consumed += 1;
        }
        consumed
    }

    fn execute_submission(
        &self,
        state: &mut SimState,
        ccq_id: u8,
        queue_id: u8,
        info: &SubmitInfo,
    ) {
        trace!(ccq_id, queue_id, submit_id = info.submit_id, "executing submission");
        if let Err(code) = self.run_chain(state, ccq_id, queue_id, info) {
            self.report(state, ccq_id, queue_id, StatusKind::CmdError, code, info.submit_id);
        }
        for fence in &info.postfences {
            match fence.kind {
                FenceKind::Syncpoint => self.syncpoint_write(fence.id, fence.value),
                FenceKind::Semaphore => {
                    let target = self.resolve(
                        state,
                        ccq_id,
                        fence.id,
                        fence.offset,
                        4,
                        ResourceAccess::WRITE,
                    );
                    let signalled = target
                        .map(|(mem, off)| mem.write_u32(off, fence.value).is_ok())
                        .unwrap_or(false);
                    if !signalled {
                        self.report(
                            state,
                            ccq_id,
                            queue_id,
                            StatusKind::InvalidFence,
                            fence.id,
                            info.submit_id,
                        );
                    }
                }
            }
        }
    }

    fn run_chain(
        &self,
        state: &mut SimState,
        ccq_id: u8,
        queue_id: u8,
        info: &SubmitInfo,
    ) -> core::result::Result<(), u32> {
        let mut resource_id = info.first_chunk_resource_id;
        let mut offset = info.first_chunk_offset;
        let mut size = info.first_chunk_size;
        for _ in 0..MAX_CHAIN_CHUNKS {
            if (size as usize) < LinkChunk::SIZE_BYTES {
                return Err(codes::MALFORMED_COMMAND);
            }
            let len = u64::from(size);
            let (mem, off) = self
                .resolve(state, ccq_id, resource_id, offset, len, ResourceAccess::READ)
                .ok_or(codes::BAD_RESOURCE)?;
            let chunk = mem
                .read_vec(off, size as usize)
                .map_err(|_| codes::BAD_RESOURCE)?;
            let link = LinkChunk::decode_le(&chunk).map_err(|_| codes::MALFORMED_COMMAND)?;
            for cmd in CmdStream::new(&chunk[LinkChunk::SIZE_BYTES..]) {
                let cmd = cmd.map_err(|_| codes::MALFORMED_COMMAND)?;
                self.execute_cmd(state, ccq_id, queue_id, cmd)?;
            }
            if link.next_chunk_resource_id == RESOURCE_ID_INVALID {
                return Ok(());
            }
            resource_id = link.next_chunk_resource_id;
            offset = link.next_chunk_offset;
            size = link.next_chunk_size;
        }
        Err(codes::MALFORMED_COMMAND)
    }

    fn execute_cmd(
        &self,
        state: &mut SimState,
        ccq_id: u8,
        queue_id: u8,
        cmd: Cmd,
    ) -> core::result::Result<(), u32> {
        if cmd.opcode().is_privileged() && queue_id != PRIV_QUEUE_ID {
            return Err(codes::NOT_PERMITTED);
        }
        // Client CCQs may only manage their own table and queues.
        let owns = |target: u8| ccq_id == 0 || target == ccq_id;
        match cmd {
            Cmd::Noop => {}
            Cmd::LinkChunk(_) => return Err(codes::MALFORMED_COMMAND),
            Cmd::InitResourceTable(c) => {
                if !owns(c.resource_table_id) {
                    return Err(codes::NOT_PERMITTED);
                }
                if state.tables.contains_key(&c.resource_table_id) {
                    return Err(codes::ALREADY_EXISTS);
                }
                state.tables.insert(
                    c.resource_table_id,
                    TableView {
                        iova: c.iova,
                        max_n_entries: c.max_n_entries,
                    },
                );
            }
            Cmd::DeinitResourceTable { resource_table_id } => {
                if !owns(resource_table_id) {
                    return Err(codes::NOT_PERMITTED);
                }
                state
                    .tables
                    .remove(&resource_table_id)
                    .ok_or(codes::NOT_FOUND)?;
            }
            Cmd::UpdateResourceTable(c) => {
                if !owns(c.resource_table_id) {
                    return Err(codes::NOT_PERMITTED);
                }
                self.write_table_entry(state, c.resource_table_id, c.resource_id, &c.entry)?;
            }
            Cmd::UnregisterResource(c) => {
                if !owns(c.resource_table_id) {
                    return Err(codes::NOT_PERMITTED);
                }
                self.write_table_entry(
                    state,
                    c.resource_table_id,
                    c.resource_id,
                    &ResourceEntry::INVALID,
                )?;
            }
            Cmd::InitQueue(c) => {
                if !owns(c.ccq_id) {
                    return Err(codes::NOT_PERMITTED);
                }
                if c.max_n_submits < 2 {
                    return Err(codes::MALFORMED_COMMAND);
                }
                if state.queues.contains_key(&(c.ccq_id, c.queue_id)) {
                    return Err(codes::ALREADY_EXISTS);
                }
                state.queues.insert(
                    (c.ccq_id, c.queue_id),
                    QueueView {
                        iova: c.iova,
                        max_n_submits: c.max_n_submits,
                    },
                );
            }
            Cmd::DeinitQueue { ccq_id: target, queue_id: q } => {
                if !owns(target) {
                    return Err(codes::NOT_PERMITTED);
                }
                state.queues.remove(&(target, q)).ok_or(codes::NOT_FOUND)?;
                state.pending.remove(&(target, q));
            }
            Cmd::InitSharedDramBuffer(c) => {
                if c.interface != STATUS_INTERFACE {
                    return Err(codes::NOT_FOUND);
                }
                if state.status_buffers.contains_key(&ccq_id) {
                    return Err(codes::ALREADY_EXISTS);
                }
                if (c.size as usize) < StatusRingHeader::ring_bytes(1) {
                    return Err(codes::MALFORMED_COMMAND);
                }
                state.status_buffers.insert(
                    ccq_id,
                    SharedBuffer {
                        iova: c.iova,
                        size: c.size,
                    },
                );
            }
            Cmd::DeinitSharedDramBuffer { interface } => {
                if interface != STATUS_INTERFACE {
                    return Err(codes::NOT_FOUND);
                }
                state
                    .status_buffers
                    .remove(&ccq_id)
                    .ok_or(codes::NOT_FOUND)?;
            }
            Cmd::SuspendFw | Cmd::ResumeFw | Cmd::SetTraceLevel { .. } if ccq_id != 0 => {
                return Err(codes::NOT_PERMITTED);
            }
            Cmd::SuspendFw => state.suspended = true,
            Cmd::ResumeFw => state.suspended = false,
            Cmd::SetTraceLevel { level } => state.trace_level = level,
        }
        state.log.push(LoggedCmd {
            ccq_id,
            queue_id,
            cmd,
        });
        Ok(())
    }

    fn report(
        &self,
        state: &mut SimState,
        ccq_id: u8,
        queue_id: u8,
        kind: StatusKind,
        code: u32,
        submit_id: u64,
    ) {
        debug!(ccq_id, queue_id, ?kind, code, submit_id, "firmware reported error");
        let Some(buffer) = state.status_buffers.get(&ccq_id).copied() else {
            state.dropped_status += 1;
            return;
        };
        let Some((mem, base)) = self.provider.translate(buffer.iova, u64::from(buffer.size)) else {
            state.dropped_status += 1;
            return;
        };
        let word = |field: usize| mem.read_u32(base + field as u64).unwrap_or(0);
        let header = StatusRingHeader {
            write_idx: word(StatusRingHeader::WRITE_IDX_OFFSET),
            read_idx: word(StatusRingHeader::READ_IDX_OFFSET),
            capacity: word(StatusRingHeader::CAPACITY_OFFSET),
        };
        let fits = header.capacity > 0
            && StatusRingHeader::ring_bytes(header.capacity) <= buffer.size as usize
            && header.write_idx.wrapping_sub(header.read_idx) < header.capacity;
        if !fits {
            state.dropped_status += 1;
            return;
        }
        let record = StatusRecord {
            queue_id,
            kind,
            code,
            submit_id,
        };
        let slot = base + header.record_offset(header.write_idx) as u64;
        let published = mem.write_from(slot, &record.to_le_bytes()).is_ok()
            && mem
                .write_u32(
                    base + StatusRingHeader::WRITE_IDX_OFFSET as u64,
                    header.write_idx.wrapping_add(1),
                )
                .is_ok();
        if !published {
            state.dropped_status += 1;
        }
    }
}

impl FirmwareChannel for SimFirmware {
    fn boot(&self, params: &BootParams) -> Result<()> {
        let mut state = lock(&self.state);
        if state.booted {
            return Err(KmdError::Inval("firmware already booted"));
        }
        state.tables.insert(
            0,
            TableView {
                iova: params.resource_table_iova,
                max_n_entries: params.resource_table_entries,
            },
        );
        state.queues.insert(
            (0, PRIV_QUEUE_ID),
            QueueView {
                iova: params.priv_queue_iova,
                max_n_submits: params.priv_queue_max_submits,
            },
        );
        state.booted = true;
        debug!(?params, "simulated firmware booted");
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = lock(&self.state);
        let log = std::mem::take(&mut state.log);
        let dropped_status = state.dropped_status;
        *state = SimState {
            log,
            dropped_status,
            ..SimState::default()
        };
        debug!("simulated firmware shut down");
    }

    fn ring_doorbell(&self, ccq_id: u8, queue_id: u8) {
        let mut state = lock(&self.state);
        if !state.booted {
            warn!(ccq_id, queue_id, "doorbell before boot");
            return;
        }
        state.pending.insert((ccq_id, queue_id));
        drop(state);
        if self.mode == SimMode::Immediate {
            self.process();
        }
    }

    fn syncpoint_read(&self, syncpoint_id: u32) -> u32 {
        lock(&self.syncpoints)
            .get(&syncpoint_id)
            .copied()
            .unwrap_or(0)
    }

    fn syncpoint_write(&self, syncpoint_id: u32, value: u32) {
        lock(&self.syncpoints).insert(syncpoint_id, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_params() -> BootParams {
        BootParams {
            resource_table_iova: 0x1000,
            resource_table_entries: 4,
            priv_queue_iova: 0x2000,
            priv_queue_max_submits: 4,
            priv_syncpoint_id: 0,
        }
    }

    #[test]
    fn boot_registers_device_table_and_queue_once() {
        let fw = SimFirmware::new(Arc::new(SystemMemoryProvider::new()));
        fw.boot(&boot_params()).unwrap();
        assert!(fw.is_booted());
        assert!(fw.has_table(0));
        assert!(fw.has_queue(0, PRIV_QUEUE_ID));
        assert!(matches!(fw.boot(&boot_params()), Err(KmdError::Inval(_))));

        fw.shutdown();
        assert!(!fw.is_booted());
        assert!(!fw.has_table(0));
    }

    #[test]
    fn doorbells_before_boot_are_ignored() {
        let fw = SimFirmware::with_mode(Arc::new(SystemMemoryProvider::new()), SimMode::Deferred);
        fw.ring_doorbell(0, PRIV_QUEUE_ID);
        assert_eq!(fw.process(), 0);
        assert_eq!(fw.syncpoint_read(3), 0);
        fw.syncpoint_write(3, 9);
        assert_eq!(fw.syncpoint_read(3), 9);
    }

    #[test]
    fn errors_without_a_status_buffer_are_counted() {
        let fw = SimFirmware::new(Arc::new(SystemMemoryProvider::new()));
        fw.boot(&boot_params()).unwrap();
        {
            let mut state = lock(&fw.state);
            fw.report(&mut state, 3, 0, StatusKind::CmdError, codes::NOT_FOUND, 1);
        }
        assert_eq!(fw.dropped_status(), 1);
    }
}
