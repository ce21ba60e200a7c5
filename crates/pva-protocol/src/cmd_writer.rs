//! Safe builder for privileged command streams.

use crate::cmd::{
    Cmd, InitQueue, InitResourceTable, InitSharedDramBuffer, UnregisterResource,
    UpdateResourceTable,
};
use crate::resource::{ResourceEntry, RESOURCE_MAX_ADDR};

/// Appends encoded commands to a contiguous byte stream.
///
/// The stream has no header of its own; the host copies each command into command-buffer chunk
/// space and the firmware walks them by their header lengths.
#[derive(Debug, Default, Clone)]
pub struct PvaCmdWriter {
    buf: Vec<u8>,
    count: usize,
}

impl PvaCmdWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of commands appended so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn push(&mut self, cmd: &Cmd) -> &mut Self {
        let start = self.buf.len();
        self.buf.resize(start + cmd.size_bytes(), 0);
        cmd.write_le(&mut self.buf[start..]);
        self.count += 1;
        self
    }

    pub fn noop(&mut self) -> &mut Self {
        self.push(&Cmd::Noop)
    }

    pub fn init_resource_table(
        &mut self,
        resource_table_id: u8,
        iova: u64,
        max_n_entries: u32,
    ) -> &mut Self {
        debug_assert!(iova <= RESOURCE_MAX_ADDR);
        self.push(&Cmd::InitResourceTable(InitResourceTable {
            resource_table_id,
            iova,
            max_n_entries,
        }))
    }

    pub fn deinit_resource_table(&mut self, resource_table_id: u8) -> &mut Self {
        self.push(&Cmd::DeinitResourceTable { resource_table_id })
    }

    pub fn update_resource_table(
        &mut self,
        resource_table_id: u8,
        resource_id: u32,
        entry: ResourceEntry,
    ) -> &mut Self {
        self.push(&Cmd::UpdateResourceTable(UpdateResourceTable {
            resource_table_id,
            resource_id,
            entry,
        }))
    }

    pub fn unregister_resource(&mut self, resource_table_id: u8, resource_id: u32) -> &mut Self {
        self.push(&Cmd::UnregisterResource(UnregisterResource {
            resource_table_id,
            resource_id,
        }))
    }

    pub fn init_queue(
        &mut self,
        ccq_id: u8,
        queue_id: u8,
        iova: u64,
        max_n_submits: u32,
        syncpoint_id: u32,
    ) -> &mut Self {
        debug_assert!(iova <= RESOURCE_MAX_ADDR);
        self.push(&Cmd::InitQueue(InitQueue {
            ccq_id,
            queue_id,
            iova,
            max_n_submits,
            syncpoint_id,
        }))
    }

    pub fn deinit_queue(&mut self, ccq_id: u8, queue_id: u8) -> &mut Self {
        self.push(&Cmd::DeinitQueue { ccq_id, queue_id })
    }

    pub fn init_shared_dram_buffer(&mut self, interface: u8, iova: u64, size: u32) -> &mut Self {
        debug_assert!(iova <= RESOURCE_MAX_ADDR);
        self.push(&Cmd::InitSharedDramBuffer(InitSharedDramBuffer {
            interface,
            iova,
            size,
        }))
    }

    pub fn deinit_shared_dram_buffer(&mut self, interface: u8) -> &mut Self {
        self.push(&Cmd::DeinitSharedDramBuffer { interface })
    }

    pub fn suspend_fw(&mut self) -> &mut Self {
        self.push(&Cmd::SuspendFw)
    }

    pub fn resume_fw(&mut self) -> &mut Self {
        self.push(&Cmd::ResumeFw)
    }

    pub fn set_trace_level(&mut self, level: u32) -> &mut Self {
        self.push(&Cmd::SetTraceLevel { level })
    }
}
