//! Host side of the firmware command channel.

use crate::error::Result;

/// What the firmware needs at boot to find the device's own resource table and privileged
/// queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootParams {
    pub resource_table_iova: u64,
    pub resource_table_entries: u32,
    pub priv_queue_iova: u64,
    pub priv_queue_max_submits: u32,
    pub priv_syncpoint_id: u32,
}

/// Doorbell, boot and syncpoint access for one device.
///
/// Queue contents travel through shared device memory; this channel carries only the
/// notifications and counters that sit outside it.
pub trait FirmwareChannel: Send + Sync {
    fn boot(&self, params: &BootParams) -> Result<()>;

    fn shutdown(&self);

    /// Tells firmware that the tail of `(ccq_id, queue_id)` moved.
    fn ring_doorbell(&self, ccq_id: u8, queue_id: u8);

    fn syncpoint_read(&self, syncpoint_id: u32) -> u32;

    fn syncpoint_write(&self, syncpoint_id: u32, value: u32);
}
