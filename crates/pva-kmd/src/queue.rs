//! Submission ring shared with firmware.
//!
//! Layout: a [`SubmitQueueHeader`] followed by `capacity` [`SubmitInfo`] records. The host owns
//! `cb_tail`, firmware owns `cb_head`. One slot always stays empty so `head == tail` means the
//! ring is empty.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use pva_protocol::{SubmitInfo, SubmitQueueHeader};
use tracing::trace;

use crate::devmem::DeviceMemory;
use crate::error::{KmdError, Result};
use crate::fw::FirmwareChannel;

/// Occupied slots between `head` and `tail`.
pub fn queue_count(head: u32, tail: u32, size: u32) -> u32 {
    (tail.wrapping_add(size).wrapping_sub(head)) % size
}

/// Slots the producer may still fill.
pub fn queue_space(head: u32, tail: u32, size: u32) -> u32 {
    size - queue_count(head, tail, size) - 1
}

pub struct SubmissionQueue {
    ccq_id: u8,
    queue_id: u8,
    mem: DeviceMemory,
    capacity: u32,
    fw: Arc<dyn FirmwareChannel>,
}

impl SubmissionQueue {
    pub fn required_bytes(capacity: u32) -> u64 {
        SubmitQueueHeader::SIZE_BYTES as u64 + u64::from(capacity) * SubmitInfo::SIZE_BYTES as u64
    }

    pub fn new(
        ccq_id: u8,
        queue_id: u8,
        mem: DeviceMemory,
        capacity: u32,
        fw: Arc<dyn FirmwareChannel>,
    ) -> Result<Self> {
        if capacity < 2 {
            return Err(KmdError::Inval("queue capacity must be at least 2"));
        }
        if mem.size() < Self::required_bytes(capacity) {
            return Err(KmdError::Inval("queue memory too small"));
        }
        mem.zero(0, SubmitQueueHeader::SIZE_BYTES as u64)?;
        Ok(Self {
            ccq_id,
            queue_id,
            mem,
            capacity,
            fw,
        })
    }

    pub fn ccq_id(&self) -> u8 {
        self.ccq_id
    }

    pub fn queue_id(&self) -> u8 {
        self.queue_id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.mem
    }

    // Header words are in bounds: `new` checked the size.
    fn header_word(&self, offset: usize) -> u32 {
        self.mem.read_u32(offset as u64).unwrap_or_default() % self.capacity
    }

    pub fn head(&self) -> u32 {
        self.header_word(SubmitQueueHeader::CB_HEAD_OFFSET)
    }

    pub fn tail(&self) -> u32 {
        self.header_word(SubmitQueueHeader::CB_TAIL_OFFSET)
    }

    pub fn count(&self) -> u32 {
        queue_count(self.head(), self.tail(), self.capacity)
    }

    pub fn space(&self) -> u32 {
        queue_space(self.head(), self.tail(), self.capacity)
    }

    /// Appends `info` and rings the doorbell. Never blocks.
    ///
    /// Callers serialize submissions to one queue.
    pub fn submit(&self, info: &SubmitInfo) -> Result<()> {
        let head = self.head();
        let tail = self.tail();
        if queue_space(head, tail, self.capacity) == 0 {
            return Err(KmdError::QueueFull);
        }
        let record = info.encode_le()?;
        let offset =
            SubmitQueueHeader::SIZE_BYTES as u64 + u64::from(tail) * SubmitInfo::SIZE_BYTES as u64;
        self.mem.write_from(offset, &record)?;

        let next = (tail + 1) % self.capacity;
        self.mem
            .write_u32(SubmitQueueHeader::CB_TAIL_OFFSET as u64, next)?;
        fence(Ordering::SeqCst);
        trace!(
            ccq_id = self.ccq_id,
            queue_id = self.queue_id,
            submit_id = info.submit_id,
            tail = next,
            "submitted"
        );
        self.fw.ring_doorbell(self.ccq_id, self.queue_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fw::BootParams;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingDoorbell {
        rings: AtomicU32,
    }

    impl FirmwareChannel for CountingDoorbell {
        fn boot(&self, _: &BootParams) -> Result<()> {
            Ok(())
        }

        fn shutdown(&self) {}

        fn ring_doorbell(&self, _: u8, _: u8) {
            self.rings.fetch_add(1, Ordering::Relaxed);
        }

        fn syncpoint_read(&self, _: u32) -> u32 {
            0
        }

        fn syncpoint_write(&self, _: u32, _: u32) {}
    }

    fn queue(capacity: u32) -> (Arc<CountingDoorbell>, SubmissionQueue) {
        let fw = Arc::new(CountingDoorbell::default());
        let mem = DeviceMemory::new(0x8000, SubmissionQueue::required_bytes(capacity), 0);
        let queue = SubmissionQueue::new(1, 0, mem, capacity, fw.clone()).unwrap();
        (fw, queue)
    }

    #[test]
    fn full_queue_rejects_until_head_moves() {
        let (fw, queue) = queue(8);
        for id in 0..7 {
            let info = SubmitInfo {
                submit_id: id,
                ..Default::default()
            };
            queue.submit(&info).unwrap();
        }
        assert_eq!(queue.space(), 0);
        assert_eq!(
            queue.submit(&SubmitInfo::default()),
            Err(KmdError::QueueFull)
        );
        assert_eq!(fw.rings.load(Ordering::Relaxed), 7);

        // Firmware consumed one record.
        queue
            .memory()
            .write_u32(SubmitQueueHeader::CB_HEAD_OFFSET as u64, 1)
            .unwrap();
        assert_eq!(queue.tail(), 7);
        queue.submit(&SubmitInfo::default()).unwrap();
        assert_eq!(queue.tail(), 0);
        assert_eq!(queue.count(), 7);
    }

    #[test]
    fn records_land_at_the_tail_slot() {
        let (_fw, queue) = queue(4);
        let info = SubmitInfo {
            submit_id: 0xAB,
            first_chunk_size: 36,
            ..Default::default()
        };
        queue.submit(&info).unwrap();
        let raw = queue
            .memory()
            .read_vec(SubmitQueueHeader::SIZE_BYTES as u64, SubmitInfo::SIZE_BYTES)
            .unwrap();
        assert_eq!(SubmitInfo::decode_le(&raw).unwrap(), info);
    }

    #[test]
    fn tiny_queue_is_rejected() {
        let fw: Arc<dyn FirmwareChannel> = Arc::new(CountingDoorbell::default());
        let mem = DeviceMemory::new(0, 4096, 0);
        assert!(SubmissionQueue::new(0, 0, mem.clone(), 1, fw.clone()).is_err());
        let small = DeviceMemory::new(0, 8, 0);
        assert!(SubmissionQueue::new(0, 0, small, 2, fw).is_err());
    }

    proptest! {
        #[test]
        fn space_plus_count_is_size_minus_one(
            (size, head, tail) in (2u32..512).prop_flat_map(|s| (Just(s), 0..s, 0..s)),
        ) {
            let total = queue_space(head, tail, size) + queue_count(head, tail, size);
            prop_assert_eq!(total, size - 1);
            prop_assert!(queue_count(head, tail, size) < size);
        }
    }
}
