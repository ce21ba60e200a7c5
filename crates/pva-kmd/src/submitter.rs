//! Thread-safe submission over one queue and one chunk pool.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pva_protocol::{Fence, RawCmds, SubmitInfo};
use tracing::{debug, trace};

use crate::cmdbuf::{CmdbufBuilder, CmdbufChain, CmdbufChunkPool};
use crate::config::FwTiming;
use crate::error::{KmdError, Result};
use crate::fw::FirmwareChannel;
use crate::queue::SubmissionQueue;
use crate::sync::lock;

/// `true` once a free-running counter at `current` has reached `target`.
pub fn fence_reached(current: u32, target: u32) -> bool {
    current.wrapping_sub(target) as i32 >= 0
}

struct SubmitState {
    post_fence_value: u32,
    next_submit_id: u64,
}

pub struct Submitter {
    queue: SubmissionQueue,
    chunk_pool: CmdbufChunkPool,
    syncpoint_id: u32,
    execution_timeout_ms: u32,
    fw: Arc<dyn FirmwareChannel>,
    timing: FwTiming,
    state: Mutex<SubmitState>,
}

impl Submitter {
    pub fn new(
        queue: SubmissionQueue,
        chunk_pool: CmdbufChunkPool,
        syncpoint_id: u32,
        execution_timeout_ms: u32,
        fw: Arc<dyn FirmwareChannel>,
        timing: FwTiming,
    ) -> Self {
        let post_fence_value = fw.syncpoint_read(syncpoint_id);
        Self {
            queue,
            chunk_pool,
            syncpoint_id,
            execution_timeout_ms,
            fw,
            timing,
            state: Mutex::new(SubmitState {
                post_fence_value,
                next_submit_id: 0,
            }),
        }
    }

    pub fn queue(&self) -> &SubmissionQueue {
        &self.queue
    }

    pub fn chunk_pool(&self) -> &CmdbufChunkPool {
        &self.chunk_pool
    }

    pub fn syncpoint_id(&self) -> u32 {
        self.syncpoint_id
    }

    pub fn timing(&self) -> FwTiming {
        self.timing
    }

    /// The post-fence value of the most recent submission.
    pub fn post_fence_value(&self) -> u32 {
        lock(&self.state).post_fence_value
    }

    pub fn prepare(&self) -> Result<CmdbufBuilder<'_>> {
        self.chunk_pool.builder()
    }

    fn info_for(&self, chain: &CmdbufChain, submit_id: u64, completion: Fence) -> SubmitInfo {
        SubmitInfo {
            first_chunk_resource_id: chain.resource_id,
            first_chunk_offset: chain.first_chunk_offset,
            first_chunk_size: chain.first_chunk_size,
            execution_timeout_ms: self.execution_timeout_ms,
            submit_id,
            postfences: vec![
                self.chunk_pool.get_free_notifier_fence(chain.first_chunk_id),
                completion,
            ],
            ..Default::default()
        }
    }

    /// Submits the command buffer and returns the syncpoint value that marks its completion.
    pub fn submit(&self, builder: CmdbufBuilder<'_>) -> Result<u32> {
        let mut state = lock(&self.state);
        let chain = builder.finalize()?;
        let value = state.post_fence_value.wrapping_add(1);
        let info = self.info_for(
            &chain,
            state.next_submit_id,
            Fence::syncpoint(self.syncpoint_id, value),
        );
        if let Err(err) = self.queue.submit(&info) {
            drop(state);
            self.chunk_pool.free_linked_cmdbuf_chunks(chain.first_chunk_id);
            return Err(err);
        }
        state.post_fence_value = value;
        state.next_submit_id += 1;
        Ok(value)
    }

    /// Submits with a caller-provided completion fence instead of the syncpoint. Returns the
    /// submit ID.
    pub fn submit_with_fence(
        &self,
        builder: CmdbufBuilder<'_>,
        completion: Fence,
    ) -> Result<u64> {
        let mut state = lock(&self.state);
        let chain = builder.finalize()?;
        let submit_id = state.next_submit_id;
        let info = self.info_for(&chain, submit_id, completion);
        if let Err(err) = self.queue.submit(&info) {
            drop(state);
            self.chunk_pool.free_linked_cmdbuf_chunks(chain.first_chunk_id);
            return Err(err);
        }
        state.next_submit_id += 1;
        Ok(submit_id)
    }

    pub fn wait(&self, value: u32) -> Result<()> {
        self.wait_timeout(value, self.timing.timeout)
    }

    /// Polls the syncpoint until it reaches `value`. No lock is held while sleeping.
    pub fn wait_timeout(&self, value: u32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.fw.syncpoint_read(self.syncpoint_id);
            if fence_reached(current, value) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!(
                    syncpoint_id = self.syncpoint_id,
                    current, value, "timed out waiting for post-fence"
                );
                return Err(KmdError::TimedOut);
            }
            thread::sleep(self.timing.poll_interval);
        }
    }

    pub fn wait_queue_space(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.queue.space() == 0 {
            if Instant::now() >= deadline {
                return Err(KmdError::TimedOut);
            }
            thread::sleep(self.timing.poll_interval);
        }
        Ok(())
    }

    /// Writes the raw command stream into one command buffer and submits it without waiting.
    ///
    /// Returns the post-fence value. An error means nothing reached the queue; once this
    /// returns `Ok`, a failed [`Submitter::wait`] leaves the submission in flight.
    pub fn submit_cmds(&self, cmds: &[u8]) -> Result<u32> {
        self.wait_queue_space(self.timing.timeout)?;
        let mut builder = self.prepare()?;
        let max = self.chunk_pool.max_cmd_bytes();
        for cmd in RawCmds::new(cmds) {
            let cmd = cmd?;
            if cmd.len() > max {
                return Err(KmdError::Inval("command larger than a chunk"));
            }
            builder.push_cmd(cmd)?;
        }
        self.submit(builder)
    }

    /// Submits the raw command stream and waits for it.
    pub fn submit_cmd_sync(&self, cmds: &[u8]) -> Result<()> {
        if cmds.is_empty() {
            return Ok(());
        }
        let value = self.submit_cmds(cmds)?;
        trace!(value, bytes = cmds.len(), "waiting for synchronous submission");
        self.wait(value)
    }
}
