//! Batched context operations.
//!
//! A batch applies each request to host state in order and collects the resulting firmware
//! commands into one command stream, which then goes out as a single submission. Per-op
//! failures are reported in that op's response and leave no trace. If the submission never
//! reaches the queue, every host-side change the batch made is undone and the error is returned.
//! A submission that was queued but timed out keeps those changes, since firmware may still run it.

use std::sync::Arc;

use pva_protocol::{Fence, PvaCmdWriter, RawCmds, ResourceAccess};
use tracing::{debug, warn};

use crate::context::{Context, ContextResources, Queue};
use crate::devmem::DeviceMemory;
use crate::error::{KmdError, Result};
use crate::loader::{DmaConfigHeader, SymbolInfo};
use crate::submitter::Submitter;

#[derive(Debug)]
pub enum OpRequest {
    RegisterMemory {
        mem: DeviceMemory,
        access: ResourceAccess,
    },
    UnregisterMemory {
        resource_id: u32,
    },
    RegisterExecutable {
        bytes: Vec<u8>,
    },
    RegisterDmaConfig {
        header: DmaConfigHeader,
        bytes: Vec<u8>,
    },
    QueueCreate {
        max_submits: u32,
    },
    QueueDestroy {
        queue_id: u8,
    },
    ExecutableSymbols {
        resource_id: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpPayload {
    #[default]
    None,
    ResourceId(u32),
    QueueId(u8),
    Symbols(Vec<SymbolInfo>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResponse {
    pub error: Option<KmdError>,
    pub payload: OpPayload,
}

impl OpResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl From<Result<OpPayload>> for OpResponse {
    fn from(result: Result<OpPayload>) -> Self {
        match result {
            Ok(payload) => Self {
                error: None,
                payload,
            },
            Err(err) => Self {
                error: Some(err),
                payload: OpPayload::None,
            },
        }
    }
}

/// Host-side effect of an applied op, settled once the submission outcome is known.
enum Pending {
    AddedResource(u32),
    RemovedResource(u32),
    CreatedQueue(Arc<Queue>),
    DestroyedQueue(Arc<Queue>),
}

struct Batch<'a> {
    res: &'a ContextResources,
    allow_queue_ops: bool,
    cmds: PvaCmdWriter,
    pending: Vec<Pending>,
}

impl<'a> Batch<'a> {
    fn new(res: &'a ContextResources, allow_queue_ops: bool) -> Self {
        Self {
            res,
            allow_queue_ops,
            cmds: PvaCmdWriter::new(),
            pending: Vec::new(),
        }
    }

    fn apply(&mut self, op: OpRequest) -> Result<OpPayload> {
        let res = self.res;
        let table = res.resource_table();
        let ccq_id = res.ccq_id();
        match op {
            OpRequest::RegisterMemory { mem, access } => {
                let id = table.add_dram_buffer_resource(mem, access)?;
                self.added(id)
            }
            OpRequest::RegisterExecutable { bytes } => {
                let id = table.add_vpu_bin_resource(&bytes)?;
                self.added(id)
            }
            OpRequest::RegisterDmaConfig { header, bytes } => {
                let id = table.add_dma_config_resource(&header, &bytes)?;
                self.added(id)
            }
            OpRequest::UnregisterMemory { resource_id } => {
                self.res.begin_unregister(resource_id)?;
                self.cmds.unregister_resource(ccq_id, resource_id);
                self.pending.push(Pending::RemovedResource(resource_id));
                Ok(OpPayload::None)
            }
            OpRequest::QueueCreate { max_submits } => {
                if !self.allow_queue_ops {
                    return Err(KmdError::Inval("queue ops are not allowed in async batches"));
                }
                let queue = self.res.build_queue(max_submits)?;
                self.res.init_queue_cmd(&mut self.cmds, &queue);
                let queue_id = queue.queue_id();
                self.pending.push(Pending::CreatedQueue(queue));
                Ok(OpPayload::QueueId(queue_id))
            }
            OpRequest::QueueDestroy { queue_id } => {
                if !self.allow_queue_ops {
                    return Err(KmdError::Inval("queue ops are not allowed in async batches"));
                }
                let queue = self.res.take_queue(queue_id)?;
                self.cmds.deinit_queue(ccq_id, queue_id);
                self.pending.push(Pending::DestroyedQueue(queue));
                Ok(OpPayload::None)
            }
            OpRequest::ExecutableSymbols { resource_id } => {
                table.exec_symbols(resource_id).map(OpPayload::Symbols)
            }
        }
    }

    fn added(&mut self, id: u32) -> Result<OpPayload> {
        let entry = match self.res.resource_table().make_resource_entry(id) {
            Ok(entry) => entry,
            Err(err) => {
                self.res.resource_table().drop_resource(id);
                return Err(err);
            }
        };
        self.cmds.update_resource_table(self.res.ccq_id(), id, entry);
        self.pending.push(Pending::AddedResource(id));
        Ok(OpPayload::ResourceId(id))
    }

    fn commit(self) {
        for pending in self.pending {
            match pending {
                Pending::AddedResource(_) => {}
                Pending::RemovedResource(id) => self.res.resource_table().finish_unregister(id),
                Pending::CreatedQueue(queue) => self.res.publish_queue(queue),
                Pending::DestroyedQueue(queue) => {
                    let queue_id = u32::from(queue.queue_id());
                    drop(queue);
                    self.res.discard_queue(queue_id);
                }
            }
        }
    }

    fn rollback(self) {
        for pending in self.pending.into_iter().rev() {
            match pending {
                Pending::AddedResource(id) => self.res.resource_table().drop_resource(id),
                Pending::RemovedResource(id) => self.res.resource_table().cancel_unregister(id),
                Pending::CreatedQueue(queue) => {
                    let queue_id = u32::from(queue.queue_id());
                    drop(queue);
                    self.res.discard_queue(queue_id);
                }
                Pending::DestroyedQueue(queue) => self.res.publish_queue(queue),
            }
        }
    }

    /// Settles a batch that was submitted but never acknowledged. Firmware may still be acting
    /// on it, so everything it touched stays alive: added resources keep their ids, removals
    /// keep their claim, and both created and destroyed queues go back into their slots.
    fn park(self) {
        for pending in self.pending {
            match pending {
                Pending::AddedResource(_) | Pending::RemovedResource(_) => {}
                Pending::CreatedQueue(queue) | Pending::DestroyedQueue(queue) => {
                    self.res.publish_queue(queue)
                }
            }
        }
    }
}

/// Submits `cmds` with `completion` as the caller-visible post-fence. Does not wait.
fn submit_async(submitter: &Submitter, cmds: &[u8], completion: Fence) -> Result<u64> {
    submitter.wait_queue_space(submitter.timing().timeout)?;
    let mut builder = submitter.prepare()?;
    let max = submitter.chunk_pool().max_cmd_bytes();
    for cmd in RawCmds::new(cmds) {
        let cmd = cmd?;
        if cmd.len() > max {
            return Err(KmdError::Inval("command larger than a chunk"));
        }
        builder.push_cmd(cmd)?;
    }
    submitter.submit_with_fence(builder, completion)
}

impl Context {
    /// Runs `ops` as one synchronous firmware submission.
    pub fn execute_ops(&self, ops: Vec<OpRequest>) -> Result<Vec<OpResponse>> {
        let res = self.resources()?;
        let mut batch = Batch::new(&res, true);
        let responses: Vec<OpResponse> = ops
            .into_iter()
            .map(|op| OpResponse::from(batch.apply(op)))
            .collect();

        if batch.cmds.is_empty() {
            batch.commit();
            return Ok(responses);
        }
        let submitter = res.submitter();
        let value = match submitter.submit_cmds(batch.cmds.as_bytes()) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, ccq_id = self.ccq_id(), "op batch submission failed; rolling back");
                batch.rollback();
                return Err(err);
            }
        };
        match submitter.wait(value) {
            Ok(()) => {
                debug!(ccq_id = self.ccq_id(), ops = responses.len(), "op batch completed");
                batch.commit();
                Ok(responses)
            }
            Err(err) => {
                warn!(%err, ccq_id = self.ccq_id(), "op batch not acknowledged; keeping its state");
                batch.park();
                Err(err)
            }
        }
    }

    /// Runs `ops` as one submission that signals `completion` when firmware is done with it.
    ///
    /// Queue creation and destruction need a synchronous answer from firmware and are rejected.
    pub fn execute_ops_async(
        &self,
        ops: Vec<OpRequest>,
        completion: Fence,
    ) -> Result<Vec<OpResponse>> {
        let res = self.resources()?;
        let mut batch = Batch::new(&res, false);
        let responses: Vec<OpResponse> = ops
            .into_iter()
            .map(|op| OpResponse::from(batch.apply(op)))
            .collect();

        // The completion fence is signalled even when no op produced a command.
        if batch.cmds.is_empty() {
            batch.cmds.noop();
        }
        match submit_async(res.submitter(), batch.cmds.as_bytes(), completion) {
            Ok(submit_id) => {
                debug!(ccq_id = self.ccq_id(), submit_id, "async op batch submitted");
                batch.commit();
                Ok(responses)
            }
            Err(err) => {
                warn!(%err, ccq_id = self.ccq_id(), "async op batch submission failed");
                batch.rollback();
                Err(err)
            }
        }
    }
}
