//! The device: CCQ 0, firmware boot and the context lifecycle.

use std::sync::{Arc, Mutex};

use pva_protocol::{PvaCmdWriter, ResourceAccess, PRIV_QUEUE_ID};
use tracing::{debug, info, warn};

use crate::block_alloc::BlockAllocator;
use crate::cmdbuf::CmdbufChunkPool;
use crate::config::{ContextInitParams, KmdConfig};
use crate::context::{Context, ContextEnv, ContextResources, ContextState};
use crate::devmem::{DeviceMemoryProvider, OwnedMemory};
use crate::error::{KmdError, Result};
use crate::fw::{BootParams, FirmwareChannel};
use crate::loader::Loaders;
use crate::queue::SubmissionQueue;
use crate::resource_table::{ResourceTable, ResourceTableConfig};
use crate::submitter::Submitter;
use crate::sync::lock;
use crate::syncpoint::{SyncpointLease, SyncpointPool};

/// Resources of CCQ 0. Field order is the release order.
struct DevicePrivileged {
    submitter: Submitter,
    _syncpoint: SyncpointLease,
    resource_table: ResourceTable,
    _queue_mem: OwnedMemory,
}

/// A failed context init. `leftover` holds resources firmware may still reach.
struct InitFailure {
    err: KmdError,
    leftover: Option<ContextResources>,
}

impl From<KmdError> for InitFailure {
    fn from(err: KmdError) -> Self {
        Self {
            err,
            leftover: None,
        }
    }
}

/// A context whose teardown firmware did not acknowledge.
struct DeferredContext {
    ctx: Arc<Context>,
    _resources: Arc<ContextResources>,
}

pub struct Device {
    env: ContextEnv,
    /// `None` only between allocating a CCQ and building its handle.
    contexts: Mutex<BlockAllocator<Option<Arc<Context>>>>,
    deferred: Mutex<Vec<DeferredContext>>,
    privileged: Mutex<Option<Arc<DevicePrivileged>>>,
}

impl Device {
    /// Powers the device on and boots firmware.
    pub fn new(
        config: KmdConfig,
        provider: Arc<dyn DeviceMemoryProvider>,
        fw: Arc<dyn FirmwareChannel>,
        loaders: Loaders,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let syncpoints = Arc::new(SyncpointPool::new(config.num_syncpoints));

        let resource_table = ResourceTable::new(
            ResourceTableConfig {
                resource_table_id: 0,
                smmu_context_id: 0,
                n_entries: config.device_resource_entries,
                sema_timeout: config.resource_sema_timeout,
                dma_config_size: config.dma_config_size,
                dma_config_pool_incr: config.dma_config_pool_incr,
            },
            Arc::clone(&provider),
            loaders.clone(),
        )?;
        let queue_bytes = SubmissionQueue::required_bytes(config.priv_max_submits);
        let queue_mem = OwnedMemory::allocate(&provider, queue_bytes, 0)?;

        let chunk_bytes =
            CmdbufChunkPool::required_bytes(config.priv_chunk_size, config.priv_num_chunks);
        let chunk_mem = provider.allocate(chunk_bytes, 0)?;
        let chunk_access = ResourceAccess::READ | ResourceAccess::WRITE;
        let chunk_resource_id =
            resource_table.add_dram_buffer_resource(chunk_mem.clone(), chunk_access)?;
        let chunk_pool = CmdbufChunkPool::new(
            chunk_mem,
            chunk_resource_id,
            config.priv_chunk_size,
            config.priv_num_chunks,
        )?;

        let syncpoint = syncpoints.lease()?;
        let queue = SubmissionQueue::new(
            0,
            PRIV_QUEUE_ID,
            (*queue_mem).clone(),
            config.priv_max_submits,
            Arc::clone(&fw),
        )?;
        let submitter = Submitter::new(
            queue,
            chunk_pool,
            syncpoint.id(),
            config.priv_execution_timeout_ms,
            Arc::clone(&fw),
            config.fw_timing,
        );

        resource_table.update_fw_resource_table()?;
        fw.boot(&BootParams {
            resource_table_iova: resource_table.table_mem().iova(),
            resource_table_entries: resource_table.max_n_entries(),
            priv_queue_iova: queue_mem.iova(),
            priv_queue_max_submits: config.priv_max_submits,
            priv_syncpoint_id: syncpoint.id(),
        })?;
        resource_table.mark_fw_owned();
        info!(
            max_contexts = config.max_contexts,
            num_syncpoints = config.num_syncpoints,
            "device powered on"
        );

        let privileged = DevicePrivileged {
            submitter,
            _syncpoint: syncpoint,
            resource_table,
            _queue_mem: queue_mem,
        };
        let max_contexts = u32::from(config.max_contexts);
        Ok(Arc::new(Self {
            env: ContextEnv {
                config,
                provider,
                fw,
                loaders,
                syncpoints,
            },
            contexts: Mutex::new(BlockAllocator::new(1, max_contexts)),
            deferred: Mutex::new(Vec::new()),
            privileged: Mutex::new(Some(Arc::new(privileged))),
        }))
    }

    pub fn config(&self) -> &KmdConfig {
        &self.env.config
    }

    pub fn is_powered(&self) -> bool {
        lock(&self.privileged).is_some()
    }

    fn privileged(&self) -> Result<Arc<DevicePrivileged>> {
        lock(&self.privileged)
            .clone()
            .ok_or(KmdError::Inval("device is powered off"))
    }

    /// The device's own resource table.
    pub fn with_resource_table<R>(&self, f: impl FnOnce(&ResourceTable) -> R) -> Result<R> {
        Ok(f(&self.privileged()?.resource_table))
    }

    pub fn num_syncpoints_leased(&self) -> u32 {
        self.env.syncpoints.num_leased()
    }

    pub fn num_contexts(&self) -> u32 {
        lock(&self.contexts).num_allocated()
    }

    pub fn num_deferred(&self) -> usize {
        lock(&self.deferred).len()
    }

    fn submit_priv(&self, cmds: &PvaCmdWriter) -> Result<()> {
        self.privileged()?.submitter.submit_cmd_sync(cmds.as_bytes())
    }

    /// Allocates a CCQ for a new context. Nothing is given to firmware until `context_init`.
    pub fn context_create(&self) -> Result<Arc<Context>> {
        self.privileged()?;
        let mut contexts = lock(&self.contexts);
        let id = contexts.alloc(None)?;
        let Ok(ccq_id) = u8::try_from(id) else {
            contexts.free(id);
            return Err(KmdError::Internal("ccq id out of range"));
        };
        let ctx = Arc::new(Context::new(ccq_id));
        if let Some(slot) = contexts.get_mut(id) {
            *slot = Some(Arc::clone(&ctx));
        }
        debug!(ccq_id, "context created");
        Ok(ctx)
    }

    fn is_own(&self, ctx: &Arc<Context>) -> bool {
        lock(&self.contexts)
            .get(u32::from(ctx.ccq_id()))
            .and_then(Option::as_ref)
            .is_some_and(|c| Arc::ptr_eq(c, ctx))
    }

    /// Frees the CCQ of a context that no longer holds anything firmware can reach.
    fn release_ccq(&self, ctx: &Arc<Context>) {
        ctx.set_state(ContextState::Freed);
        let mut contexts = lock(&self.contexts);
        let ccq = u32::from(ctx.ccq_id());
        let owned = contexts
            .get(ccq)
            .and_then(Option::as_ref)
            .is_some_and(|c| Arc::ptr_eq(c, ctx));
        if owned {
            contexts.free(ccq);
        }
    }

    /// Builds the context's resources and registers them with firmware.
    ///
    /// On failure everything acquired so far is released, the context is `Freed`, and its CCQ
    /// returns to the pool.
    pub fn context_init(&self, ctx: &Arc<Context>, params: &ContextInitParams) -> Result<()> {
        if !self.is_own(ctx) {
            return Err(KmdError::Inval("context does not belong to this device"));
        }
        // Claims the context; ops see no resources until they are installed.
        ctx.transition(ContextState::Created, ContextState::Initialized)?;
        match self.init_resources(ctx.ccq_id(), params) {
            Ok(resources) => {
                ctx.install(resources);
                Ok(())
            }
            Err(InitFailure {
                err,
                leftover: None,
            }) => {
                warn!(%err, ccq_id = ctx.ccq_id(), "context init failed");
                self.release_ccq(ctx);
                Err(err)
            }
            Err(InitFailure {
                err,
                leftover: Some(resources),
            }) => {
                // The CCQ stays claimed with its memory until power-off.
                warn!(%err, ccq_id = ctx.ccq_id(), "context init failed; deferring free");
                ctx.set_state(ContextState::Destroying);
                lock(&self.deferred).push(DeferredContext {
                    ctx: Arc::clone(ctx),
                    _resources: Arc::new(resources),
                });
                Err(err)
            }
        }
    }

    fn init_resources(
        &self,
        ccq_id: u8,
        params: &ContextInitParams,
    ) -> std::result::Result<ContextResources, InitFailure> {
        let resources = ContextResources::create(&self.env, ccq_id, params)?;
        let table = resources.resource_table();
        let priv_queue = resources.submitter().queue();

        let mut cmds = PvaCmdWriter::new();
        cmds.init_resource_table(ccq_id, table.table_mem().iova(), table.max_n_entries())
            .init_queue(
                ccq_id,
                PRIV_QUEUE_ID,
                priv_queue.memory().iova(),
                priv_queue.capacity(),
                resources.submitter().syncpoint_id(),
            );
        // The table was mirrored in bulk by `create`, so the chunk-pool resource needs no
        // UPDATE_RESOURCE_TABLE of its own.
        let privileged = self.privileged()?;
        let value = privileged.submitter.submit_cmds(cmds.as_bytes())?;

        let initialized = privileged.submitter.wait(value).and_then(|()| {
            table.mark_fw_owned();
            resources.init_status_buffer()
        });
        let Err(err) = initialized else {
            return Ok(resources);
        };
        match self.notify_context_deinit(ccq_id) {
            Ok(()) => Err(err.into()),
            Err(deinit) => {
                warn!(%deinit, ccq_id, "could not withdraw partially initialized context");
                Err(InitFailure {
                    err,
                    leftover: Some(resources),
                })
            }
        }
    }

    fn notify_context_deinit(&self, ccq_id: u8) -> Result<()> {
        let mut cmds = PvaCmdWriter::new();
        cmds.deinit_queue(ccq_id, PRIV_QUEUE_ID)
            .deinit_resource_table(ccq_id);
        self.submit_priv(&cmds)
    }

    /// Tears a context down.
    ///
    /// If firmware fails to acknowledge any step the context's memory is kept on a deferred
    /// list until [`Device::power_off`], since firmware may still reach it; the first error is
    /// returned.
    pub fn context_destroy(&self, ctx: &Arc<Context>) -> Result<()> {
        if !self.is_own(ctx) {
            return Err(KmdError::Inval("context does not belong to this device"));
        }
        if ctx.transition(ContextState::Created, ContextState::Freed).is_ok() {
            self.release_ccq(ctx);
            return Ok(());
        }
        ctx.transition(ContextState::Initialized, ContextState::Destroying)?;
        let Some(resources) = ctx.take_resources() else {
            ctx.set_state(ContextState::Initialized);
            return Err(KmdError::Inval("context init in progress"));
        };
        let ccq_id = ctx.ccq_id();

        let mut first_err = resources.destroy_queues();
        if let Err(err) = resources.deinit_status_buffer() {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.notify_context_deinit(ccq_id) {
            first_err.get_or_insert(err);
        }

        match first_err {
            None => {
                drop(resources);
                self.release_ccq(ctx);
                info!(ccq_id, "context destroyed");
                Ok(())
            }
            Some(err) => {
                warn!(%err, ccq_id, "context teardown not acknowledged; deferring free");
                lock(&self.deferred).push(DeferredContext {
                    ctx: Arc::clone(ctx),
                    _resources: resources,
                });
                Err(err)
            }
        }
    }

    pub fn suspend_fw(&self) -> Result<()> {
        let mut cmds = PvaCmdWriter::new();
        cmds.suspend_fw();
        self.submit_priv(&cmds)
    }

    pub fn resume_fw(&self) -> Result<()> {
        let mut cmds = PvaCmdWriter::new();
        cmds.resume_fw();
        self.submit_priv(&cmds)
    }

    pub fn set_trace_level(&self, level: u32) -> Result<()> {
        let mut cmds = PvaCmdWriter::new();
        cmds.set_trace_level(level);
        self.submit_priv(&cmds)
    }

    /// Destroys every live context, shuts firmware down and releases all device memory.
    /// Calling it again is a no-op.
    pub fn power_off(&self) {
        if !self.is_powered() {
            return;
        }
        let live: Vec<Arc<Context>> = lock(&self.contexts)
            .iter()
            .filter_map(|(_, ctx)| ctx.clone())
            .collect();
        for ctx in &live {
            if matches!(ctx.state(), ContextState::Created | ContextState::Initialized) {
                if let Err(err) = self.context_destroy(ctx) {
                    debug!(%err, ccq_id = ctx.ccq_id(), "context destroy during power off");
                }
            }
        }

        self.env.fw.shutdown();

        // Firmware is down; nothing can reach deferred memory any more.
        let deferred = std::mem::take(&mut *lock(&self.deferred));
        for entry in &deferred {
            self.release_ccq(&entry.ctx);
        }
        let freed = deferred.len();
        drop(deferred);

        let privileged = lock(&self.privileged).take();
        drop(privileged);
        info!(deferred_freed = freed, "device powered off");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.power_off();
    }
}
