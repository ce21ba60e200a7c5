#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pva_kmd::{
    Context, ContextInitParams, Device, DeviceMemory, DeviceMemoryProvider, FirmwareChannel,
    FwTiming, KmdConfig, Loaders, SimFirmware, SimMode, SystemMemoryProvider,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short firmware waits so timeout paths finish quickly.
pub fn test_config() -> KmdConfig {
    KmdConfig {
        fw_timing: FwTiming {
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_micros(50),
        },
        ..Default::default()
    }
}

pub fn small_params() -> ContextInitParams {
    ContextInitParams {
        n_resource_entries: 16,
        chunk_size: 256,
        num_chunks: 8,
        max_submits: 8,
    }
}

pub struct Harness {
    pub provider: Arc<SystemMemoryProvider>,
    pub fw: Arc<SimFirmware>,
    pub device: Arc<Device>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), SimMode::Immediate)
    }

    pub fn with(config: KmdConfig, mode: SimMode) -> Self {
        Self::with_channel(config, mode, |fw| fw as Arc<dyn FirmwareChannel>)
    }

    /// Boots the device through whatever channel `wrap` builds around the simulator.
    pub fn with_channel(
        config: KmdConfig,
        mode: SimMode,
        wrap: impl FnOnce(Arc<SimFirmware>) -> Arc<dyn FirmwareChannel>,
    ) -> Self {
        init_tracing();
        let provider = Arc::new(SystemMemoryProvider::new());
        let fw = Arc::new(SimFirmware::with_mode(Arc::clone(&provider), mode));
        let device = Device::new(
            config,
            provider.clone(),
            wrap(Arc::clone(&fw)),
            Loaders::default(),
        )
        .expect("device power on");
        Self {
            provider,
            fw,
            device,
        }
    }

    pub fn context(&self) -> Arc<Context> {
        let ctx = self.device.context_create().expect("context create");
        self.device
            .context_init(&ctx, &small_params())
            .expect("context init");
        ctx
    }

    pub fn alloc(&self, size: u64, ctx: &Context) -> DeviceMemory {
        self.provider
            .allocate(size, ctx.ccq_id())
            .expect("device memory")
    }

    pub fn live_allocations(&self) -> u64 {
        self.provider.stats().live
    }
}
