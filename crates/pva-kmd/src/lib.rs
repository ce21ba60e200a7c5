//! Host-side core of the PVA kernel-mode driver.
//!
//! The driver talks to PVA firmware through shared device memory: per-CCQ resource tables,
//! submission rings of [`pva_protocol::SubmitInfo`] records, chained command buffers and an
//! async status ring. This crate owns the host half of each of those structures and the
//! lifecycle around them.
//!
//! - [`device::Device`] powers the hardware on, owns CCQ 0 and creates contexts.
//! - [`context::Context`] is one client CCQ: resource table, privileged queue, user queues.
//! - [`ops`] batches context operations into one firmware submission.
//! - [`sim::SimFirmware`] is an in-process firmware model used by tests and bring-up.
//!
//! Memory comes from a [`devmem::DeviceMemoryProvider`]; [`devmem::SystemMemoryProvider`]
//! backs it with host memory and a simulated IOVA space.
#![forbid(unsafe_code)]

pub mod block_alloc;
pub mod cmdbuf;
pub mod config;
pub mod context;
pub mod device;
pub mod devmem;
pub mod devmem_pool;
pub mod error;
pub mod fw;
pub mod loader;
pub mod ops;
pub mod queue;
pub mod resource_table;
pub mod sim;
pub mod submitter;
pub mod sync;
pub mod syncpoint;

pub use config::{ContextInitParams, FwTiming, KmdConfig};
pub use context::{Context, ContextResources, ContextState, Queue};
pub use device::Device;
pub use devmem::{DeviceMemory, DeviceMemoryProvider, SystemMemoryProvider};
pub use error::{KmdError, Result};
pub use fw::{BootParams, FirmwareChannel};
pub use loader::{Loaders, SymbolInfo};
pub use ops::{OpPayload, OpRequest, OpResponse};
pub use sim::{SimFirmware, SimMode};
