use std::time::Duration;

use pva_protocol::{CmdHeader, LinkChunk};

use crate::error::{KmdError, Result};

/// Upper bound on waiting for a free resource ID (`PVA_KMD_TIMEOUT_RESOURCE_SEMA_MS`).
pub const PVA_KMD_TIMEOUT_RESOURCE_SEMA_MS: u64 = 400;
/// Upper bound on any firmware poll loop (`WAIT_FW_TIMEOUT_US`).
pub const WAIT_FW_TIMEOUT_US: u64 = 1_000_000;
/// Sleep between two polls of firmware-owned memory (`WAIT_FW_POLL_INTERVAL_US`).
pub const WAIT_FW_POLL_INTERVAL_US: u64 = 100;

/// Bounds for the polling waits performed against firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwTiming {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for FwTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_micros(WAIT_FW_TIMEOUT_US),
            poll_interval: Duration::from_micros(WAIT_FW_POLL_INTERVAL_US),
        }
    }
}

/// Device-wide driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmdConfig {
    pub resource_sema_timeout: Duration,
    pub fw_timing: FwTiming,
    /// Client contexts get CCQ IDs `1..=max_contexts`; CCQ 0 belongs to the device.
    pub max_contexts: u8,
    pub max_queues_per_context: u8,
    pub num_syncpoints: u32,
    pub priv_chunk_size: u32,
    pub priv_num_chunks: u32,
    pub priv_max_submits: u32,
    pub priv_execution_timeout_ms: u32,
    pub device_resource_entries: u32,
    /// Pooled DMA-config buffers mapped per segment.
    pub dma_config_pool_incr: u32,
    pub dma_config_size: u32,
    pub status_ring_capacity: u32,
}

impl Default for KmdConfig {
    fn default() -> Self {
        Self {
            resource_sema_timeout: Duration::from_millis(PVA_KMD_TIMEOUT_RESOURCE_SEMA_MS),
            fw_timing: FwTiming::default(),
            max_contexts: 7,
            max_queues_per_context: 8,
            num_syncpoints: 64,
            priv_chunk_size: 1024,
            priv_num_chunks: 32,
            priv_max_submits: 16,
            priv_execution_timeout_ms: 1000,
            device_resource_entries: 32,
            dma_config_pool_incr: 8,
            dma_config_size: 2048,
            status_ring_capacity: 32,
        }
    }
}

impl KmdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_contexts == 0 || self.max_contexts == u8::MAX {
            return Err(KmdError::Inval("max_contexts out of range"));
        }
        if self.max_queues_per_context == 0 || self.max_queues_per_context == u8::MAX {
            return Err(KmdError::Inval("max_queues_per_context out of range"));
        }
        if self.num_syncpoints == 0 {
            return Err(KmdError::Inval("num_syncpoints must be non-zero"));
        }
        validate_chunking(self.priv_chunk_size, self.priv_num_chunks)?;
        if self.priv_max_submits < 2 {
            return Err(KmdError::Inval("priv_max_submits must be at least 2"));
        }
        if self.device_resource_entries == 0 {
            return Err(KmdError::Inval("device_resource_entries must be non-zero"));
        }
        if self.dma_config_pool_incr == 0 || self.dma_config_size == 0 {
            return Err(KmdError::Inval("dma config pool must be non-empty"));
        }
        if self.status_ring_capacity == 0 {
            return Err(KmdError::Inval("status_ring_capacity must be non-zero"));
        }
        if self.fw_timing.poll_interval.is_zero() {
            return Err(KmdError::Inval("poll interval must be non-zero"));
        }
        Ok(())
    }
}

/// Per-context sizing supplied with context init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextInitParams {
    pub n_resource_entries: u32,
    pub chunk_size: u32,
    pub num_chunks: u32,
    pub max_submits: u32,
}

impl ContextInitParams {
    pub fn from_config(config: &KmdConfig) -> Self {
        Self {
            n_resource_entries: 64,
            chunk_size: config.priv_chunk_size,
            num_chunks: config.priv_num_chunks,
            max_submits: config.priv_max_submits,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_resource_entries == 0 {
            return Err(KmdError::Inval("n_resource_entries must be non-zero"));
        }
        validate_chunking(self.chunk_size, self.num_chunks)?;
        if self.max_submits < 2 {
            return Err(KmdError::Inval("max_submits must be at least 2"));
        }
        Ok(())
    }
}

impl Default for ContextInitParams {
    fn default() -> Self {
        Self::from_config(&KmdConfig::default())
    }
}

fn validate_chunking(chunk_size: u32, num_chunks: u32) -> Result<()> {
    if num_chunks == 0 {
        return Err(KmdError::Inval("num_chunks must be non-zero"));
    }
    if chunk_size % 4 != 0 {
        return Err(KmdError::Inval("chunk_size must be a multiple of 4"));
    }
    if (chunk_size as usize) < LinkChunk::SIZE_BYTES + CmdHeader::SIZE_BYTES {
        return Err(KmdError::Inval("chunk_size cannot hold a link and one command"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        KmdConfig::default().validate().unwrap();
        ContextInitParams::default().validate().unwrap();
    }

    #[test]
    fn rejects_chunks_too_small_for_link() {
        let params = ContextInitParams {
            chunk_size: 20,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(KmdError::Inval("chunk_size cannot hold a link and one command"))
        );
    }

    #[test]
    fn rejects_single_slot_queue() {
        let config = KmdConfig {
            priv_max_submits: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
