//! Device memory handles and the provider that maps them.
//!
//! A [`DeviceMemory`] is the host view (`va`) of a buffer the firmware reaches at `iova`. Both
//! sides may touch it concurrently, so the backing store is a slice of `AtomicU32` words and
//! every accessor is bounds checked. Word accessors use acquire/release ordering and are what
//! producer/consumer handoffs (queue indices, chunk states, fences) go through; bulk byte copies
//! are relaxed and must be published by a later release store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use pva_protocol::RESOURCE_MAX_ADDR;
use thiserror::Error;
use tracing::{debug, error};

use crate::error::{KmdError, Result};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceMemoryError {
    #[error("device memory access out of range: offset=0x{offset:x} len={len} size={size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("unaligned device memory word access at offset 0x{offset:x}")]
    Unaligned { offset: u64 },
}

struct Inner {
    iova: u64,
    size: u64,
    smmu_context_id: u8,
    words: Box<[AtomicU32]>,
}

/// Cloneable handle to one device-memory allocation.
#[derive(Clone)]
pub struct DeviceMemory {
    inner: Arc<Inner>,
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("iova", &format_args!("0x{:x}", self.inner.iova))
            .field("size", &self.inner.size)
            .field("smmu_context_id", &self.inner.smmu_context_id)
            .finish()
    }
}

impl DeviceMemory {
    /// Creates zeroed memory. Only providers call this.
    pub fn new(iova: u64, size: u64, smmu_context_id: u8) -> Self {
        let n_words = size.div_ceil(4) as usize;
        let words = (0..n_words).map(|_| AtomicU32::new(0)).collect();
        Self {
            inner: Arc::new(Inner {
                iova,
                size,
                smmu_context_id,
                words,
            }),
        }
    }

    pub fn iova(&self) -> u64 {
        self.inner.iova
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn smmu_context_id(&self) -> u8 {
        self.inner.smmu_context_id
    }

    /// Whether two handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), DeviceMemoryError> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= self.inner.size => Ok(()),
            _ => Err(DeviceMemoryError::OutOfRange {
                offset,
                len,
                size: self.inner.size,
            }),
        }
    }

    fn word_index(&self, offset: u64) -> Result<usize, DeviceMemoryError> {
        if offset % 4 != 0 {
            return Err(DeviceMemoryError::Unaligned { offset });
        }
        self.check_range(offset, 4)?;
        Ok((offset / 4) as usize)
    }

    fn load_byte(&self, addr: u64) -> u8 {
        let word = self.inner.words[(addr / 4) as usize].load(Ordering::Relaxed);
        (word >> ((addr % 4) * 8)) as u8
    }

    fn store_byte(&self, addr: u64, v: u8) {
        let shift = (addr % 4) * 8;
        let word = &self.inner.words[(addr / 4) as usize];
        word.fetch_and(!(0xFFu32 << shift), Ordering::Relaxed);
        word.fetch_or(u32::from(v) << shift, Ordering::Relaxed);
    }

    pub fn read_into(&self, offset: u64, dst: &mut [u8]) -> Result<(), DeviceMemoryError> {
        self.check_range(offset, dst.len() as u64)?;
        let mut addr = offset;
        let mut rest = dst;
        while addr % 4 != 0 {
            let Some((b, tail)) = std::mem::take(&mut rest).split_first_mut() else {
                return Ok(());
            };
            *b = self.load_byte(addr);
            addr += 1;
            rest = tail;
        }
        let mut words = rest.chunks_exact_mut(4);
        for chunk in words.by_ref() {
            let word = self.inner.words[(addr / 4) as usize].load(Ordering::Relaxed);
            chunk.copy_from_slice(&word.to_le_bytes());
            addr += 4;
        }
        for b in words.into_remainder() {
            *b = self.load_byte(addr);
            addr += 1;
        }
        Ok(())
    }

    pub fn write_from(&self, offset: u64, src: &[u8]) -> Result<(), DeviceMemoryError> {
        self.check_range(offset, src.len() as u64)?;
        let mut addr = offset;
        let mut rest = src;
        while addr % 4 != 0 && !rest.is_empty() {
            self.store_byte(addr, rest[0]);
            addr += 1;
            rest = &rest[1..];
        }
        let mut words = rest.chunks_exact(4);
        for chunk in words.by_ref() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.inner.words[(addr / 4) as usize].store(word, Ordering::Relaxed);
            addr += 4;
        }
        for &b in words.remainder() {
            self.store_byte(addr, b);
            addr += 1;
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceMemoryError> {
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    pub fn zero(&self, offset: u64, len: u64) -> Result<(), DeviceMemoryError> {
        self.check_range(offset, len)?;
        let zeros = [0u8; 256];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(zeros.len() as u64);
            self.write_from(offset + done, &zeros[..n as usize])?;
            done += n;
        }
        Ok(())
    }

    /// Acquire load of an aligned firmware-shared word.
    pub fn read_u32(&self, offset: u64) -> Result<u32, DeviceMemoryError> {
        let idx = self.word_index(offset)?;
        Ok(self.inner.words[idx].load(Ordering::Acquire))
    }

    /// Release store of an aligned firmware-shared word.
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<(), DeviceMemoryError> {
        let idx = self.word_index(offset)?;
        self.inner.words[idx].store(value, Ordering::Release);
        Ok(())
    }
}

/// Allocates and maps device memory for one SMMU context.
pub trait DeviceMemoryProvider: Send + Sync {
    /// Returns zeroed memory of at least `size` bytes, or `NoMem`.
    fn allocate(&self, size: u64, smmu_context_id: u8) -> Result<DeviceMemory>;

    /// Unmaps and frees `mem`. Each allocation is released exactly once.
    fn release(&self, mem: DeviceMemory);
}

/// Device memory that goes back to its provider when dropped.
pub struct OwnedMemory {
    provider: Arc<dyn DeviceMemoryProvider>,
    mem: DeviceMemory,
    armed: bool,
}

impl OwnedMemory {
    pub fn allocate(
        provider: &Arc<dyn DeviceMemoryProvider>,
        size: u64,
        smmu_context_id: u8,
    ) -> Result<Self> {
        let mem = provider.allocate(size, smmu_context_id)?;
        Ok(Self {
            provider: Arc::clone(provider),
            mem,
            armed: true,
        })
    }

    /// Gives up ownership without releasing.
    pub fn into_inner(mut self) -> DeviceMemory {
        self.armed = false;
        self.mem.clone()
    }
}

impl std::ops::Deref for OwnedMemory {
    type Target = DeviceMemory;

    fn deref(&self) -> &DeviceMemory {
        &self.mem
    }
}

impl fmt::Debug for OwnedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedMemory").field(&self.mem).finish()
    }
}

impl Drop for OwnedMemory {
    fn drop(&mut self) {
        if self.armed {
            self.provider.release(self.mem.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub allocations: u64,
    pub releases: u64,
    pub failed_allocations: u64,
    pub double_releases: u64,
    pub live: u64,
    pub live_bytes: u64,
}

const IOVA_BASE: u64 = 0x1000_0000;
const IOVA_GRANULE: u64 = 0x1000;

struct SystemInner {
    next_iova: u64,
    live: BTreeMap<u64, DeviceMemory>,
    budget: Option<u64>,
    fail_in: Option<u64>,
    stats: ProviderStats,
}

/// Provider backed by host memory with a simulated 40-bit IOVA space.
///
/// Keeps a registry of live allocations so a simulated firmware can translate IOVAs back to
/// memory, and counts allocations for leak and double-free checks.
pub struct SystemMemoryProvider {
    inner: Mutex<SystemInner>,
}

impl Default for SystemMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemoryProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SystemInner {
                next_iova: IOVA_BASE,
                live: BTreeMap::new(),
                budget: None,
                fail_in: None,
                stats: ProviderStats::default(),
            }),
        }
    }

    /// Caps the total live bytes; allocations past the cap fail with `NoMem`.
    pub fn with_budget(bytes: u64) -> Self {
        let provider = Self::new();
        lock(&provider.inner).budget = Some(bytes);
        provider
    }

    /// Makes the `n`th allocation from now (1-based) fail once with `NoMem`.
    pub fn fail_nth_allocation(&self, n: u64) {
        lock(&self.inner).fail_in = Some(n.max(1));
    }

    pub fn stats(&self) -> ProviderStats {
        lock(&self.inner).stats
    }

    /// Resolves `[iova, iova + len)` to the allocation containing it and the offset inside it.
    pub fn translate(&self, iova: u64, len: u64) -> Option<(DeviceMemory, u64)> {
        let inner = lock(&self.inner);
        let (&base, mem) = inner.live.range(..=iova).next_back()?;
        let offset = iova - base;
        let end = offset.checked_add(len)?;
        (end <= mem.size()).then(|| (mem.clone(), offset))
    }
}

impl DeviceMemoryProvider for SystemMemoryProvider {
    fn allocate(&self, size: u64, smmu_context_id: u8) -> Result<DeviceMemory> {
        if size == 0 {
            return Err(KmdError::Inval("zero-sized device memory allocation"));
        }
        let mut inner = lock(&self.inner);

        if let Some(n) = inner.fail_in {
            if n <= 1 {
                inner.fail_in = None;
                inner.stats.failed_allocations += 1;
                debug!(size, "injected device memory allocation failure");
                return Err(KmdError::NoMem);
            }
            inner.fail_in = Some(n - 1);
        }
        if let Some(budget) = inner.budget {
            if inner.stats.live_bytes + size > budget {
                inner.stats.failed_allocations += 1;
                return Err(KmdError::NoMem);
            }
        }

        let span = size.div_ceil(IOVA_GRANULE) * IOVA_GRANULE;
        let iova = inner.next_iova;
        let next = iova.checked_add(span).ok_or(KmdError::NoMem)?;
        if next - 1 > RESOURCE_MAX_ADDR {
            inner.stats.failed_allocations += 1;
            return Err(KmdError::NoMem);
        }
        inner.next_iova = next;

        let mem = DeviceMemory::new(iova, size, smmu_context_id);
        inner.live.insert(iova, mem.clone());
        inner.stats.allocations += 1;
        inner.stats.live += 1;
        inner.stats.live_bytes += size;
        Ok(mem)
    }

    fn release(&self, mem: DeviceMemory) {
        let mut inner = lock(&self.inner);
        match inner.live.get(&mem.iova()) {
            Some(live) if live.same_allocation(&mem) => {
                inner.live.remove(&mem.iova());
                inner.stats.releases += 1;
                inner.stats.live -= 1;
                inner.stats.live_bytes -= mem.size();
            }
            _ => {
                inner.stats.double_releases += 1;
                error!(iova = mem.iova(), "release of device memory that is not live");
            }
        }
    }
}
