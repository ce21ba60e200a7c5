//! Growable pool of uniformly sized device-memory elements.
//!
//! The pool maps device memory in segments of `n_element_incr` elements and hands out elements
//! from whichever segment has room. When the pool-wide free count exceeds twice a segment's
//! worth, one fully idle segment is unmapped.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::block_alloc::BlockAllocator;
use crate::devmem::{DeviceMemory, DeviceMemoryError, DeviceMemoryProvider};
use crate::error::{KmdError, Result};
use crate::sync::lock;

/// One element handed out by [`DeviceMemoryPool::zalloc`].
///
/// Refers back to its segment by ID and slot index; it must be returned with
/// [`DeviceMemoryPool::free`] to the pool that produced it.
#[derive(Debug)]
pub struct DevmemElement {
    segment_id: u32,
    index: u32,
    mem: DeviceMemory,
    offset: u64,
    size: u64,
}

impl DevmemElement {
    pub fn iova(&self) -> u64 {
        self.mem.iova() + self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The segment allocation and this element's offset within it.
    pub fn memory(&self) -> (&DeviceMemory, u64) {
        (&self.mem, self.offset)
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<(), DeviceMemoryError> {
        if offset + src.len() as u64 > self.size {
            return Err(DeviceMemoryError::OutOfRange {
                offset,
                len: src.len() as u64,
                size: self.size,
            });
        }
        self.mem.write_from(self.offset + offset, src)
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<(), DeviceMemoryError> {
        if offset + dst.len() as u64 > self.size {
            return Err(DeviceMemoryError::OutOfRange {
                offset,
                len: dst.len() as u64,
                size: self.size,
            });
        }
        self.mem.read_into(self.offset + offset, dst)
    }
}

struct Segment {
    id: u32,
    mem: DeviceMemory,
    slots: BlockAllocator<()>,
}

struct PoolInner {
    segments: Vec<Segment>,
    next_segment_id: u32,
    n_free: u32,
}

pub struct DeviceMemoryPool {
    provider: Arc<dyn DeviceMemoryProvider>,
    smmu_context_id: u8,
    element_size: u64,
    n_element_incr: u32,
    inner: Mutex<PoolInner>,
}

impl DeviceMemoryPool {
    pub fn new(
        provider: Arc<dyn DeviceMemoryProvider>,
        smmu_context_id: u8,
        element_size: u64,
        n_element_incr: u32,
    ) -> Self {
        debug_assert!(element_size > 0 && n_element_incr > 0);
        Self {
            provider,
            smmu_context_id,
            element_size,
            n_element_incr,
            inner: Mutex::new(PoolInner {
                segments: Vec::new(),
                next_segment_id: 0,
                n_free: 0,
            }),
        }
    }

    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    pub fn free_count(&self) -> u32 {
        lock(&self.inner).n_free
    }

    pub fn segment_count(&self) -> usize {
        lock(&self.inner).segments.len()
    }

    pub fn zalloc(&self) -> Result<DevmemElement> {
        let mut inner = lock(&self.inner);
        if inner.n_free == 0 {
            let bytes = self
                .element_size
                .checked_mul(u64::from(self.n_element_incr))
                .ok_or(KmdError::NoMem)?;
            let mem = self.provider.allocate(bytes, self.smmu_context_id)?;
            let id = inner.next_segment_id;
            inner.next_segment_id = id.wrapping_add(1);
            inner.segments.push(Segment {
                id,
                mem,
                slots: BlockAllocator::new(0, self.n_element_incr),
            });
            inner.n_free += self.n_element_incr;
            debug!(
                segment_id = id,
                segments = inner.segments.len(),
                "device memory pool grew"
            );
        }

        let segment = inner
            .segments
            .iter_mut()
            .find(|s| !s.slots.is_full())
            .ok_or(KmdError::Internal("pool free count disagrees with segments"))?;
        let index = segment.slots.zalloc()?;
        let element = DevmemElement {
            segment_id: segment.id,
            index,
            mem: segment.mem.clone(),
            offset: u64::from(index) * self.element_size,
            size: self.element_size,
        };
        inner.n_free -= 1;
        drop(inner);

        element.mem.zero(element.offset, element.size)?;
        Ok(element)
    }

    pub fn free(&self, element: DevmemElement) {
        let mut inner = lock(&self.inner);
        let Some(segment) = inner
            .segments
            .iter_mut()
            .find(|s| s.id == element.segment_id)
        else {
            warn!(
                segment_id = element.segment_id,
                "element returned to a pool that does not own its segment"
            );
            return;
        };
        if segment.slots.free(element.index).is_none() {
            return;
        }
        inner.n_free += 1;

        if inner.n_free <= 2 * self.n_element_incr {
            return;
        }
        let Some(pos) = inner.segments.iter().rposition(|s| s.slots.is_empty()) else {
            return;
        };
        let segment = inner.segments.remove(pos);
        inner.n_free -= self.n_element_incr;
        let remaining = inner.segments.len();
        drop(inner);

        debug!(
            segment_id = segment.id,
            segments = remaining,
            "device memory pool released idle segment"
        );
        self.provider.release(segment.mem);
    }
}

impl Drop for DeviceMemoryPool {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for segment in inner.segments.drain(..) {
            if !segment.slots.is_empty() {
                warn!(
                    segment_id = segment.id,
                    live = segment.slots.num_allocated(),
                    "device memory pool dropped with live elements"
                );
            }
            self.provider.release(segment.mem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devmem::SystemMemoryProvider;

    fn pool(incr: u32) -> (Arc<SystemMemoryProvider>, DeviceMemoryPool) {
        let provider = Arc::new(SystemMemoryProvider::new());
        let pool = DeviceMemoryPool::new(provider.clone(), 3, 64, incr);
        (provider, pool)
    }

    #[test]
    fn grows_one_segment_at_a_time() {
        let (provider, pool) = pool(2);
        let a = pool.zalloc().unwrap();
        let b = pool.zalloc().unwrap();
        assert_eq!(pool.segment_count(), 1);
        let c = pool.zalloc().unwrap();
        assert_eq!(pool.segment_count(), 2);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(provider.stats().allocations, 2);
        assert_eq!(b.iova(), a.iova() + 64);
        assert_eq!(c.memory().0.smmu_context_id(), 3);
        for e in [a, b, c] {
            pool.free(e);
        }
    }

    #[test]
    fn elements_come_back_zeroed() {
        let (_provider, pool) = pool(1);
        let e = pool.zalloc().unwrap();
        e.write(0, &[0xAA; 64]).unwrap();
        pool.free(e);
        let e = pool.zalloc().unwrap();
        let mut buf = [0xFFu8; 64];
        e.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
        assert!(e.write(60, &[0; 8]).is_err());
        pool.free(e);
    }

    #[test]
    fn idle_segment_released_only_past_twice_the_increment() {
        let (provider, pool) = pool(2);
        let elems: Vec<_> = (0..6).map(|_| pool.zalloc().unwrap()).collect();
        assert_eq!(pool.segment_count(), 3);

        let mut elems = elems.into_iter();
        // Free count 1..=4 keeps every segment mapped.
        for _ in 0..4 {
            pool.free(elems.next().unwrap());
        }
        assert_eq!(pool.segment_count(), 3);
        assert_eq!(provider.stats().releases, 0);

        // The fifth free pushes the count to 5 > 4 and an idle segment goes away.
        pool.free(elems.next().unwrap());
        assert_eq!(pool.segment_count(), 2);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(provider.stats().releases, 1);

        pool.free(elems.next().unwrap());
        drop(pool);
        assert_eq!(provider.stats().live, 0);
    }

    #[test]
    fn segment_map_failure_is_nomem() {
        let (provider, pool) = pool(4);
        provider.fail_nth_allocation(1);
        assert_eq!(pool.zalloc().unwrap_err(), KmdError::NoMem);
        assert_eq!(pool.segment_count(), 0);
    }
}
