use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::block_alloc::BlockAllocator;
use crate::error::Result;
use crate::sync::lock;

/// Device-wide pool of syncpoint IDs shared by every queue.
pub struct SyncpointPool {
    ids: Mutex<BlockAllocator<()>>,
}

impl SyncpointPool {
    pub fn new(num_syncpoints: u32) -> Self {
        Self {
            ids: Mutex::new(BlockAllocator::new(0, num_syncpoints)),
        }
    }

    /// Hands out a syncpoint that returns to the pool when the lease drops.
    pub fn lease(self: &Arc<Self>) -> Result<SyncpointLease> {
        let id = lock(&self.ids).alloc(())?;
        trace!(id, "syncpoint leased");
        Ok(SyncpointLease {
            pool: Arc::clone(self),
            id,
        })
    }

    pub fn num_leased(&self) -> u32 {
        lock(&self.ids).num_allocated()
    }
}

pub struct SyncpointLease {
    pool: Arc<SyncpointPool>,
    id: u32,
}

impl SyncpointLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for SyncpointLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SyncpointLease").field(&self.id).finish()
    }
}

impl Drop for SyncpointLease {
    fn drop(&mut self) {
        lock(&self.pool.ids).free(self.id);
        trace!(id = self.id, "syncpoint returned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KmdError;

    #[test]
    fn leases_return_ids_on_drop() {
        let pool = Arc::new(SyncpointPool::new(2));
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.lease().unwrap_err(), KmdError::NoMem);

        let freed = a.id();
        drop(a);
        assert_eq!(pool.num_leased(), 1);
        assert_eq!(pool.lease().unwrap().id(), freed);
    }
}
