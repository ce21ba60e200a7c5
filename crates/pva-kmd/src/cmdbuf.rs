//! Command-buffer chunk pool and builder.
//!
//! One device-memory region holds `num_chunks` chunks of `chunk_size` bytes followed by a `u32`
//! state word per chunk. The region is a DRAM resource of the owning context, so firmware
//! reaches chunk `i` at resource offset `i * chunk_size`. Every chunk starts with a
//! [`LinkChunk`] describing the chunk after it; a chain ends at a link whose resource ID is
//! `RESOURCE_ID_INVALID`.
//!
//! A submitted chain is reclaimed when firmware writes `FenceTriggered` into the state word of
//! its first chunk (the free-notifier fence). Reclamation is lazy: the pool only scans states
//! once the allocator is exhausted, and takes the first triggered chain in index order.

use std::sync::Mutex;

use pva_protocol::{Fence, LinkChunk, RESOURCE_ID_INVALID};
use tracing::{debug, error, trace};

use crate::block_alloc::BlockAllocator;
use crate::devmem::DeviceMemory;
use crate::error::{KmdError, Result};
use crate::sync::lock;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Invalid = 0,
    FenceTriggered = 1,
}

/// A finalized chain ready to be referenced from a `SubmitInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdbufChain {
    pub first_chunk_id: u32,
    pub resource_id: u32,
    pub first_chunk_offset: u64,
    pub first_chunk_size: u32,
}

pub struct CmdbufChunkPool {
    mem: DeviceMemory,
    resource_id: u32,
    chunk_size: u32,
    num_chunks: u32,
    chunks: Mutex<BlockAllocator<()>>,
}

impl CmdbufChunkPool {
    pub fn required_bytes(chunk_size: u32, num_chunks: u32) -> u64 {
        (u64::from(chunk_size) + 4) * u64::from(num_chunks)
    }

    /// `mem` must already be registered as resource `resource_id`; the pool neither owns nor
    /// releases it.
    pub fn new(
        mem: DeviceMemory,
        resource_id: u32,
        chunk_size: u32,
        num_chunks: u32,
    ) -> Result<Self> {
        if chunk_size % 4 != 0 || (chunk_size as usize) <= LinkChunk::SIZE_BYTES || num_chunks == 0
        {
            return Err(KmdError::Inval("bad command buffer chunk geometry"));
        }
        if mem.size() < Self::required_bytes(chunk_size, num_chunks) {
            return Err(KmdError::Inval("chunk pool memory too small"));
        }
        let pool = Self {
            mem,
            resource_id,
            chunk_size,
            num_chunks,
            chunks: Mutex::new(BlockAllocator::new(0, num_chunks)),
        };
        pool.mem.zero(pool.state_offset(0), u64::from(num_chunks) * 4)?;
        Ok(pool)
    }

    pub fn resource_id(&self) -> u32 {
        self.resource_id
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.mem
    }

    pub fn num_free(&self) -> u32 {
        self.num_chunks - lock(&self.chunks).num_allocated()
    }

    /// Largest command `reserve_cmd_space` accepts.
    pub fn max_cmd_bytes(&self) -> usize {
        self.chunk_size as usize - LinkChunk::SIZE_BYTES
    }

    pub fn chunk_offset(&self, chunk_id: u32) -> u64 {
        u64::from(chunk_id) * u64::from(self.chunk_size)
    }

    pub fn state_offset(&self, chunk_id: u32) -> u64 {
        u64::from(self.chunk_size) * u64::from(self.num_chunks) + u64::from(chunk_id) * 4
    }

    /// Fence that makes the chain starting at `chunk_id` reclaimable once firmware signals it.
    pub fn get_free_notifier_fence(&self, chunk_id: u32) -> Fence {
        Fence::semaphore(
            self.resource_id,
            self.state_offset(chunk_id),
            ChunkState::FenceTriggered as u32,
        )
    }

    pub fn alloc_cmdbuf_chunk(&self) -> Result<u32> {
        let mut chunks = lock(&self.chunks);
        match chunks.zalloc() {
            Err(KmdError::NoMem) if self.recycle_chunks(&mut chunks) => chunks.zalloc(),
            res => res,
        }
    }

    fn recycle_chunks(&self, chunks: &mut BlockAllocator<()>) -> bool {
        let triggered = (0..self.num_chunks).find(|&id| {
            chunks.get(id).is_some()
                && self.mem.read_u32(self.state_offset(id)) == Ok(ChunkState::FenceTriggered as u32)
        });
        let Some(first) = triggered else {
            return false;
        };
        let freed = self.free_chain_locked(chunks, first);
        debug!(first, freed, "recycled completed command buffer chain");
        true
    }

    /// Frees every chain firmware has signalled. Returns how many chains were reclaimed.
    pub fn reclaim_completed(&self) -> u32 {
        let mut chunks = lock(&self.chunks);
        let mut chains = 0;
        while self.recycle_chunks(&mut chunks) {
            chains += 1;
        }
        chains
    }

    /// Frees the chain starting at `first_chunk_id` by walking its link headers.
    pub fn free_linked_cmdbuf_chunks(&self, first_chunk_id: u32) {
        let mut chunks = lock(&self.chunks);
        self.free_chain_locked(&mut chunks, first_chunk_id);
    }

    fn free_chain_locked(&self, chunks: &mut BlockAllocator<()>, first: u32) -> u32 {
        if let Err(err) = self
            .mem
            .write_u32(self.state_offset(first), ChunkState::Invalid as u32)
        {
            error!(%err, first, "failed to reset chunk state");
        }
        let mut freed = 0;
        let mut id = first;
        // A well-formed chain never visits more chunks than the pool has.
        for _ in 0..self.num_chunks {
            let next = self.next_in_chain(id);
            if chunks.free(id).is_some() {
                freed += 1;
            }
            match next {
                Some(next) => id = next,
                None => break,
            }
        }
        freed
    }

    fn next_in_chain(&self, chunk_id: u32) -> Option<u32> {
        let raw = self
            .mem
            .read_vec(self.chunk_offset(chunk_id), LinkChunk::SIZE_BYTES)
            .ok()?;
        let link = match LinkChunk::decode_le(&raw) {
            Ok(link) => link,
            Err(err) => {
                error!(%err, chunk_id, "corrupt link header in command buffer chain");
                return None;
            }
        };
        if link.next_chunk_resource_id == RESOURCE_ID_INVALID {
            return None;
        }
        let chunk_size = u64::from(self.chunk_size);
        let valid = link.next_chunk_resource_id == self.resource_id
            && link.next_chunk_offset % chunk_size == 0
            && link.next_chunk_offset / chunk_size < u64::from(self.num_chunks);
        if !valid {
            error!(chunk_id, ?link, "link header points outside the chunk pool");
            return None;
        }
        Some((link.next_chunk_offset / chunk_size) as u32)
    }

    fn free_chunks(&self, ids: &[u32]) {
        let mut chunks = lock(&self.chunks);
        for &id in ids {
            chunks.free(id);
        }
    }

    /// Starts a new command buffer.
    pub fn builder(&self) -> Result<CmdbufBuilder<'_>> {
        let first = self.alloc_cmdbuf_chunk()?;
        let mut staged = Vec::with_capacity(self.chunk_size as usize);
        staged.extend_from_slice(&LinkChunk::default().to_le_bytes());
        Ok(CmdbufBuilder {
            pool: self,
            first_chunk_id: first,
            first_chunk_size: None,
            current_chunk_id: first,
            staged,
            prev_link_chunk: None,
            chunks: vec![first],
            done: false,
        })
    }
}

/// Composes one command buffer across as many chunks as it needs.
///
/// The current chunk is staged in host memory and written out when the next chunk is linked or
/// the builder is finalized. Dropping a builder that was not finalized cancels it.
pub struct CmdbufBuilder<'a> {
    pool: &'a CmdbufChunkPool,
    first_chunk_id: u32,
    first_chunk_size: Option<u32>,
    current_chunk_id: u32,
    staged: Vec<u8>,
    /// Chunk whose link header describes the current chunk; its size field is patched on flush.
    prev_link_chunk: Option<u32>,
    chunks: Vec<u32>,
    done: bool,
}

impl CmdbufBuilder<'_> {
    pub fn first_chunk_id(&self) -> u32 {
        self.first_chunk_id
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `size` zeroed bytes of command space, linking a new chunk if needed.
    ///
    /// # Panics
    ///
    /// If `size` exceeds the chunk size minus the link header.
    pub fn reserve_cmd_space(&mut self, size: usize) -> Result<&mut [u8]> {
        assert!(
            size <= self.pool.max_cmd_bytes(),
            "command of {size} bytes cannot fit in a {} byte chunk",
            self.pool.chunk_size
        );
        if self.staged.len() + size > self.pool.chunk_size as usize {
            self.link_next_chunk()?;
        }
        let start = self.staged.len();
        self.staged.resize(start + size, 0);
        Ok(&mut self.staged[start..])
    }

    pub fn push_cmd(&mut self, cmd: &[u8]) -> Result<()> {
        self.reserve_cmd_space(cmd.len())?.copy_from_slice(cmd);
        Ok(())
    }

    fn link_next_chunk(&mut self) -> Result<()> {
        let next = self.pool.alloc_cmdbuf_chunk()?;
        self.chunks.push(next);
        let link = LinkChunk {
            next_chunk_offset: self.pool.chunk_offset(next),
            next_chunk_resource_id: self.pool.resource_id,
            next_chunk_size: 0,
        };
        self.staged[..LinkChunk::SIZE_BYTES].copy_from_slice(&link.to_le_bytes());
        self.flush_current()?;
        trace!(from = self.current_chunk_id, to = next, "linked command buffer chunk");

        self.prev_link_chunk = Some(self.current_chunk_id);
        self.current_chunk_id = next;
        self.staged.clear();
        self.staged.extend_from_slice(&LinkChunk::default().to_le_bytes());
        Ok(())
    }

    fn flush_current(&mut self) -> Result<()> {
        let used = self.staged.len() as u32;
        match self.prev_link_chunk {
            Some(prev) => self.pool.mem.write_u32(
                self.pool.chunk_offset(prev) + LinkChunk::NEXT_CHUNK_SIZE_OFFSET as u64,
                used,
            )?,
            None => self.first_chunk_size = Some(used),
        }
        self.pool
            .mem
            .write_from(self.pool.chunk_offset(self.current_chunk_id), &self.staged)?;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<CmdbufChain> {
        self.flush_current()?;
        let first_chunk_size = self
            .first_chunk_size
            .ok_or(KmdError::Internal("first chunk was never flushed"))?;
        self.done = true;
        Ok(CmdbufChain {
            first_chunk_id: self.first_chunk_id,
            resource_id: self.pool.resource_id,
            first_chunk_offset: self.pool.chunk_offset(self.first_chunk_id),
            first_chunk_size,
        })
    }

    /// Frees every chunk of the unsubmitted chain.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.done {
            self.done = true;
            self.pool.free_chunks(&self.chunks);
        }
    }
}

impl Drop for CmdbufBuilder<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RES_ID: u32 = 3;

    fn pool(chunk_size: u32, num_chunks: u32) -> CmdbufChunkPool {
        let mem = DeviceMemory::new(
            0x4000_0000,
            CmdbufChunkPool::required_bytes(chunk_size, num_chunks),
            1,
        );
        CmdbufChunkPool::new(mem, RES_ID, chunk_size, num_chunks).unwrap()
    }

    /// Sizes of every chunk in the chain as recorded by the chain's own links.
    fn walk(pool: &CmdbufChunkPool, chain: &CmdbufChain) -> Vec<u32> {
        let mut sizes = vec![chain.first_chunk_size];
        let mut offset = chain.first_chunk_offset;
        loop {
            let raw = pool.memory().read_vec(offset, LinkChunk::SIZE_BYTES).unwrap();
            let link = LinkChunk::decode_le(&raw).unwrap();
            if link.next_chunk_resource_id == RESOURCE_ID_INVALID {
                return sizes;
            }
            assert_eq!(link.next_chunk_resource_id, RES_ID);
            sizes.push(link.next_chunk_size);
            offset = link.next_chunk_offset;
        }
    }

    fn build(pool: &CmdbufChunkPool, cmds: &[usize]) -> CmdbufChain {
        let mut b = pool.builder().unwrap();
        for &size in cmds {
            b.reserve_cmd_space(size).unwrap().fill(0xAB);
        }
        b.finalize().unwrap()
    }

    #[test]
    fn single_chunk_chain_has_terminal_link() {
        let pool = pool(64, 4);
        let chain = build(&pool, &[8, 8]);
        assert_eq!(chain.first_chunk_size, 20 + 16);
        assert_eq!(walk(&pool, &chain), vec![36]);
        assert_eq!(pool.num_free(), 3);
    }

    #[test]
    fn overflow_links_and_patches_sizes() {
        let pool = pool(64, 4);
        // 20 + 40 fits; the next 8 spills into a second chunk.
        let chain = build(&pool, &[40, 8, 44]);
        assert_eq!(walk(&pool, &chain), vec![60, 28, 64]);
        assert_eq!(pool.num_free(), 1);
    }

    #[test]
    #[should_panic(expected = "cannot fit")]
    fn oversized_command_is_a_contract_violation() {
        let pool = pool(64, 2);
        let mut b = pool.builder().unwrap();
        let _ = b.reserve_cmd_space(45);
    }

    #[test]
    fn cancel_and_drop_return_every_chunk() {
        let pool = pool(64, 3);
        let mut b = pool.builder().unwrap();
        b.reserve_cmd_space(44).unwrap();
        b.reserve_cmd_space(44).unwrap();
        assert_eq!(pool.num_free(), 1);
        b.cancel();
        assert_eq!(pool.num_free(), 3);

        {
            let mut b = pool.builder().unwrap();
            b.push_cmd(&[1; 44]).unwrap();
            b.push_cmd(&[2; 44]).unwrap();
            b.push_cmd(&[3; 44]).unwrap();
            assert_eq!(b.reserve_cmd_space(44).unwrap_err(), KmdError::NoMem);
        }
        assert_eq!(pool.num_free(), 3);
    }

    #[test]
    fn exhausted_pool_reclaims_a_triggered_chain() {
        let pool = pool(64, 4);
        let a = build(&pool, &[44, 44]);
        let _b = build(&pool, &[44, 44]);
        assert_eq!(pool.alloc_cmdbuf_chunk(), Err(KmdError::NoMem));

        let fence = pool.get_free_notifier_fence(a.first_chunk_id);
        assert_eq!(fence.id, RES_ID);
        assert_eq!(fence.value, ChunkState::FenceTriggered as u32);
        pool.memory().write_u32(fence.offset, fence.value).unwrap();

        let x = pool.alloc_cmdbuf_chunk().unwrap();
        assert_eq!(pool.num_free(), 1);
        let y = pool.alloc_cmdbuf_chunk().unwrap();
        let mut got = [x, y];
        got.sort_unstable();
        assert_eq!(got, [0, 1]);
        assert_eq!(pool.memory().read_u32(fence.offset), Ok(0));
        assert_eq!(pool.alloc_cmdbuf_chunk(), Err(KmdError::NoMem));
    }

    fn expected_chunk_sizes(chunk_size: usize, cmds: &[usize]) -> Vec<u32> {
        let mut sizes = Vec::new();
        let mut used = LinkChunk::SIZE_BYTES;
        for &size in cmds {
            if used + size > chunk_size {
                sizes.push(used as u32);
                used = LinkChunk::SIZE_BYTES;
            }
            used += size;
        }
        sizes.push(used as u32);
        sizes
    }

    proptest! {
        #[test]
        fn chain_sizes_match_reserved_bytes(
            cmds in proptest::collection::vec((1usize..=11).prop_map(|w| w * 4), 1..40),
        ) {
            let pool = pool(64, 64);
            let chain = build(&pool, &cmds);
            let sizes = walk(&pool, &chain);
            prop_assert_eq!(&sizes, &expected_chunk_sizes(64, &cmds));
            let payload: u32 = sizes.iter().map(|s| s - LinkChunk::SIZE_BYTES as u32).sum();
            prop_assert_eq!(payload as usize, cmds.iter().sum::<usize>());
            pool.free_linked_cmdbuf_chunks(chain.first_chunk_id);
            prop_assert_eq!(pool.num_free(), 64);
        }
    }
}
