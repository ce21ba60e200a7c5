//! Fixed-capacity slot allocator.
//!
//! Free slots form a singly linked list threaded through the slot storage itself, with a
//! `next_free_slot` watermark for slots that were never handed out. Every operation is O(1).
//! IDs are slot indices offset by `base_id`.
//!
//! The allocator does no locking of its own; owners wrap it in their mutex and `get` is only
//! meaningful while that lock is held.

use tracing::{error, warn};

use crate::error::{KmdError, Result};

#[derive(Debug)]
enum Slot<T> {
    Free { next: Option<u32> },
    Used(T),
}

#[derive(Debug)]
pub struct BlockAllocator<T> {
    base_id: u32,
    max_blocks: u32,
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    num_allocated: u32,
}

impl<T> BlockAllocator<T> {
    pub fn new(base_id: u32, max_blocks: u32) -> Self {
        debug_assert!(base_id.checked_add(max_blocks).is_some());
        Self {
            base_id,
            max_blocks,
            slots: Vec::with_capacity(max_blocks as usize),
            free_head: None,
            num_allocated: 0,
        }
    }

    pub fn base_id(&self) -> u32 {
        self.base_id
    }

    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    pub fn num_allocated(&self) -> u32 {
        self.num_allocated
    }

    pub fn is_full(&self) -> bool {
        self.num_allocated == self.max_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.num_allocated == 0
    }

    /// Index of the first never-used slot.
    pub fn next_free_slot(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn alloc(&mut self, value: T) -> Result<u32> {
        let idx = if let Some(idx) = self.free_head {
            let slot = &mut self.slots[idx as usize];
            let Slot::Free { next } = *slot else {
                debug_assert!(false, "free list points at a used slot");
                return Err(KmdError::Internal("block allocator free list corrupted"));
            };
            self.free_head = next;
            *slot = Slot::Used(value);
            idx
        } else if self.slots.len() < self.max_blocks as usize {
            self.slots.push(Slot::Used(value));
            self.slots.len() as u32 - 1
        } else {
            return Err(KmdError::NoMem);
        };
        self.num_allocated += 1;
        Ok(self.base_id + idx)
    }

    fn index(&self, id: u32) -> Option<usize> {
        let idx = id.checked_sub(self.base_id)? as usize;
        (idx < self.slots.len()).then_some(idx)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        match &self.slots[self.index(id)?] {
            Slot::Used(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let idx = self.index(id)?;
        match &mut self.slots[idx] {
            Slot::Used(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Returns the slot to the free list and hands back its contents.
    ///
    /// Freeing an ID that is not allocated is a caller bug; it is logged and ignored.
    pub fn free(&mut self, id: u32) -> Option<T> {
        let Some(idx) = self.index(id) else {
            error!(id, base_id = self.base_id, "free of out-of-range block id");
            return None;
        };
        let slot = std::mem::replace(
            &mut self.slots[idx],
            Slot::Free {
                next: self.free_head,
            },
        );
        match slot {
            Slot::Used(value) => {
                self.free_head = Some(idx as u32);
                self.num_allocated -= 1;
                Some(value)
            }
            free @ Slot::Free { .. } => {
                self.slots[idx] = free;
                error!(id, "double free of block id");
                None
            }
        }
    }

    /// Live `(id, value)` pairs in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(idx, slot)| match slot {
                Slot::Used(value) => Some((self.base_id + idx as u32, value)),
                Slot::Free { .. } => None,
            })
    }

    pub fn ids(&self) -> Vec<u32> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl<T: Default> BlockAllocator<T> {
    pub fn zalloc(&mut self) -> Result<u32> {
        self.alloc(T::default())
    }
}

impl<T> Drop for BlockAllocator<T> {
    fn drop(&mut self) {
        if self.num_allocated != 0 {
            warn!(
                live = self.num_allocated,
                base_id = self.base_id,
                "block allocator dropped with live blocks"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn ids_start_at_base_and_fail_when_full() {
        let mut alloc = BlockAllocator::<u8>::new(1, 3);
        assert_eq!(alloc.alloc(10).unwrap(), 1);
        assert_eq!(alloc.alloc(20).unwrap(), 2);
        assert_eq!(alloc.alloc(30).unwrap(), 3);
        assert!(alloc.is_full());
        assert_eq!(alloc.alloc(40), Err(KmdError::NoMem));
        assert_eq!(alloc.get(2), Some(&20));
        assert_eq!(alloc.get(0), None);
        assert_eq!(alloc.get(4), None);
        for id in [1, 2, 3] {
            alloc.free(id);
        }
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let mut alloc = BlockAllocator::<()>::new(0, 4);
        let a = alloc.zalloc().unwrap();
        let b = alloc.zalloc().unwrap();
        let _c = alloc.zalloc().unwrap();
        alloc.free(b);
        assert_eq!(alloc.zalloc().unwrap(), b);
        alloc.free(a);
        assert_eq!(alloc.zalloc().unwrap(), a);
        assert_eq!(alloc.next_free_slot(), 3);
        for id in alloc.ids() {
            alloc.free(id);
        }
    }

    #[test]
    fn double_free_is_rejected_without_corrupting_the_list() {
        let mut alloc = BlockAllocator::<u32>::new(5, 2);
        let a = alloc.alloc(1).unwrap();
        assert_eq!(alloc.free(a), Some(1));
        assert_eq!(alloc.free(a), None);
        assert_eq!(alloc.num_allocated(), 0);
        let x = alloc.alloc(2).unwrap();
        let y = alloc.alloc(3).unwrap();
        assert_ne!(x, y);
        assert_eq!(alloc.alloc(4), Err(KmdError::NoMem));
        alloc.free(x);
        alloc.free(y);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Alloc), any::<usize>().prop_map(Op::Free)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn live_ids_stay_unique_and_bounded(
            base_id in 0u32..16,
            max_blocks in 1u32..24,
            ops in proptest::collection::vec(op(), 0..200),
        ) {
            let mut alloc = BlockAllocator::<u32>::new(base_id, max_blocks);
            let mut live: Vec<u32> = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc => match alloc.alloc(7) {
                        Ok(id) => {
                            prop_assert!(live.len() < max_blocks as usize);
                            prop_assert!(!live.contains(&id));
                            prop_assert!(id >= base_id && id < base_id + max_blocks);
                            live.push(id);
                        }
                        Err(err) => {
                            prop_assert_eq!(err, KmdError::NoMem);
                            prop_assert_eq!(live.len(), max_blocks as usize);
                        }
                    },
                    Op::Free(pick) => {
                        if !live.is_empty() {
                            let id = live.swap_remove(pick % live.len());
                            prop_assert_eq!(alloc.free(id), Some(7));
                        }
                    }
                }
                prop_assert_eq!(alloc.num_allocated() as usize, live.len());
                let unique: HashSet<u32> = alloc.ids().into_iter().collect();
                prop_assert_eq!(unique.len(), live.len());
            }
            for id in live {
                alloc.free(id);
            }
        }
    }
}
