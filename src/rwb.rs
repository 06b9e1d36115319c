// SPDX-License-Identifier: MPL-2.0

//! The ring write buffer (RWB).
//!
//! Writes are absorbed into entries grouped into batches of exactly
//! `xfer_size` blocks sharing submission. A batch is always in exactly one
//! of four places: the free queue, the current slot being filled, the
//! submit ring, or in flight with the writer. Entry slots are stable, so a
//! cached L2P value can refer to an entry by its global position.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::VecDeque;

use crossbeam_queue::ArrayQueue;

use crate::{
    geom::{Lba, Ppa, BLOCK_SIZE, LBA_INVALID},
    io::IoFlags,
    prelude::*,
};

/// Admission class of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum EntryType {
    Internal = 0,
    User = 1,
}

pub(crate) const ENTRY_TYPE_COUNT: usize = 2;

impl EntryType {
    pub fn from_flags(flags: IoFlags) -> Self {
        if flags.contains(IoFlags::INTERNAL) {
            Self::Internal
        } else {
            Self::User
        }
    }
}

/// Entry state guarded by the per-entry lock.
pub(crate) struct EntryInner {
    pub lba: Lba,
    pub ppa: Ppa,
    pub flags: IoFlags,
    pub data: Box<[u8]>,
    pub md: Option<Box<[u8]>>,
}

pub(crate) struct Entry {
    /// Stable global index: `batch_index * xfer_size + slot`.
    pub pos: usize,
    inner: SpinLock<EntryInner>,
    /// Set once the entry has been assigned a device PPA, cleared when it
    /// stops being part of the cache.
    valid: AtomicBool,
}

impl Entry {
    fn new(pos: usize, md_size: usize) -> Self {
        Self {
            pos,
            inner: SpinLock::new(EntryInner {
                lba: LBA_INVALID,
                ppa: Ppa::invalid(),
                flags: IoFlags::empty(),
                data: vec![0; BLOCK_SIZE].into_boxed_slice(),
                md: (md_size > 0).then(|| vec![0; md_size].into_boxed_slice()),
            }),
            valid: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, EntryInner> {
        self.inner.lock()
    }

    pub fn set_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

pub(crate) type BatchId = usize;

pub(crate) struct Batch {
    pub pos: BatchId,
    num_acquired: AtomicUsize,
    num_ready: AtomicUsize,
    entries: Box<[Entry]>,
}

impl Batch {
    /// Entries in submission (slot) order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn entry(&self, slot: usize) -> &Entry {
        &self.entries[slot]
    }

    pub fn is_empty(&self) -> bool {
        self.num_ready.load(Ordering::Acquire) == 0
    }
}

struct Alloc {
    /// Batch currently being filled.
    current: Option<BatchId>,
    free: VecDeque<BatchId>,
}

pub(crate) struct Rwb {
    xfer_size: usize,
    num_batches: usize,
    batches: Box<[Batch]>,
    alloc: SpinLock<Alloc>,
    submit: ArrayQueue<BatchId>,
    num_acquired: [AtomicUsize; ENTRY_TYPE_COUNT],
    limits: [AtomicUsize; ENTRY_TYPE_COUNT],
}

impl Rwb {
    pub fn new(rwb_size: usize, xfer_size: usize, md_size: usize) -> Result<Self> {
        if rwb_size % (BLOCK_SIZE * xfer_size) != 0 {
            bail!(InvalidArgs, "rwb size not a multiple of the batch size");
        }
        let num_batches = rwb_size / (BLOCK_SIZE * xfer_size);
        if num_batches == 0 {
            bail!(InvalidArgs, "rwb must hold at least one batch");
        }

        let batches: Vec<Batch> = (0..num_batches)
            .map(|pos| Batch {
                pos,
                num_acquired: AtomicUsize::new(0),
                num_ready: AtomicUsize::new(0),
                entries: (0..xfer_size)
                    .map(|slot| Entry::new(pos * xfer_size + slot, md_size))
                    .collect(),
            })
            .collect();

        let entry_cnt = num_batches * xfer_size;
        Ok(Self {
            xfer_size,
            num_batches,
            batches: batches.into_boxed_slice(),
            alloc: SpinLock::new(Alloc {
                current: None,
                free: (0..num_batches).collect(),
            }),
            submit: ArrayQueue::new(num_batches.next_power_of_two()),
            num_acquired: [AtomicUsize::new(0), AtomicUsize::new(0)],
            limits: [AtomicUsize::new(entry_cnt), AtomicUsize::new(entry_cnt)],
        })
    }

    pub fn entry_cnt(&self) -> usize {
        self.num_batches * self.xfer_size
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn batch(&self, id: BatchId) -> &Batch {
        &self.batches[id]
    }

    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.batches.iter()
    }

    pub fn num_acquired(&self, ty: EntryType) -> usize {
        self.num_acquired[ty as usize].load(Ordering::Acquire)
    }

    pub fn set_limits(&self, limits: [usize; ENTRY_TYPE_COUNT]) {
        debug_assert!(limits.iter().all(|&limit| limit <= self.entry_cnt()));
        for (slot, limit) in self.limits.iter().zip(limits) {
            slot.store(limit, Ordering::Release);
        }
    }

    pub fn get_limits(&self) -> [usize; ENTRY_TYPE_COUNT] {
        [
            self.limits[0].load(Ordering::Acquire),
            self.limits[1].load(Ordering::Acquire),
        ]
    }

    fn check_limits(&self, ty: EntryType) -> bool {
        self.num_acquired(ty) >= self.limits[ty as usize].load(Ordering::Acquire)
    }

    /// Take the next entry slot of the batch being filled, pulling a fresh
    /// batch from the free queue when needed. Returns `None` when the
    /// admission limit for `ty` is reached or no batch is free.
    pub fn acquire(&self, ty: EntryType) -> Option<&Entry> {
        if self.check_limits(ty) {
            return None;
        }

        let mut alloc = self.alloc.lock();

        let current = match alloc.current {
            Some(current) => current,
            None => {
                let current = alloc.free.pop_front()?;
                alloc.current = Some(current);
                current
            }
        };

        let batch = &self.batches[current];
        let slot = batch.num_acquired.fetch_add(1, Ordering::AcqRel);

        // Once the whole batch is handed out, the next acquire pulls a new
        // batch.
        if slot + 1 >= self.xfer_size {
            alloc.current = None;
        }
        drop(alloc);

        self.num_acquired[ty as usize].fetch_add(1, Ordering::AcqRel);
        Some(batch.entry(slot))
    }

    /// Mark an acquired entry ready for submission. The batch is pushed
    /// onto the submit ring once all of its entries are ready.
    pub fn push(&self, entry: &Entry) {
        let batch = &self.batches[entry.pos / self.xfer_size];
        let ready = batch.num_ready.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(ready <= self.xfer_size);

        if ready == self.xfer_size {
            self.submit
                .push(batch.pos)
                .expect("rwb submit ring can hold every batch");
        }
    }

    /// Dequeue one full batch, if any.
    pub fn pop(&self) -> Option<BatchId> {
        self.submit.pop()
    }

    /// Put a completed batch back on the free queue.
    pub fn batch_release(&self, id: BatchId) {
        let batch = &self.batches[id];
        batch.num_ready.store(0, Ordering::Release);
        batch.num_acquired.store(0, Ordering::Release);

        for entry in batch.entries() {
            let ty = EntryType::from_flags(entry.lock().flags);
            let prev = self.num_acquired[ty as usize].fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0);
        }

        self.alloc.lock().free.push_back(id);
    }

    /// Re-enqueue a popped batch for resubmission after a write failure.
    pub fn batch_revert(&self, id: BatchId) {
        self.submit
            .push(id)
            .expect("rwb submit ring can hold every batch");
    }

    /// Resolve a cached L2P offset back to its entry.
    pub fn entry_from_offset(&self, offset: usize) -> &Entry {
        let batch = offset / self.xfer_size;
        let slot = offset % self.xfer_size;
        debug_assert!(batch < self.num_batches);
        self.batches[batch].entry(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rwb() -> Rwb {
        // 4 batches of 4 entries.
        Rwb::new(BLOCK_SIZE * 16, 4, 0).unwrap()
    }

    #[test]
    fn geometry_of_the_ring() {
        let rwb = rwb();
        assert_eq!(rwb.num_batches(), 4);
        assert_eq!(rwb.entry_cnt(), 16);
        assert_eq!(rwb.entry_from_offset(9).pos, 9);
    }

    #[test]
    fn acquire_fills_batches_in_slot_order() {
        let rwb = rwb();

        for expected in 0..8 {
            let entry = rwb.acquire(EntryType::User).unwrap();
            assert_eq!(entry.pos, expected);
        }
        assert_eq!(rwb.num_acquired(EntryType::User), 8);
        assert_eq!(rwb.num_acquired(EntryType::Internal), 0);
    }

    #[test]
    fn full_batch_reaches_submit_ring() {
        let rwb = rwb();

        assert!(rwb.pop().is_none());
        for _ in 0..4 {
            let entry = rwb.acquire(EntryType::User).unwrap();
            rwb.push(entry);
        }
        let batch = rwb.pop().expect("batch must be submittable");
        assert_eq!(batch, 0);
        assert!(rwb.pop().is_none());

        rwb.batch_release(batch);
        assert_eq!(rwb.num_acquired(EntryType::User), 0);

        // The released batch is reusable.
        for _ in 0..13 {
            rwb.acquire(EntryType::User).unwrap();
        }
    }

    #[test]
    fn typed_limits_gate_admission() {
        let rwb = rwb();
        rwb.set_limits([rwb.entry_cnt(), 6]);

        for _ in 0..6 {
            assert!(rwb.acquire(EntryType::User).is_some());
        }
        assert!(rwb.acquire(EntryType::User).is_none());
        // Internal writes are never throttled by the user limit.
        assert!(rwb.acquire(EntryType::Internal).is_some());

        rwb.set_limits([rwb.entry_cnt(), 0]);
        assert!(rwb.acquire(EntryType::User).is_none());
    }

    #[test]
    fn revert_requeues_the_batch() {
        let rwb = rwb();
        for _ in 0..4 {
            let entry = rwb.acquire(EntryType::Internal).unwrap();
            rwb.push(entry);
        }
        let batch = rwb.pop().unwrap();
        rwb.batch_revert(batch);
        assert_eq!(rwb.pop(), Some(batch));
    }

    #[test]
    fn exhaustion_returns_none() {
        let rwb = rwb();
        for _ in 0..16 {
            assert!(rwb.acquire(EntryType::User).is_some());
        }
        // All batches acquired and none released.
        assert!(rwb.acquire(EntryType::User).is_none());
    }
}
