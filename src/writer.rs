// SPDX-License-Identifier: MPL-2.0

//! The core write pipeline.
//!
//! User writes are absorbed into the ring write buffer on the calling
//! thread; everything downstream of the submit ring runs exclusively on
//! the core thread: the write pointers striping batches across the active
//! band, band open/close metadata writes, erase scheduling, flushes,
//! relocation ticks and completion dispatch.

use core::sync::atomic::Ordering;
use std::collections::VecDeque;

use crate::{
    band::{BandId, BandState},
    dev::Dev,
    geom::{Lba, Ppa, BLOCK_SIZE, LBA_INVALID},
    io::{FlushCb, Io, IoFlags, ReadIo},
    media::MediaResult,
    prelude::*,
    reloc::Reloc,
    rwb::{BatchId, Entry, EntryType},
    util::{BitMap, Buf},
};

/// Work items crossing onto the core thread.
pub(crate) type CoreMsg = Box<dyn FnOnce(&mut CoreCtx) + Send>;

/// Work items crossing onto the read thread.
pub(crate) enum ReadMsg {
    User(ReadIo),
}

/// Deferred completion of a media command submitted by the core thread.
pub(crate) enum CoreCpl {
    Batch {
        batch: BatchId,
        band: BandId,
        status: MediaResult,
    },
    Md {
        band: BandId,
        status: MediaResult,
    },
    Erase {
        band: BandId,
        ppa: Ppa,
        status: MediaResult,
    },
}

/// Per-active-band stripe cursor.
pub(crate) struct Wptr {
    pub band: BandId,
    /// Current device PPA.
    pub ppa: Ppa,
    /// Slot of the chunk currently written.
    pub chunk: usize,
    /// Logical offset within the band.
    pub offset: usize,
    /// Scratch for head/tail metadata writes.
    md_buf: Buf,
}

/// An outstanding flush: completes once every batch that was non-empty at
/// post time has hit the media.
pub(crate) struct Flush {
    bmap: BitMap,
    num_req: usize,
    cb: Option<FlushCb>,
}

/// Core-thread-private device state.
pub(crate) struct CoreCtx {
    pub dev: Arc<Dev>,
    pub wptrs: Vec<Wptr>,
    pub flushes: Vec<Flush>,
    /// Band pre-erased for the next write pointer.
    pub next_band: Option<BandId>,
    pub reloc: Reloc,
    cpls: VecDeque<CoreCpl>,
}

impl CoreCtx {
    pub fn new(dev: Arc<Dev>) -> Result<Self> {
        let reloc = Reloc::new(&dev)?;
        Ok(Self {
            dev,
            wptrs: Vec::new(),
            flushes: Vec::new(),
            next_band: None,
            reloc,
            cpls: VecDeque::new(),
        })
    }

    /// One core-loop iteration: messages, completions, the write pipeline
    /// and a relocation pass.
    pub fn tick(&mut self) {
        let dev = self.dev.clone();

        while let Some(msg) = dev.core_thread.recv() {
            msg(self);
        }
        if !dev.read_isolation {
            while let Some(ReadMsg::User(io)) = dev.read_thread.recv() {
                crate::reader::process_read(&dev, io);
            }
        }

        self.drain_completions();
        self.process_writes();
        self.reloc.tick(&dev);
    }

    /// All pipeline work has drained and no write pointer remains.
    pub fn shutdown_complete(&self) -> bool {
        self.dev.num_inflight.load(Ordering::Acquire) == 0
            && self.wptrs.is_empty()
            && self.cpls.is_empty()
    }

    fn drain_completions(&mut self) {
        while let Some(cpl) = self.cpls.pop_front() {
            let dev = self.dev.clone();
            dev.num_inflight.fetch_sub(1, Ordering::AcqRel);

            match cpl {
                CoreCpl::Batch {
                    batch,
                    band,
                    status,
                } => {
                    match status {
                        Ok(()) => self.write_cb(batch, band),
                        Err(err) => self.write_fail(batch, band, err),
                    }
                    dev.bands[band].release_md(&dev);
                }
                CoreCpl::Md { band, status } => {
                    self.md_write_cb(band, status);
                    dev.bands[band].release_md(&dev);
                }
                CoreCpl::Erase { band, ppa, status } => self.erase_cb(band, ppa, status),
            }
        }
    }

    // ===== Write pointer lifecycle =====

    fn wptr_idx(&self, band: BandId) -> Option<usize> {
        self.wptrs.iter().position(|wptr| wptr.band == band)
    }

    fn add_wptr(&mut self) -> Result<()> {
        let dev = self.dev.clone();

        let band = match self.next_band.take() {
            Some(band) => {
                debug_assert!(dev.bands[band].check_state(BandState::Prep));
                band
            }
            None => match self.next_write_band() {
                Some(band) => band,
                None => bail!(OutOfSpace),
            },
        };

        let Some(chunk) = dev.bands[band].chunks.lock().first() else {
            bail!(OutOfSpace);
        };
        let start_ppa = dev.bands[band].chunks.lock().slots[chunk].start_ppa;

        let md_buf = Buf::alloc(dev.layout.tail_md_num_lbks())?;
        dev.bands[band].write_prep(&dev)?;

        debug!("wptr: band {}", band);
        self.wptrs.push(Wptr {
            band,
            ppa: start_ppa,
            chunk,
            offset: 0,
            md_buf,
        });
        Ok(())
    }

    /// Pick the least-worn free band and start erasing it.
    fn next_write_band(&mut self) -> Option<BandId> {
        let dev = self.dev.clone();
        let band = {
            let free = dev.free_bands.lock();
            free.iter()
                .copied()
                .find(|&id| dev.bands[id].check_state(BandState::Free))?
        };

        self.band_erase(band);
        Some(band)
    }

    /// Transition the band to PREP and issue a reset for every non-free
    /// chunk.
    pub(crate) fn band_erase(&mut self, band_id: BandId) {
        let dev = self.dev.clone();
        let band = &dev.bands[band_id];
        debug_assert!(matches!(
            band.state(),
            BandState::Closed | BandState::Free
        ));

        band.set_state(&dev, BandState::Prep);

        let targets: Vec<Ppa> = {
            let chunks = band.chunks.lock();
            chunks
                .slots
                .iter()
                .filter(|chunk| !chunk.is_bad() && chunk.state != crate::band::ChunkState::Free)
                .map(|chunk| chunk.start_ppa)
                .collect()
        };

        for ppa in targets {
            let status = dev
                .ctrlr
                .vector_reset(dev.core_qpair, &[dev.fmt.pack(ppa)]);
            dev.num_inflight.fetch_add(1, Ordering::AcqRel);
            self.cpls.push_back(CoreCpl::Erase {
                band: band_id,
                ppa,
                status,
            });
        }
    }

    fn erase_cb(&mut self, band_id: BandId, ppa: Ppa, status: MediaResult) {
        let dev = self.dev.clone();
        let band = &dev.bands[band_id];
        let slot = dev.flatten_punit(ppa);

        let mut chunks = band.chunks.lock();
        match status {
            Ok(()) => chunks.slots[slot].state = crate::band::ChunkState::Free,
            Err(err) => {
                error!("erase failed at {:?}, status: {:?}", ppa, err);
                chunks.slots[slot].state = crate::band::ChunkState::Bad;
                chunks.remove(slot);
            }
        }
    }

    fn wptr_advance(&mut self, idx: usize, num_lbks: usize) {
        let dev = self.dev.clone();
        let band_id = self.wptrs[idx].band;
        let band = &dev.bands[band_id];

        self.wptrs[idx].offset += num_lbks;
        let next_thld = band.num_usable_lbks(&dev) * dev.conf.band_thld / 100;

        if band.is_full(&dev, self.wptrs[idx].offset) {
            band.set_state(&dev, BandState::Full);
        }

        let ppa = band.next_xfer_ppa(&dev, self.wptrs[idx].ppa, num_lbks);
        debug_assert!(!ppa.is_invalid());
        let chunk = band
            .chunks
            .lock()
            .next_operational(self.wptrs[idx].chunk)
            .expect("band must keep at least one chunk");

        let wptr = &mut self.wptrs[idx];
        wptr.ppa = ppa;
        wptr.chunk = chunk;
        trace!(
            "wptr: grp:{} pu:{} chunk:{} lbk:{}",
            ppa.grp(),
            ppa.pu(),
            ppa.chk(),
            ppa.lbk()
        );

        if self.wptrs[idx].offset >= next_thld && self.next_band.is_none() {
            self.next_band = self.next_write_band();
        }
    }

    /// Write the head metadata; the band moves to OPENING until the write
    /// completes.
    fn wptr_open_band(&mut self, idx: usize) {
        let dev = self.dev.clone();
        let band_id = self.wptrs[idx].band;
        let band = &dev.bands[band_id];

        debug_assert!(band.chunks.lock().is_first(self.wptrs[idx].chunk));
        debug_assert_eq!(band.md.lock().num_vld, 0);

        band.clear_md();

        debug_assert!(band.check_state(BandState::Prep));
        band.set_state(&dev, BandState::Opening);

        let lbk_cnt = dev.layout.head_md_num_lbks();
        {
            let wptr = &mut self.wptrs[idx];
            band.pack_head_md(&dev, &mut wptr.md_buf);
        }
        self.submit_md(idx, lbk_cnt);
    }

    /// Write the tail metadata; the band moves to CLOSING until the write
    /// completes.
    fn wptr_close_band(&mut self, idx: usize) {
        let dev = self.dev.clone();
        let band_id = self.wptrs[idx].band;
        let band = &dev.bands[band_id];

        band.set_state(&dev, BandState::Closing);
        band.set_tail_md_ppa(self.wptrs[idx].ppa);

        let lbk_cnt = dev.layout.tail_md_num_lbks();
        {
            let wptr = &mut self.wptrs[idx];
            band.pack_tail_md(&dev, &mut wptr.md_buf);
        }
        self.submit_md(idx, lbk_cnt);
    }

    /// Submit a metadata region through the write pointer, one transfer
    /// unit at a time.
    fn submit_md(&mut self, idx: usize, lbk_cnt: usize) {
        let dev = self.dev.clone();
        let band_id = self.wptrs[idx].band;
        debug_assert_eq!(lbk_cnt % dev.xfer_size, 0);

        let mut status: MediaResult = Ok(());
        let mut off = 0;
        while off < lbk_cnt {
            let iov_status = {
                let wptr = &self.wptrs[idx];
                let slice =
                    &wptr.md_buf[off * BLOCK_SIZE..(off + dev.xfer_size) * BLOCK_SIZE];
                dev.ctrlr
                    .write(dev.core_qpair, dev.fmt.pack(wptr.ppa), &[slice], None)
            };
            if status.is_ok() {
                status = iov_status;
            }

            self.wptr_advance(idx, dev.xfer_size);
            off += dev.xfer_size;
        }

        dev.num_inflight.fetch_add(1, Ordering::AcqRel);
        dev.bands[band_id].acquire_md();
        self.cpls.push_back(CoreCpl::Md {
            band: band_id,
            status,
        });
    }

    fn md_write_cb(&mut self, band_id: BandId, status: MediaResult) {
        let dev = self.dev.clone();

        if let Err(err) = status {
            let ppa = self
                .wptr_idx(band_id)
                .map(|idx| self.wptrs[idx].ppa)
                .unwrap_or_else(Ppa::invalid);
            error!("metadata write failed at {:?}, status: {:?}", ppa, err);
            self.halt_writes(band_id);
            return;
        }

        dev.bands[band_id].set_next_state(&dev);
        if dev.bands[band_id].check_state(BandState::Closed) {
            if let Some(idx) = self.wptr_idx(band_id) {
                self.wptrs.remove(idx);
            }
        }
    }

    /// The band can take a data batch only when it is OPEN, the current
    /// chunk is writable and no metadata write is in flight. Transitions
    /// are serviced here otherwise.
    fn wptr_ready(&mut self, idx: usize) -> bool {
        let dev = self.dev.clone();
        let band_id = self.wptrs[idx].band;
        let band = &dev.bands[band_id];

        let (writable, bad) = {
            let chunks = band.chunks.lock();
            let chunk = &chunks.slots[self.wptrs[idx].chunk];
            (chunk.is_writable(), chunk.is_bad())
        };

        if !writable {
            // Erasing a band may fail after it was assigned to a write
            // pointer; skip the chunk that went bad.
            if bad {
                self.wptr_advance(idx, dev.xfer_size);
            }
            return false;
        }

        // If we're in the process of writing metadata, wait till it is
        // completed.
        if band.state_changing() {
            return false;
        }

        if band.check_state(BandState::Full) {
            self.wptr_close_band(idx);
            return false;
        }

        if !band.check_state(BandState::Open) {
            self.wptr_open_band(idx);
            return false;
        }

        true
    }

    // ===== The write pipeline =====

    fn process_writes(&mut self) {
        let bands: Vec<BandId> = self.wptrs.iter().map(|wptr| wptr.band).collect();
        for band in bands {
            if let Some(idx) = self.wptr_idx(band) {
                self.wptr_process_writes(idx);
            }
        }

        let num_active = self
            .wptrs
            .iter()
            .filter(|wptr| {
                !matches!(
                    self.dev.bands[wptr.band].state(),
                    BandState::Full | BandState::Closing | BandState::Closed
                )
            })
            .count();

        if num_active < 1 {
            let _ = self.add_wptr();
        }
    }

    fn wptr_process_writes(&mut self, idx: usize) {
        let dev = self.dev.clone();

        // Make sure the band is prepared for writing.
        if !self.wptr_ready(idx) {
            return;
        }

        if !dev.core_thread.is_running() {
            self.process_shutdown();
        }

        let Some(batch) = dev.rwb.pop() else {
            // If there are queued flush requests we need to pad the RWB to
            // force out the remaining entries.
            if !self.flushes.is_empty() {
                self.flush_pad_batch();
            }
            return;
        };

        self.submit_batch(idx, batch);
    }

    /// Assign device PPAs to a popped batch, account it in the band and
    /// submit it as a single vectored write.
    fn submit_batch(&mut self, idx: usize, batch_id: BatchId) {
        let dev = self.dev.clone();
        let band_id = self.wptrs[idx].band;
        let band = &dev.bands[band_id];
        let batch = dev.rwb.batch(batch_id);

        let mut ppa = self.wptrs[idx].ppa;
        for entry in batch.entries() {
            let (lba, internal) = {
                let mut inner = entry.lock();
                inner.ppa = ppa;
                (inner.lba, inner.flags.contains(IoFlags::INTERNAL))
            };

            // Setting the entry's valid bit needs to be done after the
            // metadata within the band is updated, to make sure that
            // writes invalidating the entry clear the metadata as well.
            band.set_addr(&dev, lba, ppa);
            entry.set_valid();

            if !internal {
                dev.stats.write_user.fetch_add(1, Ordering::Relaxed);
            }
            dev.stats.write_total.fetch_add(1, Ordering::Relaxed);

            ppa = band.next_ppa(&dev, ppa, 1);
        }

        let status = {
            let guards: Vec<_> = batch.entries().map(|entry| entry.lock()).collect();
            let bufs: Vec<&[u8]> = guards.iter().map(|inner| &inner.data[..]).collect();
            let md: Option<Vec<u8>> = (dev.md_size > 0).then(|| {
                guards
                    .iter()
                    .flat_map(|inner| inner.md.as_deref().unwrap().iter().copied())
                    .collect()
            });
            dev.ctrlr.write(
                dev.core_qpair,
                dev.fmt.pack(self.wptrs[idx].ppa),
                &bufs,
                md.as_deref(),
            )
        };

        dev.num_inflight.fetch_add(1, Ordering::AcqRel);
        band.acquire_md();
        self.cpls.push_back(CoreCpl::Batch {
            batch: batch_id,
            band: band_id,
            status,
        });

        self.wptr_advance(idx, dev.xfer_size);
    }

    /// Commit a completed batch: cached L2P entries become on-disk PPAs
    /// and the entries stop being part of the cache.
    fn write_cb(&mut self, batch_id: BatchId, _band: BandId) {
        let dev = self.dev.clone();
        let batch = dev.rwb.batch(batch_id);

        for entry in batch.entries() {
            let inner = entry.lock();
            let (lba, ppa) = (inner.lba, inner.ppa);

            if lba == LBA_INVALID {
                // Padding carries no data.
                debug_assert!(inner.flags.contains(IoFlags::PAD));
                entry.invalidate();
                continue;
            }

            let cur = dev.l2p.get(lba);
            if cur.is_cached() && cur.cache_offset() as usize == entry.pos {
                dev.l2p.set(lba, ppa);
            } else {
                // Someone has already overwritten this LBA; our copy is
                // dead on arrival.
                dev.invalidate_addr(ppa);
            }
            entry.invalidate();
            drop(inner);
        }

        self.process_flush(batch_id);
        dev.rwb.batch_release(batch_id);
    }

    /// A data write failed: the band is finished, its valid entries go
    /// back through the submit ring onto a fresh band.
    fn write_fail(&mut self, batch_id: BatchId, band_id: BandId, err: crate::media::MediaError) {
        let dev = self.dev.clone();
        let first_ppa = dev.rwb.batch(batch_id).entry(0).lock().ppa;
        error!("write failed at {:?}, status: {:?}", first_ppa, err);

        self.halt_writes(band_id);

        for entry in dev.rwb.batch(batch_id).entries() {
            let ppa = entry.lock().ppa;
            if !ppa.is_invalid() {
                // Undo the accounting done when the batch was submitted.
                dev.invalidate_addr(ppa);
            }
        }

        dev.rwb.batch_revert(batch_id);
    }

    /// Stop writing to a band after a failure: mark it for priority
    /// relocation and drop its write pointer.
    fn halt_writes(&mut self, band_id: BandId) {
        let dev = self.dev.clone();
        let band = &dev.bands[band_id];

        // If the band already has the high_prio flag set, other writes
        // must have failed earlier, so it's already taken care of.
        if band.high_prio.load(Ordering::Acquire) {
            debug_assert!(self.wptr_idx(band_id).is_none());
            return;
        }

        band.high_prio.store(true, Ordering::Release);
        band.set_tail_md_ppa(Ppa::invalid());
        self.reloc.add(&dev, band_id, 0, dev.num_band_lbks(), true);
        band.set_state(&dev, BandState::Closed);

        if let Some(idx) = self.wptr_idx(band_id) {
            self.wptrs.remove(idx);
        }
    }

    // ===== Flush =====

    /// Attach a flush to every batch currently holding data.
    pub(crate) fn flush(&mut self, cb: FlushCb) {
        let dev = self.dev.clone();
        let mut flush = Flush {
            bmap: BitMap::new(dev.rwb.num_batches()),
            num_req: 0,
            cb: Some(cb),
        };

        for batch in dev.rwb.batches() {
            if !batch.is_empty() {
                flush.bmap.set_bit(batch.pos);
                flush.num_req += 1;
            }
        }

        if flush.num_req == 0 {
            // The RWB was already empty.
            (flush.cb.take().unwrap())(Ok(()));
            return;
        }

        self.flushes.push(flush);
    }

    fn process_flush(&mut self, batch_id: BatchId) {
        let mut completed = Vec::new();
        for (i, flush) in self.flushes.iter_mut().enumerate() {
            if flush.bmap.test_bit(batch_id) {
                flush.bmap.clear_bit(batch_id);
                flush.num_req -= 1;
                if flush.num_req == 0 {
                    completed.push(i);
                }
            }
        }

        for i in completed.into_iter().rev() {
            let mut flush = self.flushes.remove(i);
            (flush.cb.take().unwrap())(Ok(()));
        }
    }

    /// Force a partially filled batch out by padding it to the transfer
    /// size.
    fn flush_pad_batch(&mut self) {
        let dev = self.dev.clone();
        let size = dev.rwb.num_acquired(EntryType::Internal) + dev.rwb.num_acquired(EntryType::User);

        // There must be something in the RWB, otherwise the flush
        // wouldn't be waiting for anything.
        debug_assert!(size > 0);

        // Only pad when there's less than a transfer size worth of
        // entries in the buffer; otherwise a batch will fill on its own.
        if size < dev.xfer_size {
            dev.rwb_pad(dev.xfer_size - (size % dev.xfer_size));
        }
    }

    // ===== Shutdown =====

    fn remove_free_bands(&mut self) {
        self.dev.free_bands.lock().clear();
        self.next_band = None;
    }

    /// Once nothing more can drain naturally, stop handing out bands and
    /// pad the current one to the end.
    fn process_shutdown(&mut self) {
        let dev = self.dev.clone();
        let size = dev.rwb.num_acquired(EntryType::Internal) + dev.rwb.num_acquired(EntryType::User);

        if size >= dev.xfer_size {
            return;
        }

        self.remove_free_bands();
        dev.rwb_pad(dev.xfer_size - size);
    }
}

/// The core thread: runs the write pipeline until told to stop and the
/// pipeline has fully drained.
pub(crate) fn core_loop(mut ctx: CoreCtx) {
    let dev = ctx.dev.clone();
    dev.core_thread.set_initialized();

    loop {
        ctx.tick();
        if !dev.core_thread.is_running() && ctx.shutdown_complete() {
            break;
        }
        std::thread::yield_now();
    }
}

/// The dedicated read thread, used when read isolation is configured.
pub(crate) fn read_loop(dev: Arc<Dev>) {
    dev.read_thread.set_initialized();

    while dev.read_thread.is_running() {
        while let Some(ReadMsg::User(io)) = dev.read_thread.recv() {
            crate::reader::process_read(&dev, io);
        }
        std::thread::yield_now();
    }
}

// Fill-side operations; these run on whatever thread submits the write.
impl Dev {
    /// Returns true when the entry is no longer what the L2P points at;
    /// its on-media address is invalidated along the way.
    fn update_md_entry(&self, lba: Lba, ppa: Ppa, pos: usize) -> bool {
        // If the LBA is invalid don't bother checking the md and l2p.
        if lba == LBA_INVALID {
            return true;
        }

        let cur = self.l2p.get(lba);
        if !(cur.is_cached() && cur.cache_offset() as usize == pos) {
            if !ppa.is_invalid() {
                self.invalidate_addr(ppa);
            }
            return true;
        }

        false
    }

    /// Remove an entry's previous cache role before handing it out again.
    fn evict_cache_entry(&self, entry: &Entry) {
        let inner = entry.lock();
        if !entry.is_valid() {
            return;
        }

        // Make sure the metadata is in sync with the L2P. If the L2P still
        // contains the entry, fill it with the on-disk PPA and clear the
        // cache status bit. Otherwise just clear the cache status; this
        // happens when a write comes in while the L2P contains the entry
        // but the entry hasn't been assigned a PPA yet.
        let (lba, ppa) = (inner.lba, inner.ppa);
        if !self.update_md_entry(lba, ppa, entry.pos) {
            self.l2p.set(lba, ppa);
        }
        entry.invalidate();
        drop(inner);
    }

    fn acquire_entry(&self, flags: IoFlags) -> Option<&Entry> {
        let entry = self.rwb.acquire(EntryType::from_flags(flags))?;
        self.evict_cache_entry(entry);
        entry.lock().flags = flags;
        Some(entry)
    }

    /// Point the L2P at a freshly filled cache entry, invalidating
    /// whatever it referred to before. Weak writes only win if their
    /// source address is still the current one.
    fn update_l2p(&self, lba: Lba, weak: bool, old_ppa: Ppa, cached: Ppa) {
        let prev = self.l2p.get(lba);
        if prev.is_invalid() {
            self.l2p.set(lba, cached);
            return;
        }

        // If the L2P's PPA is different than what we expected we don't
        // need to do anything (someone's already overwritten our data).
        if weak && prev != old_ppa {
            return;
        }

        if prev.is_cached() {
            debug_assert!(!weak);
            let prev_entry = self.rwb.entry_from_offset(prev.cache_offset() as usize);
            let inner = prev_entry.lock();

            // Re-read the L2P under the lock to protect against updates
            // to this LBA from other threads.
            let prev = self.l2p.get(lba);

            // If the entry is no longer in cache, another write has been
            // scheduled in the meantime, so we have to invalidate its LBA.
            if !prev.is_cached() && !prev.is_invalid() {
                self.invalidate_addr(prev);
            }

            // If the previous entry is part of the cache, remove and
            // invalidate it.
            if prev_entry.is_valid() {
                let prev_disk = inner.ppa;
                if !prev_disk.is_invalid() {
                    self.invalidate_addr(prev_disk);
                }
                prev_entry.invalidate();
            }

            self.l2p.set(lba, cached);
            drop(inner);
            return;
        }

        // Lock the band containing the previous PPA. This assures atomic
        // changes to the L2P as well as the metadata; the valid bits are
        // what decides the fate of weak writes.
        let band = self.band_from_ppa(prev);
        let mut md = band.md.lock();
        let offset = band.lbkoff_from_ppa(self, prev);
        let valid = band.invalidate_unlocked(&mut md, offset);

        // If the address has been invalidated already, a weak write is no
        // longer wanted.
        if !weak || valid {
            self.l2p.set(lba, cached);
        }
    }

    /// Absorb a write block by block into the ring write buffer.
    ///
    /// Returns `Errno::TryAgain` when admission credit runs out; the IO
    /// keeps its position and can be resubmitted as-is.
    pub(crate) fn rwb_fill(&self, io: &mut Io) -> Result<()> {
        let flags = io.flags.rwb_flags();
        let weak = flags.contains(IoFlags::WEAK);

        while io.pos < io.lbk_cnt {
            let lba = io.current_lba();
            if lba == LBA_INVALID {
                io.pos += 1;
                continue;
            }

            let Some(entry) = self.acquire_entry(flags) else {
                bail!(TryAgain);
            };

            let old_ppa = {
                let mut inner = entry.lock();
                inner.lba = lba;

                let buf = io.buf.as_ref().expect("write io owns its buffer");
                inner.data.copy_from_slice(buf.block(io.pos));

                if weak {
                    let band = &self.bands[io.band.expect("weak writes carry their band")];
                    inner.ppa = band.next_ppa(self, io.ppa, io.pos);
                }
                if let Some(md) = inner.md.as_mut() {
                    let len = md.len().min(8);
                    md[..len].copy_from_slice(&lba.to_le_bytes()[..len]);
                }
                inner.ppa
            };

            let cached = Ppa::cached(entry.pos as u64);
            io.pos += 1;
            self.update_l2p(lba, weak, old_ppa, cached);

            // Needs to be done after the L2P is updated to avoid a race
            // with the write completion callback when it's processed
            // faster than the L2P is set.
            self.rwb.push(entry);
        }

        Ok(())
    }

    /// Push zeroed internal padding entries to force the current batch to
    /// a submittable state.
    pub(crate) fn rwb_pad(&self, size: usize) {
        let flags = IoFlags::PAD | IoFlags::INTERNAL;

        for _ in 0..size {
            let Some(entry) = self.acquire_entry(flags) else {
                break;
            };

            {
                let mut inner = entry.lock();
                inner.lba = LBA_INVALID;
                inner.ppa = Ppa::invalid();
                inner.data.fill(0);
            }
            self.rwb.push(entry);
        }
    }
}
