// SPDX-License-Identifier: MPL-2.0

//! The relocation (defrag) engine.
//!
//! Relocation drains the still-valid blocks out of a closed band so the
//! band can be erased and reused. Each band relocator walks the band in
//! `xfer_size` stripes per parallel unit, reads runs of valid blocks, and
//! reinjects them into the write pipeline as weak writes: if a user write
//! overtakes a block between the relocation read and its commit, the stale
//! copy is dropped.
//!
//! Bands enter through a pending queue and are serviced up to
//! `max_active` at a time. A band that failed a write is queued with high
//! priority, bypasses `max_active`, and is serviced exclusively until it
//! drains.

use std::collections::VecDeque;

use crate::{
    band::{BandId, BandState},
    dev::Dev,
    geom::{Ppa, BLOCK_SIZE, LBA_INVALID},
    io::{Io, IoFlags},
    media::MediaError,
    meta::MdStatus,
    prelude::*,
    util::{BitMap, Buf},
};

/// A pending relocation write carrying its progress through the write
/// buffer admission.
struct RelocWrite {
    io: Io,
    initialized: bool,
}

struct BandReloc {
    band: BandId,
    /// Number of logical blocks still to be relocated.
    num_lbks: usize,
    /// Bitmap of logical blocks to be relocated.
    reloc_map: BitMap,
    /// The band is being actively processed.
    active: bool,
    /// Per-punit block offset of the stripe iterator.
    chk_offset: Vec<usize>,
    /// Chunk the iterator currently walks.
    chk_current: usize,
    /// Read buffers ready for the next stripe read.
    free_q: VecDeque<Buf>,
    /// Reads waiting to be turned into weak writes.
    write_q: VecDeque<RelocWrite>,
}

impl BandReloc {
    fn new(band: BandId, num_band_lbks: usize, num_punits: usize) -> Self {
        Self {
            band,
            num_lbks: 0,
            reloc_map: BitMap::new(num_band_lbks),
            active: false,
            chk_offset: vec![0; num_punits],
            chk_current: 0,
            free_q: VecDeque::new(),
            write_q: VecDeque::new(),
        }
    }

    fn clr_lbk(&mut self, lbkoff: usize) {
        if self.reloc_map.test_bit(lbkoff) {
            self.reloc_map.clear_bit(lbkoff);
            self.num_lbks -= 1;
        }
    }

    fn iter_reset(&mut self) {
        self.chk_offset.fill(0);
        self.chk_current = 0;
    }

    fn iter_lbkoff(&self, lbks_in_chunk: usize) -> usize {
        self.chk_current * lbks_in_chunk + self.chk_offset[self.chk_current]
    }

    fn iter_next_chk(&mut self) {
        self.chk_current = (self.chk_current + 1) % self.chk_offset.len();
    }

    fn iter_done(&self, lbks_in_chunk: usize) -> bool {
        self.chk_offset
            .iter()
            .all(|&offset| offset >= lbks_in_chunk - 1)
    }
}

pub(crate) struct Reloc {
    /// Relocation is about to halt.
    halt: bool,
    /// Maximum number of IOs per band.
    max_qdepth: usize,
    /// Maximum number of active band relocates.
    max_active: usize,
    /// Maximum transfer size per single IO.
    xfer_size: usize,
    num_active: usize,
    brelocs: Vec<BandReloc>,
    pending: VecDeque<BandId>,
    active_q: Vec<BandId>,
    prio_q: VecDeque<BandId>,
    /// Read buffer pool shared by every band relocator.
    buf_pool: Vec<Buf>,
}

impl Reloc {
    pub fn new(dev: &Dev) -> Result<Self> {
        let conf = &dev.conf;
        let num_band_lbks = dev.num_band_lbks();
        let num_punits = dev.num_punits();

        let brelocs = (0..dev.bands.len())
            .map(|id| BandReloc::new(id, num_band_lbks, num_punits))
            .collect();

        // One extra band's worth of buffers covers a priority band joining
        // the active set.
        let pool_size = conf.max_reloc_qdepth * (conf.max_active_relocs + 1);
        let mut buf_pool = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            buf_pool.push(Buf::alloc(dev.xfer_size)?);
        }

        Ok(Self {
            halt: true,
            max_qdepth: conf.max_reloc_qdepth,
            max_active: conf.max_active_relocs,
            xfer_size: dev.xfer_size,
            num_active: 0,
            brelocs,
            pending: VecDeque::new(),
            active_q: Vec::new(),
            prio_q: VecDeque::new(),
            buf_pool,
        })
    }

    pub fn halt(&mut self) {
        self.halt = true;
    }

    pub fn resume(&mut self) {
        self.halt = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halt
    }

    /// Mark `num_lbks` blocks starting at `offset` of `band` for
    /// relocation.
    pub fn add(&mut self, dev: &Dev, band: BandId, offset: usize, num_lbks: usize, prio: bool) {
        let breloc = &mut self.brelocs[band];
        let prev_lbks = breloc.num_lbks;

        for lbkoff in offset..offset + num_lbks {
            if breloc.reloc_map.test_bit(lbkoff) {
                continue;
            }
            breloc.reloc_map.set_bit(lbkoff);
            breloc.num_lbks += 1;
        }

        if prev_lbks == 0 && !prio {
            self.pending.push_front(band);
        }

        if prio {
            self.prio_q.push_back(band);
            // The failed band's LBA map is still resident; pin it for the
            // duration of the relocation.
            dev.bands[band].acquire_md();
        }
    }

    /// One scheduling pass: the first priority band preempts everything,
    /// then pending bands are promoted up to `max_active` and every active
    /// band makes progress.
    pub fn tick(&mut self, dev: &Dev) {
        if self.halt {
            return;
        }

        self.add_defrag_candidate(dev);

        if let Some(&band) = self.prio_q.front() {
            if !self.brelocs[band].active {
                self.prep(dev, band);
            }
            self.process(dev, band);
            return;
        }

        while self.num_active < self.max_active {
            let Some(band) = self.pending.pop_front() else {
                break;
            };
            self.active_q.push(band);
            self.prep(dev, band);
        }

        for band in self.active_q.clone() {
            self.process(dev, band);
        }
    }

    /// Queue the most reclaimable closed band once free space runs low
    /// enough for the admission limits to kick in.
    fn add_defrag_candidate(&mut self, dev: &Dev) {
        if dev.current_limit().is_none() {
            return;
        }
        if !self.pending.is_empty() || self.num_active != 0 || !self.prio_q.is_empty() {
            return;
        }

        let invld_thld = dev.conf.defrag.invld_thld;
        let mut best: Option<(BandId, usize)> = None;
        for &id in dev.shut_bands.lock().iter() {
            let band = &dev.bands[id];
            if !band.check_state(BandState::Closed) || self.brelocs[id].num_lbks != 0 {
                continue;
            }
            let usable = band.num_usable_lbks(dev);
            if usable == 0 {
                continue;
            }
            let num_vld = band.md.lock().num_vld;
            if num_vld * 100 / usable > invld_thld {
                continue;
            }
            // Fewest valid blocks wins; equally empty bands go oldest
            // first.
            let better = best.map_or(true, |(best_id, vld)| {
                num_vld < vld
                    || (num_vld == vld && band.age(dev) > dev.bands[best_id].age(dev))
            });
            if better {
                best = Some((id, num_vld));
            }
        }

        if let Some((id, _)) = best {
            debug!("defrag candidate: band {}", id);
            self.add(dev, id, 0, dev.num_band_lbks(), false);
        }
    }

    fn prep(&mut self, dev: &Dev, band_id: BandId) {
        let band = &dev.bands[band_id];
        self.brelocs[band_id].active = true;
        self.num_active += 1;

        if !band.high_prio.load(core::sync::atomic::Ordering::Acquire) {
            // The band has been closed for a while; its LBA map has to be
            // loaded back from the tail metadata.
            debug_assert!(band.md.lock().lba_map.is_none());
            if band.is_empty() {
                // Nothing to copy; no point reading the map.
                if band.alloc_md(dev).is_err() {
                    error!("reloc: lba map pool exhausted for band {}", band_id);
                }
            } else if self.read_lba_map(dev, band_id).is_err() {
                error!("reloc: failed to read lba map of band {}", band_id);
            }
        }

        for _ in 0..self.max_qdepth {
            let Some(buf) = self.buf_pool.pop() else {
                break;
            };
            self.brelocs[band_id].free_q.push_back(buf);
        }
    }

    fn read_lba_map(&mut self, dev: &Dev, band_id: BandId) -> Result<()> {
        let band = &dev.bands[band_id];
        band.alloc_md(dev)?;

        let mut buf = Buf::alloc(dev.layout.lba_map_num_lbks())?;
        if band.read_lba_map(dev, dev.core_qpair, &mut buf) != MdStatus::Success {
            bail!(IoFailed, "lba map read failed");
        }
        Ok(())
    }

    fn process(&mut self, dev: &Dev, band_id: BandId) {
        self.process_write_queue(dev, band_id);
        self.process_free_queue(dev, band_id);

        if self.done(band_id) {
            self.release(dev, band_id);
        }
    }

    fn done(&self, band_id: BandId) -> bool {
        self.brelocs[band_id].free_q.len() == self.max_qdepth
    }

    fn process_write_queue(&mut self, dev: &Dev, band_id: BandId) {
        let cnt = self.brelocs[band_id].write_q.len();
        for _ in 0..cnt {
            let Some(mut write) = self.brelocs[band_id].write_q.pop_front() else {
                break;
            };

            if !write.initialized {
                self.write_reinit(dev, band_id, &mut write.io);
                write.initialized = true;
            }

            match dev.rwb_fill(&mut write.io) {
                Ok(()) => self.write_done(dev, band_id, write.io),
                Err(err) if err.errno() == TryAgain => {
                    // Out of write buffer credit; retry on a later pass.
                    self.brelocs[band_id].write_q.push_back(write);
                }
                Err(_) => unreachable!("reloc write fill cannot fail otherwise"),
            }
        }
    }

    /// Populate the per-block LBAs of a freshly read run, using the
    /// invalid LBA for blocks that went stale since the read.
    fn write_reinit(&mut self, dev: &Dev, band_id: BandId, io: &mut Io) {
        let band = &dev.bands[band_id];
        let md = band.md.lock();
        let lba_map = md.lba_map.as_ref().expect("lba map must be resident");

        let mut lbas = vec![LBA_INVALID; io.lbk_cnt];
        for (i, lba) in lbas.iter_mut().enumerate() {
            let ppa = io.ppa.with_lbk(io.ppa.lbk() + i as u32);
            let lbkoff = band.lbkoff_from_ppa(dev, ppa);
            if md.vld_map.test_bit(lbkoff) {
                *lba = lba_map[lbkoff];
            }
        }
        drop(md);

        io.lbas = lbas;
        io.flags = IoFlags::WEAK | IoFlags::INTERNAL | IoFlags::VECTOR_LBA;
        io.band = Some(band_id);
    }

    /// The weak write has been absorbed; retire its blocks and recycle the
    /// buffer.
    fn write_done(&mut self, dev: &Dev, band_id: BandId, mut io: Io) {
        let band = &dev.bands[band_id];
        for i in 0..io.lbk_cnt {
            let ppa = io.ppa.with_lbk(io.ppa.lbk() + i as u32);
            let lbkoff = band.lbkoff_from_ppa(dev, ppa);
            self.brelocs[band_id].clr_lbk(lbkoff);
        }

        let buf = io.buf.take().expect("reloc io owns its buffer");
        self.brelocs[band_id].free_q.push_back(buf);
    }

    fn process_free_queue(&mut self, dev: &Dev, band_id: BandId) {
        let cnt = self.brelocs[band_id].free_q.len();
        for _ in 0..cnt {
            let Some(buf) = self.brelocs[band_id].free_q.pop_front() else {
                break;
            };

            let Some((ppa, lbk_cnt)) = self.next_lbks(dev, band_id) else {
                self.brelocs[band_id].free_q.push_back(buf);
                continue;
            };

            self.read_run(dev, band_id, ppa, lbk_cnt, buf);
        }
    }

    fn read_run(&mut self, dev: &Dev, band_id: BandId, ppa: Ppa, lbk_cnt: usize, mut buf: Buf) {
        let slice = &mut buf[..lbk_cnt * BLOCK_SIZE];
        match dev.ctrlr.read(dev.core_qpair, dev.fmt.pack(ppa), lbk_cnt, slice) {
            Ok(()) | Err(MediaError::ReadHighEcc) => (),
            Err(err) => {
                // The data cannot be moved; drop the blocks rather than
                // stall the band forever.
                error!("reloc read failed at {:?}: {:?}", ppa, err);
                let band = &dev.bands[band_id];
                for i in 0..lbk_cnt {
                    let lbkoff = band.lbkoff_from_ppa(dev, ppa.with_lbk(ppa.lbk() + i as u32));
                    self.brelocs[band_id].clr_lbk(lbkoff);
                }
                self.brelocs[band_id].free_q.push_back(buf);
                return;
            }
        }

        let io = Io {
            lba: LBA_INVALID,
            lbas: Vec::new(),
            ppa,
            band: Some(band_id),
            pos: 0,
            lbk_cnt,
            buf: Some(buf),
            flags: IoFlags::empty(),
        };
        self.brelocs[band_id].write_q.push_back(RelocWrite {
            io,
            initialized: false,
        });
    }

    /// Advance the iterator to the next run of up to `xfer_size` valid
    /// blocks within a single parallel unit.
    fn next_lbks(&mut self, dev: &Dev, band_id: BandId) -> Option<(Ppa, usize)> {
        let lbks_in_chunk = dev.lbks_in_chunk();

        for _ in 0..dev.num_punits() {
            let run = self.find_valid_lbks(dev, band_id, self.xfer_size);
            self.brelocs[band_id].iter_next_chk();

            if run.is_some() || self.brelocs[band_id].iter_done(lbks_in_chunk) {
                return run;
            }
        }

        None
    }

    fn lbk_valid(&self, dev: &Dev, band_id: BandId, lbkoff: usize) -> bool {
        self.brelocs[band_id].reloc_map.test_bit(lbkoff)
            && dev.bands[band_id].lbkoff_valid(lbkoff)
    }

    /// One iterator step within the current chunk. Returns the offset it
    /// inspected and whether that block still needs moving.
    fn iter_next(&mut self, dev: &Dev, band_id: BandId) -> (usize, bool) {
        let lbks_in_chunk = dev.lbks_in_chunk();
        let breloc = &mut self.brelocs[band_id];
        let lbkoff = breloc.iter_lbkoff(lbks_in_chunk);
        let chunk = breloc.chk_current;
        breloc.chk_offset[chunk] += 1;

        let valid = self.lbk_valid(dev, band_id, lbkoff);
        (lbkoff, valid)
    }

    fn find_valid_lbks(
        &mut self,
        dev: &Dev,
        band_id: BandId,
        num_lbks: usize,
    ) -> Option<(Ppa, usize)> {
        let lbks_in_chunk = dev.lbks_in_chunk();

        // Skip ahead to the first block that still needs moving.
        let mut first = None;
        let start = self.brelocs[band_id].chk_offset[self.brelocs[band_id].chk_current];
        for _ in start..lbks_in_chunk {
            let (lbkoff, valid) = self.iter_next(dev, band_id);
            if valid {
                first = Some(lbkoff);
                break;
            }
            self.brelocs[band_id].clr_lbk(lbkoff);
        }
        let first = first?;

        let ppa = dev.bands[band_id].ppa_from_lbkoff(dev, first);

        // Extend the run while the blocks stay valid and consecutive.
        let mut lbk_cnt = 1;
        while lbk_cnt < num_lbks {
            let chunk = self.brelocs[band_id].chk_current;
            if self.brelocs[band_id].chk_offset[chunk] >= lbks_in_chunk {
                break;
            }
            let (lbkoff, valid) = self.iter_next(dev, band_id);
            if !valid {
                self.brelocs[band_id].clr_lbk(lbkoff);
                break;
            }
            lbk_cnt += 1;
        }

        Some((ppa, lbk_cnt))
    }

    /// Wind the band down after a pass: return buffers, release the LBA
    /// map, and either requeue the remainder or free the band.
    fn release(&mut self, dev: &Dev, band_id: BandId) {
        let band = &dev.bands[band_id];

        if band.high_prio.load(core::sync::atomic::Ordering::Acquire) {
            band.high_prio
                .store(false, core::sync::atomic::Ordering::Release);
            self.prio_q.retain(|&id| id != band_id);
        } else {
            self.active_q.retain(|&id| id != band_id);
        }

        while let Some(buf) = self.brelocs[band_id].free_q.pop_front() {
            self.buf_pool.push(buf);
        }
        self.brelocs[band_id].iter_reset();

        band.release_md(dev);

        self.brelocs[band_id].active = false;
        self.num_active -= 1;

        if self.brelocs[band_id].num_lbks > 0 {
            self.pending.push_back(band_id);
            return;
        }

        if band.is_empty() {
            band.set_state(dev, BandState::Free);
        }
    }
}
