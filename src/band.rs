// SPDX-License-Identifier: MPL-2.0

//! Bands and chunks.
//!
//! A band is the horizontal slice across all operational parallel units at
//! one chunk index. It owns the valid-LBA map and the LBA map backing the
//! band's on-media tail metadata, a small state machine driving open/close
//! sequencing, and the stripe arithmetic that orders writes across its
//! chunks in `xfer_size` units.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::{
    dev::Dev,
    geom::{Lba, Ppa, LBA_INVALID},
    media::QpairId,
    meta::MdStatus,
    prelude::*,
    reader,
    util::BitMap,
};

pub type BandId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    Free,
    Open,
    Closed,
    Bad,
    Vacant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BandState {
    Free = 0,
    Prep = 1,
    Opening = 2,
    Open = 3,
    Full = 4,
    Closing = 5,
    Closed = 6,
}

impl BandState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Prep,
            2 => Self::Opening,
            3 => Self::Open,
            4 => Self::Full,
            5 => Self::Closing,
            6 => Self::Closed,
            _ => unreachable!("invalid band state"),
        }
    }

    /// The successor in the open/close sequence.
    pub fn next(self) -> Self {
        match self {
            Self::Free => Self::Prep,
            Self::Prep => Self::Opening,
            Self::Opening => Self::Open,
            Self::Open => Self::Full,
            Self::Full => Self::Closing,
            Self::Closing => Self::Closed,
            Self::Closed => Self::Free,
        }
    }
}

/// A single erase block within a parallel unit.
pub(crate) struct Chunk {
    pub state: ChunkState,
    /// First PPA of the chunk (carries the owning punit's coordinates).
    pub start_ppa: Ppa,
    /// Position within the band's chunk array (== relative punit number).
    pub pos: usize,
}

impl Chunk {
    pub fn is_bad(&self) -> bool {
        self.state == ChunkState::Bad
    }

    pub fn is_writable(&self) -> bool {
        self.state == ChunkState::Open || self.state == ChunkState::Free
    }
}

/// The band's chunks plus the ordered ring of operational ones.
///
/// The ring holds indices into `slots`; a chunk that goes bad is removed
/// from the ring but keeps its slot, so addresses that already refer to it
/// still resolve.
pub(crate) struct ChunkRing {
    pub slots: Vec<Chunk>,
    ring: Vec<usize>,
}

impl ChunkRing {
    pub fn new(slots: Vec<Chunk>) -> Self {
        let ring = slots
            .iter()
            .filter(|chunk| !chunk.is_bad())
            .map(|chunk| chunk.pos)
            .collect();
        Self { slots, ring }
    }

    pub fn num_operational(&self) -> usize {
        self.ring.len()
    }

    pub fn first(&self) -> Option<usize> {
        self.ring.first().copied()
    }

    pub fn is_first(&self, slot: usize) -> bool {
        self.ring.first() == Some(&slot)
    }

    pub fn is_last(&self, slot: usize) -> bool {
        self.ring.last() == Some(&slot)
    }

    /// Circular successor of an operational chunk.
    pub fn next_in_ring(&self, slot: usize) -> usize {
        debug_assert!(!self.slots[slot].is_bad());
        let idx = self
            .ring
            .iter()
            .position(|&entry| entry == slot)
            .expect("chunk must be operational");
        self.ring[(idx + 1) % self.ring.len()]
    }

    /// Circular successor, tolerating a chunk that has since gone bad.
    pub fn next_operational(&self, slot: usize) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }

        if !self.slots[slot].is_bad() {
            return Some(self.next_in_ring(slot));
        }

        // Erasing a band may fail after it was assigned to a write pointer;
        // in that case the chunk is no longer part of the ring.
        Some(
            self.ring
                .iter()
                .copied()
                .find(|&entry| entry > slot)
                .unwrap_or(self.ring[0]),
        )
    }

    pub fn remove(&mut self, slot: usize) {
        self.ring.retain(|&entry| entry != slot);
    }
}

/// Band metadata. Protected by the band's spinlock.
pub(crate) struct BandMd {
    /// Sequence number, strictly increasing in band-open order.
    pub seq: u64,
    /// Number of defrag cycles.
    pub wr_cnt: u64,
    /// Number of valid LBAs.
    pub num_vld: usize,
    /// LBA map's reference count.
    pub ref_cnt: usize,
    /// Bitmap of valid LBAs.
    pub vld_map: BitMap,
    /// LBA map, populated only while the band is active or being relocated.
    pub lba_map: Option<Box<[Lba]>>,
}

pub(crate) struct Band {
    pub id: BandId,
    state: AtomicU8,
    pub chunks: SpinLock<ChunkRing>,
    pub md: SpinLock<BandMd>,
    /// High defrag priority: the band failed a write and must be relocated
    /// before it can be reused.
    pub high_prio: AtomicBool,
    /// Start PPA of the tail metadata (raw form; invalid when unknown).
    tail_md_ppa: AtomicU64,
}

impl Band {
    pub fn new(id: BandId, chunks: Vec<Chunk>, num_band_lbks: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(BandState::Closed as u8),
            chunks: SpinLock::new(ChunkRing::new(chunks)),
            md: SpinLock::new(BandMd {
                seq: 0,
                wr_cnt: 0,
                num_vld: 0,
                ref_cnt: 0,
                vld_map: BitMap::new(num_band_lbks),
                lba_map: None,
            }),
            high_prio: AtomicBool::new(false),
            tail_md_ppa: AtomicU64::new(Ppa::invalid().raw()),
        }
    }

    pub fn state(&self) -> BandState {
        BandState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn check_state(&self, state: BandState) -> bool {
        self.state() == state
    }

    /// Whether a metadata write is in flight for this band.
    pub fn state_changing(&self) -> bool {
        matches!(self.state(), BandState::Opening | BandState::Closing)
    }

    pub fn is_empty(&self) -> bool {
        self.md.lock().num_vld == 0
    }

    pub fn has_chunks(&self) -> bool {
        self.chunks.lock().num_operational() > 0
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.lock().num_operational()
    }

    pub fn tail_md_ppa_stored(&self) -> Ppa {
        Ppa::from_raw(self.tail_md_ppa.load(Ordering::Acquire))
    }

    pub fn set_tail_md_ppa(&self, ppa: Ppa) {
        self.tail_md_ppa.store(ppa.raw(), Ordering::Release);
    }

    /// How many band opens the device has seen since this one.
    pub fn age(&self, dev: &Dev) -> u64 {
        dev.seq().saturating_sub(self.md.lock().seq)
    }

    // ===== Address arithmetic =====

    /// Flat offset of `ppa` into the band's valid/LBA maps.
    pub fn lbkoff_from_ppa(&self, dev: &Dev, ppa: Ppa) -> usize {
        assert_eq!(ppa.chk() as usize, self.id);
        let punit = dev.flatten_punit(ppa);
        punit * dev.lbks_in_chunk() + ppa.lbk() as usize
    }

    /// Inverse of [`Self::lbkoff_from_ppa`].
    pub fn ppa_from_lbkoff(&self, dev: &Dev, lbkoff: usize) -> Ppa {
        let punit = lbkoff / dev.lbks_in_chunk() + dev.range.begin as usize;
        let lbk = (lbkoff % dev.lbks_in_chunk()) as u32;
        Ppa::new(
            (punit % dev.geo.num_grp as usize) as u32,
            (punit / dev.geo.num_grp as usize) as u32,
            self.id as u32,
            lbk,
        )
    }

    /// Advance `ppa` by `offset` blocks in map order.
    pub fn next_ppa(&self, dev: &Dev, ppa: Ppa, offset: usize) -> Ppa {
        let lbkoff = self.lbkoff_from_ppa(dev, ppa);
        self.ppa_from_lbkoff(dev, lbkoff + offset)
    }

    /// Advance `ppa` by `num_lbks` along the stripe order: `xfer_size`
    /// blocks per chunk, wrapping from the last operational chunk back to
    /// the first with the block coordinate bumped by `xfer_size`. Returns
    /// the invalid PPA when advancement runs past the chunk block count.
    pub fn next_xfer_ppa(&self, dev: &Dev, ppa: Ppa, num_lbks: usize) -> Ppa {
        assert_eq!(ppa.chk() as usize, self.id);

        let xfer_size = dev.xfer_size;
        let lbks_in_chunk = dev.lbks_in_chunk();
        let chunks = self.chunks.lock();
        let num_chunks = chunks.num_operational();
        if num_chunks == 0 {
            return Ppa::invalid();
        }

        let mut chunk = dev.flatten_punit(ppa);
        let mut lbk = ppa.lbk() as usize;
        let mut num_lbks = num_lbks + lbk % xfer_size;
        lbk -= lbk % xfer_size;

        let num_stripes = (num_lbks / xfer_size) / num_chunks;
        lbk += num_stripes * xfer_size;
        num_lbks -= num_stripes * xfer_size * num_chunks;

        if lbk > lbks_in_chunk {
            return Ppa::invalid();
        }

        let num_xfers = num_lbks / xfer_size;
        let mut ppa = ppa.with_lbk(lbk as u32);
        for _ in 0..num_xfers {
            // When the last chunk is reached the block part of the address
            // needs to be increased by xfer_size.
            if chunks.is_last(chunk) {
                lbk += xfer_size;
                if lbk > lbks_in_chunk {
                    return Ppa::invalid();
                }
            }

            let Some(next) = chunks.next_operational(chunk) else {
                return Ppa::invalid();
            };
            chunk = next;
            let start = chunks.slots[chunk].start_ppa;
            ppa = Ppa::new(start.grp(), start.pu(), self.id as u32, lbk as u32);

            num_lbks -= xfer_size;
        }

        if num_lbks > 0 {
            lbk += num_lbks;
            if lbk > lbks_in_chunk {
                return Ppa::invalid();
            }
        }

        ppa.with_lbk(lbk as u32)
    }

    /// Number of blocks the band can hold, metadata included.
    pub fn num_usable_lbks(&self, dev: &Dev) -> usize {
        self.num_chunks() * dev.lbks_in_chunk()
    }

    /// Number of blocks available for user data.
    pub fn user_lbks(&self, dev: &Dev) -> usize {
        self.num_usable_lbks(dev)
            - dev.layout.head_md_num_lbks()
            - dev.layout.tail_md_num_lbks()
    }

    /// Offset at which the tail metadata region starts.
    pub fn tail_md_offset(&self, dev: &Dev) -> usize {
        self.num_usable_lbks(dev) - dev.layout.tail_md_num_lbks()
    }

    pub fn is_full(&self, dev: &Dev, offset: usize) -> bool {
        offset == self.tail_md_offset(dev)
    }

    /// Compute the tail metadata start PPA via the stripe function.
    pub fn tail_md_ppa(&self, dev: &Dev) -> Ppa {
        let xfer_size = dev.xfer_size;
        let num_req = self.tail_md_offset(dev) / xfer_size;
        // Metadata is aligned to the transfer size.
        debug_assert_eq!(self.tail_md_offset(dev) % xfer_size, 0);

        let chunks = self.chunks.lock();
        let num_chunks = chunks.num_operational();
        let mut chunk = chunks.first().expect("band must have chunks");
        for _ in 0..num_req % num_chunks {
            chunk = chunks.next_in_ring(chunk);
        }

        let start = chunks.slots[chunk].start_ppa;
        Ppa::new(
            start.grp(),
            start.pu(),
            self.id as u32,
            ((num_req / num_chunks) * xfer_size) as u32,
        )
    }

    /// First PPA of the band's first operational chunk.
    pub fn head_md_ppa(&self) -> Ppa {
        let chunks = self.chunks.lock();
        let first = chunks.first().expect("band must have chunks");
        chunks.slots[first].start_ppa.with_chk(self.id as u32)
    }

    // ===== Valid map accounting =====

    /// Record `lba` as living at `ppa` within this band.
    pub fn set_addr(&self, dev: &Dev, lba: Lba, ppa: Ppa) {
        if lba == LBA_INVALID {
            return;
        }

        let offset = self.lbkoff_from_ppa(dev, ppa);
        let mut md = self.md.lock();
        md.num_vld += 1;
        if let Some(lba_map) = md.lba_map.as_mut() {
            lba_map[offset] = lba;
        }
        md.vld_map.set_bit(offset);
    }

    /// Clear the valid bit at `offset` with the metadata lock already held.
    /// Idempotent: two writes racing on the same LBA may both try to
    /// invalidate it.
    pub fn invalidate_unlocked(&self, md: &mut BandMd, offset: usize) -> bool {
        if md.vld_map.test_bit(offset) {
            debug_assert!(md.num_vld > 0);
            md.vld_map.clear_bit(offset);
            md.num_vld -= 1;
            return true;
        }
        false
    }

    pub fn lbkoff_valid(&self, lbkoff: usize) -> bool {
        self.md.lock().vld_map.test_bit(lbkoff)
    }

    // ===== State machine =====

    fn do_set_free(&self, dev: &Dev) {
        debug_assert_eq!(self.state(), BandState::Closed);

        dev.shut_bands.lock().retain(|&id| id != self.id);

        // Keep the free list sorted by the band's write count.
        let wr_cnt = self.md.lock().wr_cnt;
        let mut free = dev.free_bands.lock();
        let at = free
            .iter()
            .position(|&id| dev.bands[id].md.lock().wr_cnt > wr_cnt)
            .unwrap_or(free.len());
        free.insert(at, self.id);
        drop(free);

        dev.num_free.fetch_add(1, Ordering::AcqRel);
        dev.apply_limits();
    }

    fn do_set_opening(&self, dev: &Dev) {
        debug_assert_eq!(self.state(), BandState::Prep);

        dev.free_bands.lock().retain(|&id| id != self.id);
        self.md.lock().wr_cnt += 1;

        let prev = dev.num_free.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        dev.apply_limits();
    }

    fn do_set_closed(&self, dev: &Dev) -> bool {
        if self.check_state(BandState::Closed) {
            return true;
        }

        // Set the state first as the release path checks for it.
        self.state.store(BandState::Closed as u8, Ordering::Release);

        // Free the metadata if there are no outstanding IOs.
        self.release_md(dev);

        if self.has_chunks() {
            dev.shut_bands.lock().push(self.id);
            for chunk in self.chunks.lock().slots.iter_mut() {
                if !chunk.is_bad() {
                    chunk.state = ChunkState::Closed;
                }
            }
        } else {
            dev.shut_bands.lock().retain(|&id| id != self.id);
            dev.free_bands.lock().retain(|&id| id != self.id);
        }
        false
    }

    pub fn set_state(&self, dev: &Dev, state: BandState) {
        match state {
            BandState::Free => self.do_set_free(dev),
            BandState::Opening => self.do_set_opening(dev),
            BandState::Closed => {
                if self.do_set_closed(dev) {
                    return;
                }
            }
            _ => (),
        }

        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_next_state(&self, dev: &Dev) {
        self.set_state(dev, self.state().next());
    }

    // ===== LBA map lifecycle =====

    /// Check a fresh LBA map out of the device pool.
    pub fn alloc_md(&self, dev: &Dev) -> Result<()> {
        let mut md = self.md.lock();
        debug_assert_eq!(md.ref_cnt, 0);
        debug_assert!(md.lba_map.is_none());

        let Some(lba_map) = dev.lba_pool.get() else {
            bail!(OutOfMemory, "lba map pool exhausted");
        };
        md.lba_map = Some(lba_map);
        md.ref_cnt += 1;
        Ok(())
    }

    pub fn acquire_md(&self) {
        let mut md = self.md.lock();
        debug_assert!(md.lba_map.is_some());
        md.ref_cnt += 1;
    }

    fn free_md(&self, dev: &Dev, md: &mut BandMd) {
        // The LBA map may only go back to the pool once the band has
        // settled; otherwise the metadata is still in use.
        if !matches!(self.state(), BandState::Closed | BandState::Free) {
            return;
        }
        if md.ref_cnt > 0 {
            return;
        }

        debug_assert!(!self.high_prio.load(Ordering::Acquire));
        #[cfg(debug_assertions)]
        if self.has_chunks() {
            debug_assert_eq!(md.vld_map.count_ones(), md.num_vld);
        }

        let lba_map = md.lba_map.take().expect("lba map must be allocated");
        dev.lba_pool.put(lba_map);
    }

    pub fn release_md(&self, dev: &Dev) {
        let mut md = self.md.lock();
        debug_assert!(md.ref_cnt > 0);
        debug_assert!(md.lba_map.is_some());
        md.ref_cnt -= 1;
        self.free_md(dev, &mut md);
    }

    /// Zero the valid and LBA maps of a band about to be written.
    pub fn clear_md(&self) {
        let mut md = self.md.lock();
        md.vld_map.clear_all();
        if let Some(lba_map) = md.lba_map.as_mut() {
            lba_map.fill(0);
        }
        md.num_vld = 0;
    }

    /// Reset the metadata of a band that has no restorable state.
    pub fn md_clear(&self, dev: &Dev) {
        let mut md = self.md.lock();
        md.seq = 0;
        md.num_vld = 0;
        md.wr_cnt = 0;
        if let Some(lba_map) = md.lba_map.take() {
            dev.lba_pool.put(lba_map);
        }
    }

    /// Allocate the LBA map and stamp a fresh sequence number.
    pub fn write_prep(&self, dev: &Dev) -> Result<()> {
        self.alloc_md(dev)?;
        self.md.lock().seq = dev.next_seq();
        Ok(())
    }

    // ===== Metadata IO =====

    /// Read and validate the band's head metadata.
    pub fn read_head_md(&self, dev: &Dev, qpair: QpairId, buf: &mut [u8]) -> MdStatus {
        let lbk_cnt = dev.layout.head_md_num_lbks();
        let ppa = self.head_md_ppa();
        if reader::read_md_region(dev, qpair, self, ppa, lbk_cnt, buf).is_err() {
            return MdStatus::IoFailure;
        }

        let (status, info) = dev.layout.unpack_head_md(buf, &dev.uuid);
        let Some((seq, wr_cnt, lba_cnt, _xfer)) = info else {
            return status;
        };

        // The head carries the advertised capacity; every band must agree.
        let prev = dev
            .global_l2p_len
            .compare_exchange(0, lba_cnt, Ordering::AcqRel, Ordering::Acquire);
        if let Err(prev) = prev {
            if prev != lba_cnt {
                return MdStatus::InvalidSize;
            }
        }

        let mut md = self.md.lock();
        md.seq = seq;
        md.wr_cnt = wr_cnt;
        MdStatus::Success
    }

    /// Read and validate the band's tail metadata at `ppa`, restoring the
    /// valid map and, when given, the LBA map scratch.
    pub fn read_tail_md(
        &self,
        dev: &Dev,
        qpair: QpairId,
        ppa: Ppa,
        buf: &mut [u8],
        lba_map: Option<&mut [Lba]>,
    ) -> MdStatus {
        let lbk_cnt = dev.layout.tail_md_num_lbks();
        if reader::read_md_region(dev, qpair, self, ppa, lbk_cnt, buf).is_err() {
            return MdStatus::IoFailure;
        }

        let mut md = self.md.lock();
        let (status, seq) =
            dev.layout
                .unpack_tail_md(buf, &dev.uuid, Some(&mut md.vld_map), lba_map);
        if let Some(seq) = seq {
            md.seq = seq;
        }
        status
    }

    /// Read the LBA map region of the tail metadata into the band's own
    /// LBA map.
    pub fn read_lba_map(&self, dev: &Dev, qpair: QpairId, buf: &mut [u8]) -> MdStatus {
        let skip = dev.layout.tail_hdr_num_lbks() + dev.layout.vld_map_num_lbks();
        let ppa = self.next_xfer_ppa(dev, self.tail_md_ppa_stored(), skip);
        let lbk_cnt = dev.layout.lba_map_num_lbks();

        if reader::read_md_region(dev, qpair, self, ppa, lbk_cnt, buf).is_err() {
            return MdStatus::IoFailure;
        }

        let mut md = self.md.lock();
        let lba_map = md.lba_map.as_mut().expect("lba map must be allocated");
        dev.layout.unpack_lba_map(buf, lba_map);
        MdStatus::Success
    }

    /// Serialize the head metadata into `buf`.
    pub fn pack_head_md(&self, dev: &Dev, buf: &mut [u8]) {
        let md = self.md.lock();
        dev.layout
            .pack_head_md(buf, &dev.uuid, md.seq, md.wr_cnt, dev.l2p.len());
    }

    /// Serialize the tail metadata into `buf`.
    pub fn pack_tail_md(&self, dev: &Dev, buf: &mut [u8]) {
        let md = self.md.lock();
        let lba_map = md.lba_map.as_ref().expect("lba map must be allocated");
        dev.layout
            .pack_tail_md(buf, &dev.uuid, md.seq, &md.vld_map, lba_map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::tests::{test_dev, TEST_BAND_IDX, TEST_GEO, TEST_RANGE};

    const TEST_LBA: Lba = 0x68676564;

    fn ppa_from_punit(punit: u32) -> Ppa {
        Ppa::new(
            punit % TEST_GEO.num_grp,
            punit / TEST_GEO.num_grp,
            TEST_BAND_IDX as u32,
            0,
        )
    }

    fn offset_from_ppa(dev: &Dev, band: &Band, ppa: Ppa) -> usize {
        let punit = dev.flatten_punit(ppa);
        assert_eq!(ppa.chk() as usize, band.id);
        punit * dev.lbks_in_chunk() + ppa.lbk() as usize
    }

    #[test]
    fn lbkoff_from_ppa_base() {
        let dev = test_dev();
        let band = &dev.bands[TEST_BAND_IDX];

        let mut flat_lun = 0;
        for punit in TEST_RANGE.begin..TEST_RANGE.end {
            let ppa = ppa_from_punit(punit);
            let offset = band.lbkoff_from_ppa(&dev, ppa);
            assert_eq!(offset, flat_lun * dev.lbks_in_chunk());
            flat_lun += 1;
        }
    }

    #[test]
    fn lbkoff_from_ppa_lbk() {
        let dev = test_dev();
        let band = &dev.bands[TEST_BAND_IDX];

        for punit in TEST_RANGE.begin..TEST_RANGE.end {
            for lbk in 0..TEST_GEO.clba {
                let ppa = ppa_from_punit(punit).with_lbk(lbk);
                let offset = band.lbkoff_from_ppa(&dev, ppa);
                assert_eq!(offset, offset_from_ppa(&dev, band, ppa));
            }
        }
    }

    #[test]
    fn ppa_from_lbkoff_round_trip() {
        let dev = test_dev();
        let band = &dev.bands[TEST_BAND_IDX];

        for punit in TEST_RANGE.begin..TEST_RANGE.end {
            for lbk in 0..TEST_GEO.clba {
                let expect = ppa_from_punit(punit).with_lbk(lbk);
                let offset = band.lbkoff_from_ppa(&dev, expect);
                assert_eq!(band.ppa_from_lbkoff(&dev, offset), expect);
            }
        }
    }

    #[test]
    fn set_addr() {
        let dev = test_dev();
        let band = &dev.bands[TEST_BAND_IDX];
        band.alloc_md(&dev).unwrap();

        let ppa = ppa_from_punit(TEST_RANGE.begin);
        assert_eq!(band.md.lock().num_vld, 0);

        let offset = offset_from_ppa(&dev, band, ppa);
        band.set_addr(&dev, TEST_LBA, ppa);
        {
            let md = band.md.lock();
            assert_eq!(md.num_vld, 1);
            assert_eq!(md.lba_map.as_ref().unwrap()[offset], TEST_LBA);
            assert!(md.vld_map.test_bit(offset));
        }

        let ppa2 = Ppa::new(ppa.grp(), ppa.pu() + 1, ppa.chk(), ppa.lbk());
        let offset2 = offset_from_ppa(&dev, band, ppa2);
        band.set_addr(&dev, TEST_LBA + 1, ppa2);
        {
            let md = band.md.lock();
            assert_eq!(md.num_vld, 2);
            assert_eq!(md.lba_map.as_ref().unwrap()[offset2], TEST_LBA + 1);
            assert!(md.vld_map.test_bit(offset2));
            assert!(md.vld_map.test_bit(offset));
        }
    }

    #[test]
    fn invalidate_addr() {
        let dev = test_dev();
        let band = &dev.bands[TEST_BAND_IDX];
        band.alloc_md(&dev).unwrap();

        let ppa = ppa_from_punit(TEST_RANGE.begin);
        let offset = offset_from_ppa(&dev, band, ppa);

        band.set_addr(&dev, TEST_LBA, ppa);
        assert_eq!(band.md.lock().num_vld, 1);
        dev.invalidate_addr(ppa);
        {
            let md = band.md.lock();
            assert_eq!(md.num_vld, 0);
            assert!(!md.vld_map.test_bit(offset));
        }

        // Invalidating one address leaves the others alone, and a double
        // invalidation must not underflow.
        band.set_addr(&dev, TEST_LBA, ppa);
        let ppa2 = Ppa::new(ppa.grp(), ppa.pu() + 1, ppa.chk(), ppa.lbk());
        let offset2 = offset_from_ppa(&dev, band, ppa2);
        band.set_addr(&dev, TEST_LBA + 1, ppa2);
        assert_eq!(band.md.lock().num_vld, 2);
        dev.invalidate_addr(ppa2);
        dev.invalidate_addr(ppa2);
        {
            let md = band.md.lock();
            assert_eq!(md.num_vld, 1);
            assert!(md.vld_map.test_bit(offset));
            assert!(!md.vld_map.test_bit(offset2));
        }
    }

    #[test]
    fn next_xfer_ppa() {
        let dev = test_dev();
        let band = &dev.bands[TEST_BAND_IDX];
        let xfer = dev.xfer_size;
        let num_punits = dev.num_punits();

        // Simple one block increment.
        let ppa = ppa_from_punit(TEST_RANGE.begin);
        let result = band.next_xfer_ppa(&dev, ppa, 1);
        assert_eq!(result, ppa.with_lbk(1));

        // Jumping between chunks.
        let expect = ppa_from_punit(TEST_RANGE.begin + 1);
        assert_eq!(band.next_xfer_ppa(&dev, ppa, xfer), expect);

        // Jumping works with unaligned offsets.
        assert_eq!(
            band.next_xfer_ppa(&dev, ppa, xfer + 3),
            expect.with_lbk(3)
        );

        // Jumping from the last chunk to the first one.
        let last = ppa_from_punit(TEST_RANGE.end);
        assert_eq!(
            band.next_xfer_ppa(&dev, last, xfer),
            ppa_from_punit(TEST_RANGE.begin).with_lbk(xfer as u32)
        );

        // Same, with an unaligned offset.
        assert_eq!(
            band.next_xfer_ppa(&dev, last, xfer + 2),
            ppa_from_punit(TEST_RANGE.begin).with_lbk(xfer as u32 + 2)
        );

        // Large offset spanning the whole band multiple times.
        let ppa = ppa_from_punit(TEST_RANGE.begin).with_lbk(2 * xfer as u32 + 1);
        let result = band.next_xfer_ppa(&dev, ppa, 3 * xfer * num_punits + 3);
        assert_eq!(
            result,
            ppa_from_punit(TEST_RANGE.begin).with_lbk(5 * xfer as u32 + 4)
        );

        // Remove one chunk and verify it's skipped properly.
        {
            let mut chunks = band.chunks.lock();
            chunks.slots[1].state = ChunkState::Bad;
            chunks.remove(1);
        }
        let ppa = ppa_from_punit(TEST_RANGE.begin).with_lbk(2 * xfer as u32 + 1);
        let result = band.next_xfer_ppa(&dev, ppa, 3 * xfer * (num_punits - 1) + xfer + 3);
        assert_eq!(
            result,
            ppa_from_punit(TEST_RANGE.begin + 2).with_lbk(5 * xfer as u32 + 4)
        );
    }

    #[test]
    fn tail_md_layout_invariant() {
        let dev = test_dev();
        let band = &dev.bands[TEST_BAND_IDX];

        assert_eq!(
            band.tail_md_offset(&dev),
            band.num_usable_lbks(&dev) - dev.layout.tail_md_num_lbks()
        );

        let tail_ppa = band.tail_md_ppa(&dev);
        let offset = band.lbkoff_from_ppa(&dev, tail_ppa);
        // The stripe function maps the tail offset onto that PPA.
        assert_eq!(
            band.next_xfer_ppa(&dev, band.head_md_ppa(), band.tail_md_offset(&dev)),
            tail_ppa
        );
        assert!(offset < band.num_usable_lbks(&dev));
    }

    #[test]
    fn free_list_sorted_by_wr_cnt() {
        let dev = test_dev();

        dev.bands[3].md.lock().wr_cnt = 5;
        dev.bands[1].md.lock().wr_cnt = 1;
        dev.bands[2].md.lock().wr_cnt = 3;

        for id in [3, 1, 2] {
            dev.bands[id].set_state(&dev, BandState::Free);
        }

        assert_eq!(*dev.free_bands.lock(), vec![1, 2, 3]);
        assert_eq!(dev.num_free.load(Ordering::Acquire), 3);
    }
}
