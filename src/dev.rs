// SPDX-License-Identifier: MPL-2.0

//! Device bring-up and the public surface.
//!
//! `OcssdDev` exposes a conventional logical block device on top of a
//! PPA-mode open-channel controller. Opening a device discovers the
//! geometry, builds the band arena from the chunk information log, either
//! starts from scratch (create mode) or restores the L2P from on-media
//! metadata, and then spins up the core writer thread (plus an optional
//! dedicated read thread).

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use uuid::Uuid;

use crate::{
    anm::{Anm, AnmHandler},
    band::{Band, BandId, BandState, Chunk, ChunkState},
    conf::{LimitTier, OcssdConf},
    geom::{Geometry, Lba, Ppa, PpaFormat, PunitRange, BLOCK_SIZE},
    io::{FlushCb, ReadCb, ReadIo, WriteIo},
    l2p::L2pTable,
    media::{ChunkInfo, MediaChunkState, MediaController, QpairId},
    meta::MdLayout,
    prelude::*,
    restore,
    rwb::{EntryType, Rwb},
    thread::{wait_initialized, ThreadCtl},
    util::Buf,
    writer::{core_loop, read_loop, CoreCtx, CoreMsg, ReadMsg},
};

/// How long thread bring-up may take before the open is aborted.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Chunk info entries fetched per log page call.
const CHUNK_INFO_ENTRIES: usize = 256;

bitflags::bitflags! {
    pub struct Mode: u32 {
        /// Start from scratch instead of restoring on-media state.
        const CREATE = 1 << 0;
        /// Run reads on a dedicated thread.
        const READ_ISOLATION = 1 << 1;
    }
}

pub struct InitOpts {
    pub name: String,
    /// Device identity; required in restore mode, generated when absent in
    /// create mode.
    pub uuid: Option<Uuid>,
    pub conf: Option<OcssdConf>,
    /// Slice of the flattened parallel unit space this device owns.
    pub range: PunitRange,
    pub mode: Mode,
    pub ctrlr: Arc<dyn MediaController>,
}

#[derive(Clone, Copy, Debug)]
pub struct DevAttrs {
    pub uuid: Uuid,
    /// Number of addressable logical blocks.
    pub lbk_cnt: u64,
    /// Size of a logical block in bytes.
    pub lbk_size: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    /// Number of writes scheduled directly by the user.
    pub write_user: u64,
    /// Total number of writes.
    pub write_total: u64,
    /// Number of times each limit tier has been applied.
    pub limits: [u64; LimitTier::COUNT],
}

pub(crate) struct Punit {
    pub start_ppa: Ppa,
}

pub(crate) struct Stats {
    pub write_user: AtomicU64,
    pub write_total: AtomicU64,
    pub limits: [AtomicU64; LimitTier::COUNT],
}

impl Stats {
    fn new() -> Self {
        Self {
            write_user: AtomicU64::new(0),
            write_total: AtomicU64::new(0),
            limits: Default::default(),
        }
    }
}

/// Pool of LBA map buffers shared by every band.
///
/// Two buffers cover the band close/open sequence alone; the headroom
/// covers relocation after write errors.
pub(crate) struct LbaMapPool {
    bufs: SpinLock<Vec<Box<[Lba]>>>,
}

impl LbaMapPool {
    const POOL_SIZE: usize = 2 + 8;

    fn new(map_len: usize) -> Self {
        let bufs = (0..Self::POOL_SIZE)
            .map(|_| vec![0; map_len].into_boxed_slice())
            .collect();
        Self {
            bufs: SpinLock::new(bufs),
        }
    }

    pub fn get(&self) -> Option<Box<[Lba]>> {
        self.bufs.lock().pop()
    }

    pub fn put(&self, buf: Box<[Lba]>) {
        self.bufs.lock().push(buf);
    }
}

pub(crate) struct Dev {
    pub name: String,
    pub uuid: Uuid,
    pub conf: OcssdConf,
    pub geo: Geometry,
    pub fmt: PpaFormat,
    pub layout: MdLayout,
    pub range: PunitRange,
    pub md_size: usize,
    /// Transfer unit size in blocks (the device's optimal write size).
    pub xfer_size: usize,
    pub punits: Vec<Punit>,
    pub bands: Box<[Band]>,
    pub free_bands: SpinLock<Vec<BandId>>,
    pub shut_bands: SpinLock<Vec<BandId>>,
    pub num_free: AtomicUsize,
    seq: AtomicU64,
    pub l2p: L2pTable,
    /// Advertised capacity recorded in head metadata; zero until known.
    pub global_l2p_len: AtomicU64,
    pub rwb: Rwb,
    /// Currently active limit tier (`LimitTier::COUNT` when none).
    limit: AtomicUsize,
    pub stats: Stats,
    pub num_inflight: AtomicUsize,
    pub lba_pool: LbaMapPool,
    pub ctrlr: Arc<dyn MediaController>,
    pub core_thread: ThreadCtl<CoreMsg>,
    pub read_thread: ThreadCtl<ReadMsg>,
    pub core_qpair: QpairId,
    pub read_qpair: QpairId,
    pub read_isolation: bool,
}

impl Dev {
    pub fn num_punits(&self) -> usize {
        self.range.num_punits()
    }

    pub fn lbks_in_chunk(&self) -> usize {
        self.geo.clba as usize
    }

    pub fn num_band_lbks(&self) -> usize {
        self.num_punits() * self.lbks_in_chunk()
    }

    pub fn flatten_punit(&self, ppa: Ppa) -> usize {
        (ppa.pu() * self.geo.num_grp + ppa.grp() - self.range.begin) as usize
    }

    pub fn band_from_ppa(&self, ppa: Ppa) -> &Band {
        debug_assert!(!ppa.is_cached() && !ppa.is_invalid());
        &self.bands[ppa.chk() as usize]
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clear the valid bit backing `ppa`. Idempotent; returns whether the
    /// bit was still set.
    pub fn invalidate_addr(&self, ppa: Ppa) -> bool {
        debug_assert!(!ppa.is_cached());
        if ppa.is_invalid() {
            return false;
        }

        let band = self.band_from_ppa(ppa);
        let offset = band.lbkoff_from_ppa(self, ppa);
        let mut md = band.md.lock();
        band.invalidate_unlocked(&mut md, offset)
    }

    pub fn current_limit(&self) -> Option<LimitTier> {
        match self.limit.load(Ordering::Acquire) {
            idx if idx < LimitTier::COUNT => Some(LimitTier::ALL[idx]),
            _ => None,
        }
    }

    /// Recompute the user write credit from the current free band count.
    pub fn apply_limits(&self) {
        let mut rwb_limit = self.rwb.get_limits();
        let num_free = self.num_free.load(Ordering::Acquire);

        let mut applied = None;
        for tier in LimitTier::ALL {
            let limit = &self.conf.defrag.limits[tier as usize];
            if num_free <= limit.thld {
                rwb_limit[EntryType::User as usize] =
                    limit.limit * self.rwb.entry_cnt() / 100;
                self.stats.limits[tier as usize].fetch_add(1, Ordering::Relaxed);
                applied = Some(tier);
                break;
            }
        }

        if applied.is_none() {
            // No tier applies anymore; restore the full credit.
            rwb_limit[EntryType::User as usize] = self.rwb.entry_cnt();
        }

        self.limit.store(
            applied.map_or(LimitTier::COUNT, |tier| tier as usize),
            Ordering::Release,
        );
        self.rwb.set_limits(rwb_limit);
    }

    /// Absorb a user write; the callback fires once every block sits in
    /// the write buffer.
    pub(crate) fn submit_user_write(&self, wio: &mut WriteIo) -> Result<()> {
        self.rwb_fill(&mut wio.io)?;

        let buf = wio.io.buf.take().expect("write submitted twice");
        let cb = wio.cb.take().expect("write submitted twice");
        cb(buf, Ok(()));
        Ok(())
    }

    // ===== Bring-up =====

    fn retrieve_chunk_info(
        ctrlr: &Arc<dyn MediaController>,
        geo: &Geometry,
        punit: u32,
    ) -> Result<Vec<ChunkInfo>> {
        let num_chk = geo.num_chk as usize;
        let grp = (punit % geo.num_grp) as usize;
        let pu = (punit / geo.num_grp) as usize;
        let base = (grp * geo.num_pu as usize + pu) * num_chk;

        let mut info = vec![
            ChunkInfo {
                state: MediaChunkState::Free,
                write_ptr: 0,
            };
            num_chk
        ];

        let mut off = 0;
        while off < num_chk {
            let cnt = CHUNK_INFO_ENTRIES.min(num_chk - off);
            if ctrlr.chunk_info(base + off, &mut info[off..off + cnt]).is_err() {
                bail!(IoFailed, "unable to retrieve the chunk information log");
            }
            off += cnt;
        }

        Ok(info)
    }

    fn chunk_state_from_media(state: MediaChunkState) -> ChunkState {
        match state {
            MediaChunkState::Free => ChunkState::Free,
            // Dirty shutdown recovery of open chunks is not supported;
            // treat them as closed.
            MediaChunkState::Open => ChunkState::Closed,
            MediaChunkState::Closed => ChunkState::Closed,
            MediaChunkState::Offline => ChunkState::Bad,
            MediaChunkState::Reserved => ChunkState::Vacant,
        }
    }

    /// Build the device skeleton: geometry, punits, bands populated from
    /// the chunk information log. Bands start out closed; empty ones are
    /// resolved later by `finalize_bands`.
    fn open_bare(
        ctrlr: Arc<dyn MediaController>,
        name: String,
        uuid: Uuid,
        conf: OcssdConf,
        range: PunitRange,
        read_isolation: bool,
    ) -> Result<Dev> {
        let geo = ctrlr.geometry();
        let xfer_size = geo.ws_opt as usize;
        conf.validate(xfer_size)?;

        if range.begin > range.end || range.end as usize >= geo.total_punits() {
            bail!(InvalidArgs, "punit range outside the device geometry");
        }

        let md_size = ctrlr.md_size();
        if md_size % core::mem::size_of::<u32>() != 0 {
            // The metadata pointer must be dword aligned.
            bail!(Unsupported, "unsupported metadata size");
        }

        let fmt = PpaFormat::new(&geo);
        let num_punits = range.num_punits();
        let num_band_lbks = num_punits * geo.clba as usize;
        let layout = MdLayout {
            num_band_lbks,
            xfer_size,
        };

        let punits: Vec<Punit> = (0..num_punits)
            .map(|i| {
                let punit = range.begin + i as u32;
                Punit {
                    start_ppa: Ppa::new(punit % geo.num_grp, punit / geo.num_grp, 0, 0),
                }
            })
            .collect();

        // One band per chunk index, one chunk per operational punit.
        let mut chunk_states = Vec::with_capacity(num_punits);
        for punit in punits.iter() {
            let info = Self::retrieve_chunk_info(
                &ctrlr,
                &geo,
                punit.start_ppa.pu() * geo.num_grp + punit.start_ppa.grp(),
            )?;
            chunk_states.push(info);
        }

        let bands: Vec<Band> = (0..geo.num_chk as usize)
            .map(|id| {
                let chunks: Vec<Chunk> = punits
                    .iter()
                    .enumerate()
                    .map(|(pos, punit)| Chunk {
                        state: Self::chunk_state_from_media(chunk_states[pos][id].state),
                        start_ppa: punit.start_ppa.with_chk(id as u32),
                        pos,
                    })
                    .collect();
                Band::new(id, chunks, num_band_lbks)
            })
            .collect();

        let shut_bands: Vec<BandId> = bands
            .iter()
            .filter(|band| band.has_chunks())
            .map(|band| band.id)
            .collect();

        let rwb = Rwb::new(conf.rwb_size, xfer_size, md_size)?;
        let lba_pool = LbaMapPool::new(num_band_lbks);

        let core_qpair = ctrlr.alloc_io_qpair();
        let read_qpair = if read_isolation {
            ctrlr.alloc_io_qpair()
        } else {
            core_qpair
        };

        Ok(Dev {
            name,
            uuid,
            conf,
            geo,
            fmt,
            layout,
            range,
            md_size,
            xfer_size,
            punits,
            bands: bands.into_boxed_slice(),
            free_bands: SpinLock::new(Vec::new()),
            shut_bands: SpinLock::new(shut_bands),
            num_free: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            l2p: L2pTable::new(0, fmt),
            global_l2p_len: AtomicU64::new(0),
            rwb,
            limit: AtomicUsize::new(LimitTier::COUNT),
            stats: Stats::new(),
            num_inflight: AtomicUsize::new(0),
            lba_pool,
            ctrlr,
            core_thread: ThreadCtl::new("ocssd_core"),
            read_thread: ThreadCtl::new("ocssd_read"),
            core_qpair,
            read_qpair,
            read_isolation,
        })
    }

    /// Create-mode capacity: total usable blocks minus the configured
    /// reserve.
    fn setup_initial_state(&mut self) {
        let total: usize = self
            .bands
            .iter()
            .map(|band| band.num_usable_lbks(self))
            .sum();
        let l2p_len = (total * (100 - self.conf.lba_rsvd) / 100) as u64;
        self.l2p = L2pTable::new(l2p_len, self.fmt);
    }

    /// Settle the band states after create or restore: pick up the highest
    /// sequence number, free every empty band and reset the limit
    /// statistics skewed by initialization.
    fn finalize_bands(&self) -> Result<()> {
        let shut: Vec<BandId> = self.shut_bands.lock().clone();

        let free_candidates = shut
            .iter()
            .filter(|&&id| self.bands[id].has_chunks() && self.bands[id].is_empty())
            .count();
        if free_candidates == 0 {
            bail!(OutOfSpace, "device has no free bands");
        }

        let max_seq = shut
            .iter()
            .map(|&id| self.bands[id].md.lock().seq)
            .max()
            .unwrap_or(0);
        self.seq.store(max_seq, Ordering::Release);

        for id in shut {
            if self.bands[id].is_empty() {
                self.bands[id].set_state(self, BandState::Free);
            }
        }

        // The limit counters were incremented while the free list was
        // being populated; start counting from a clean slate.
        for counter in &self.stats.limits {
            counter.store(0, Ordering::Relaxed);
        }

        Ok(())
    }
}

/// Process-wide library context: owns the notification manager thread and
/// the open-device registry.
pub struct OcssdContext {
    pub(crate) anm: Anm,
    devices: SpinLock<Vec<DeviceRecord>>,
    next_id: AtomicUsize,
}

struct DeviceRecord {
    id: usize,
    ctrlr: Arc<dyn MediaController>,
    range: PunitRange,
}

impl OcssdContext {
    /// Start the library context (including the notification thread).
    pub fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            anm: Anm::start()?,
            devices: SpinLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }))
    }

    fn check_range_free(&self, ctrlr: &Arc<dyn MediaController>, range: PunitRange) -> Result<()> {
        let devices = self.devices.lock();
        for record in devices.iter() {
            if Arc::ptr_eq(&record.ctrlr, ctrlr) && record.range.intersects(&range) {
                bail!(InvalidArgs, "punit range overlaps an open device");
            }
        }
        Ok(())
    }

    fn register_device(&self, ctrlr: Arc<dyn MediaController>, range: PunitRange) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.devices.lock().push(DeviceRecord { id, ctrlr, range });
        id
    }

    fn unregister_device(&self, id: usize) {
        self.devices.lock().retain(|record| record.id != id);
    }
}

impl std::fmt::Debug for OcssdDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcssdDev")
            .field("record_id", &self.record_id)
            .finish()
    }
}

/// An open flash-translated device.
pub struct OcssdDev {
    inner: Arc<Dev>,
    ctx: Arc<OcssdContext>,
    record_id: usize,
    anm_token: SpinLock<Option<usize>>,
    core_handle: Option<JoinHandle<()>>,
    read_handle: Option<JoinHandle<()>>,
}

impl OcssdDev {
    /// Open a device on a controller.
    pub fn init(ctx: &Arc<OcssdContext>, opts: InitOpts) -> Result<Self> {
        let create = opts.mode.contains(Mode::CREATE);
        let read_isolation = opts.mode.contains(Mode::READ_ISOLATION);

        let uuid = match (create, opts.uuid) {
            (_, Some(uuid)) if !uuid.is_nil() => uuid,
            (true, _) => Uuid::new_v4(),
            (false, _) => {
                bail!(InvalidArgs, "non-zero uuid required in restore mode")
            }
        };

        ctx.check_range_free(&opts.ctrlr, opts.range)?;

        let mut dev = Dev::open_bare(
            opts.ctrlr.clone(),
            opts.name,
            uuid,
            opts.conf.unwrap_or_default(),
            opts.range,
            read_isolation,
        )?;

        // In create mode just size the L2P; when restoring, read enough to
        // verify the data is correct, then rebuild the full state.
        if create {
            dev.setup_initial_state();
        } else {
            let mut restore = restore::check_device(&dev)?;
            let l2p_len = dev.global_l2p_len.load(Ordering::Acquire);
            if l2p_len == 0 {
                bail!(CorruptedMeta, "restored capacity is zero");
            }
            dev.l2p = L2pTable::new(l2p_len, dev.fmt);
            restore::restore_state(&dev, &mut restore)?;
        }

        dev.finalize_bands()?;

        let dev = Arc::new(dev);

        let mut core_ctx = CoreCtx::new(dev.clone())?;
        core_ctx.reloc.resume();
        let core_handle = std::thread::Builder::new()
            .name(dev.core_thread.name().to_string())
            .spawn(move || core_loop(core_ctx))
            .map_err(|_| OutOfMemory.reason("failed to spawn the core thread"))?;

        let read_handle = if read_isolation {
            let read_dev = dev.clone();
            Some(
                std::thread::Builder::new()
                    .name(dev.read_thread.name().to_string())
                    .spawn(move || read_loop(read_dev))
                    .map_err(|_| OutOfMemory.reason("failed to spawn the read thread"))?,
            )
        } else {
            dev.read_thread.set_initialized();
            None
        };

        let core_ready = || dev.core_thread.is_initialized();
        let read_ready = || dev.read_thread.is_initialized();
        if let Err(err) = wait_initialized(&[&core_ready, &read_ready], INIT_TIMEOUT) {
            dev.core_thread.stop();
            dev.read_thread.stop();
            let _ = core_handle.join();
            if let Some(handle) = read_handle {
                let _ = handle.join();
            }
            return Err(err);
        }

        ctx.anm.register_ctrlr(opts.ctrlr.clone());
        let record_id = ctx.register_device(opts.ctrlr, opts.range);

        info!("ocssd device {} is up", dev.name);
        Ok(Self {
            inner: dev,
            ctx: ctx.clone(),
            record_id,
            anm_token: SpinLock::new(None),
            core_handle: Some(core_handle),
            read_handle,
        })
    }

    pub fn attrs(&self) -> DevAttrs {
        DevAttrs {
            uuid: self.inner.uuid,
            lbk_cnt: self.inner.l2p.len(),
            lbk_size: BLOCK_SIZE,
        }
    }

    /// The currently applied write limit tier, if any.
    pub fn current_limit(&self) -> Option<LimitTier> {
        self.inner.current_limit()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        let mut limits = [0; LimitTier::COUNT];
        for (out, counter) in limits.iter_mut().zip(&stats.limits) {
            *out = counter.load(Ordering::Relaxed);
        }
        StatsSnapshot {
            write_user: stats.write_user.load(Ordering::Relaxed),
            write_total: stats.write_total.load(Ordering::Relaxed),
            limits,
        }
    }

    fn check_running(&self) -> Result<()> {
        if !self.inner.core_thread.is_running() {
            bail!(ShuttingDown);
        }
        Ok(())
    }

    fn check_lba_range(&self, lba: Lba, lbk_cnt: usize) -> Result<()> {
        if lbk_cnt == 0 {
            bail!(InvalidArgs, "zero-length io");
        }
        let end = lba
            .checked_add(lbk_cnt as u64)
            .ok_or(InvalidArgs.reason("lba range overflow"))?;
        if end > self.inner.l2p.len() {
            bail!(InvalidArgs, "io beyond the device capacity");
        }
        Ok(())
    }

    /// Read `buf.nblocks()` blocks starting at `lba`. Blocks that were
    /// never written leave the buffer untouched.
    pub fn read(&self, lba: Lba, buf: Buf, cb: ReadCb) -> Result<()> {
        self.check_running()?;
        self.check_lba_range(lba, buf.nblocks())?;

        let io = ReadIo {
            lba,
            lbk_cnt: buf.nblocks(),
            buf,
            cb,
        };

        // Without read isolation the core thread drains the read ring.
        self.inner.read_thread.send(ReadMsg::User(io));
        Ok(())
    }

    /// Absorb a write. On `Errno::TryAgain` the request keeps its progress
    /// and may be resubmitted once write credit frees up.
    pub fn write(&self, io: &mut WriteIo) -> Result<()> {
        self.check_running()?;
        self.check_lba_range(io.io.lba, io.io.lbk_cnt)?;
        self.inner.submit_user_write(io)
    }

    /// Complete once everything sitting in the write buffer at call time
    /// has hit the media.
    pub fn flush(&self, cb: FlushCb) -> Result<()> {
        self.check_running()?;
        self.inner
            .core_thread
            .send(Box::new(move |ctx: &mut CoreCtx| ctx.flush(cb)));
        Ok(())
    }

    /// Subscribe to media-health events concerning this device's punits.
    pub fn register_notification_handler(&self, handler: AnmHandler) -> Result<()> {
        let token = self.ctx.anm.register_device(
            &self.inner.ctrlr,
            self.inner.geo,
            self.inner.range,
            handler,
        )?;
        *self.anm_token.lock() = Some(token);
        Ok(())
    }
}

impl Drop for OcssdDev {
    fn drop(&mut self) {
        let dev = &self.inner;

        // Stop feeding the relocator, then let the core loop drain and pad
        // the pipeline until no write pointer remains.
        dev.core_thread
            .send(Box::new(|ctx: &mut CoreCtx| ctx.reloc.halt()));
        dev.core_thread.stop();
        dev.read_thread.stop();

        if let Some(handle) = self.core_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.read_handle.take() {
            let _ = handle.join();
        }

        if let Some(token) = self.anm_token.lock().take() {
            self.ctx.anm.unregister_device(&dev.ctrlr, token);
        }
        self.ctx.unregister_device(self.record_id);
        self.ctx.anm.unregister_ctrlr(&dev.ctrlr);

        dev.ctrlr.free_io_qpair(dev.core_qpair);
        if dev.read_isolation {
            dev.ctrlr.free_io_qpair(dev.read_qpair);
        }

        info!("ocssd device {} is down", dev.name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        geom::{LbaFormat, LBA_INVALID},
        media::MemController,
        reader,
        rwb::EntryType,
    };
    use core::sync::atomic::AtomicBool;

    /// Geometry of the original band arithmetic tests; clba is deliberately
    /// not a multiple of the transfer size.
    pub(crate) const TEST_GEO: Geometry = Geometry {
        num_grp: 4,
        num_pu: 3,
        num_chk: 1500,
        clba: 100,
        ws_opt: 16,
        ws_min: 4,
        lbaf: LbaFormat {
            grp_len: 2,
            pu_len: 2,
            chk_len: 11,
            lbk_len: 7,
        },
    };

    pub(crate) const TEST_RANGE: PunitRange = PunitRange { begin: 2, end: 9 };

    pub(crate) const TEST_BAND_IDX: usize = 68;

    /// A small, transfer-aligned geometry for end-to-end IO tests.
    pub(crate) const IO_GEO: Geometry = Geometry {
        num_grp: 2,
        num_pu: 2,
        num_chk: 8,
        clba: 64,
        ws_opt: 16,
        ws_min: 4,
        lbaf: LbaFormat {
            grp_len: 1,
            pu_len: 1,
            chk_len: 3,
            lbk_len: 7,
        },
    };

    pub(crate) const IO_RANGE: PunitRange = PunitRange { begin: 0, end: 3 };

    pub(crate) fn test_dev_on(ctrlr: Arc<MemController>) -> Arc<Dev> {
        let mut dev = Dev::open_bare(
            ctrlr,
            "test".to_string(),
            Uuid::new_v4(),
            OcssdConf::default(),
            TEST_RANGE,
            false,
        )
        .unwrap();
        dev.setup_initial_state();
        Arc::new(dev)
    }

    pub(crate) fn test_dev() -> Arc<Dev> {
        test_dev_on(Arc::new(MemController::new(TEST_GEO)))
    }

    fn io_dev_with_uuid(ctrlr: Arc<MemController>, uuid: Uuid) -> (Arc<Dev>, CoreCtx) {
        let mut dev = Dev::open_bare(
            ctrlr,
            "io-test".to_string(),
            uuid,
            OcssdConf::default(),
            IO_RANGE,
            false,
        )
        .unwrap();
        dev.setup_initial_state();
        dev.finalize_bands().unwrap();

        let dev = Arc::new(dev);
        let mut ctx = CoreCtx::new(dev.clone()).unwrap();
        ctx.reloc.resume();
        (dev, ctx)
    }

    fn io_dev_restore(ctrlr: Arc<MemController>, uuid: Uuid) -> (Arc<Dev>, CoreCtx) {
        let mut dev = Dev::open_bare(
            ctrlr,
            "io-test".to_string(),
            uuid,
            OcssdConf::default(),
            IO_RANGE,
            false,
        )
        .unwrap();

        let mut restore = restore::check_device(&dev).unwrap();
        let l2p_len = dev.global_l2p_len.load(Ordering::Acquire);
        assert_ne!(l2p_len, 0);
        dev.l2p = L2pTable::new(l2p_len, dev.fmt);
        restore::restore_state(&dev, &mut restore).unwrap();
        dev.finalize_bands().unwrap();

        let dev = Arc::new(dev);
        let mut ctx = CoreCtx::new(dev.clone()).unwrap();
        ctx.reloc.resume();
        (dev, ctx)
    }

    fn write_block(dev: &Dev, lba: Lba, fill: u8) {
        let mut buf = Buf::alloc(1).unwrap();
        buf.fill(fill);
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        let mut io = WriteIo::new(
            lba,
            buf,
            Box::new(move |_buf, status| {
                assert!(status.is_ok());
                done_clone.store(true, Ordering::Release);
            }),
        )
        .unwrap();
        dev.submit_user_write(&mut io).unwrap();
        assert!(done.load(Ordering::Acquire));
    }

    fn read_block(dev: &Dev, lba: Lba) -> Vec<u8> {
        let buf = Buf::alloc(1).unwrap();
        let out: Arc<SpinLock<Vec<u8>>> = Arc::new(SpinLock::new(Vec::new()));
        let out_clone = out.clone();
        let io = ReadIo {
            lba,
            lbk_cnt: 1,
            buf,
            cb: Box::new(move |buf, status| {
                assert!(status.is_ok());
                *out_clone.lock() = buf.to_vec();
            }),
        };
        reader::process_read(dev, io);
        let data = out.lock().clone();
        data
    }

    fn tick_until(ctx: &mut CoreCtx, mut cond: impl FnMut(&CoreCtx) -> bool) {
        for _ in 0..10_000 {
            if cond(ctx) {
                return;
            }
            ctx.tick();
        }
        panic!("condition never became true");
    }

    #[test]
    fn create_mode_capacity() {
        let dev = test_dev();
        // 1500 bands of 8 chunks * 100 blocks, minus the 20% reserve.
        assert_eq!(dev.l2p.len(), 1500 * 800 * 80 / 100);
        assert_eq!(dev.num_band_lbks(), 800);
        assert_eq!(dev.num_punits(), 8);

        // Punits cover the configured slice of the flattened numbering.
        assert_eq!(dev.punits[0].start_ppa.grp(), TEST_RANGE.begin % TEST_GEO.num_grp);
        assert_eq!(dev.punits[0].start_ppa.pu(), TEST_RANGE.begin / TEST_GEO.num_grp);
        assert_eq!(dev.flatten_punit(dev.punits[7].start_ppa), 7);
    }

    #[test]
    fn cache_coherence_through_write_completion() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let (dev, mut ctx) = io_dev_with_uuid(mem, Uuid::new_v4());

        write_block(&dev, 42, 0x42);

        // The L2P points into the write buffer and reads hit the cache.
        let ppa = dev.l2p.get(42);
        assert!(ppa.is_cached());
        let entry_pos = ppa.cache_offset() as usize;
        assert_eq!(read_block(&dev, 42), vec![0x42u8; BLOCK_SIZE]);

        // Complete the batch.
        for lba in 0..15 {
            write_block(&dev, 100 + lba, lba as u8);
        }
        tick_until(&mut ctx, |_| !dev.l2p.get(42).is_cached());

        let ppa = dev.l2p.get(42);
        assert!(!ppa.is_invalid() && !ppa.is_cached());
        assert!(!dev.rwb.entry_from_offset(entry_pos).is_valid());
        // The band accounts for the address.
        let band = dev.band_from_ppa(ppa);
        assert!(band.lbkoff_valid(band.lbkoff_from_ppa(&dev, ppa)));

        // Reads now come from the media.
        assert_eq!(read_block(&dev, 42), vec![0x42u8; BLOCK_SIZE]);
    }

    #[test]
    fn flush_pads_partial_batches() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let (dev, mut ctx) = io_dev_with_uuid(mem, Uuid::new_v4());

        // Less than a transfer size worth of user writes.
        for lba in 0..3 {
            write_block(&dev, lba, 0x68);
        }

        let flushed = Arc::new(AtomicBool::new(false));
        let flushed_clone = flushed.clone();
        ctx.flush(Box::new(move |status| {
            assert!(status.is_ok());
            flushed_clone.store(true, Ordering::Release);
        }));

        tick_until(&mut ctx, |_| flushed.load(Ordering::Acquire));

        // The padded batch has drained completely.
        assert_eq!(dev.rwb.num_acquired(EntryType::User), 0);
        assert_eq!(dev.rwb.num_acquired(EntryType::Internal), 0);
        assert!(!dev.l2p.get(0).is_cached());
    }

    #[test]
    fn last_write_wins_on_overwrite() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let (dev, mut ctx) = io_dev_with_uuid(mem, Uuid::new_v4());

        write_block(&dev, 7, 0x01);
        write_block(&dev, 7, 0x02);
        assert_eq!(read_block(&dev, 7), vec![0x02u8; BLOCK_SIZE]);

        // Fill and drain; the final copy must survive.
        for lba in 0..14 {
            write_block(&dev, 100 + lba, lba as u8);
        }
        tick_until(&mut ctx, |_| !dev.l2p.get(7).is_cached());
        assert_eq!(read_block(&dev, 7), vec![0x02u8; BLOCK_SIZE]);

        // Exactly one valid copy remains in the band metadata.
        let ppa = dev.l2p.get(7);
        let band = dev.band_from_ppa(ppa);
        assert!(band.lbkoff_valid(band.lbkoff_from_ppa(&dev, ppa)));
    }

    fn drive_shutdown(dev: &Arc<Dev>, ctx: &mut CoreCtx) {
        ctx.reloc.halt();
        dev.core_thread.stop();
        for _ in 0..10_000 {
            ctx.tick();
            if ctx.shutdown_complete() {
                return;
            }
        }
        panic!("shutdown never completed");
    }

    #[test]
    fn restore_after_writes() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let uuid = Uuid::new_v4();

        {
            let (dev, mut ctx) = io_dev_with_uuid(mem.clone(), uuid);
            write_block(&dev, 1, 0x11);
            write_block(&dev, 5, 0x55);
            write_block(&dev, 42, 0xaa);

            let flushed = Arc::new(AtomicBool::new(false));
            let flushed_clone = flushed.clone();
            ctx.flush(Box::new(move |status| {
                assert!(status.is_ok());
                flushed_clone.store(true, Ordering::Release);
            }));
            tick_until(&mut ctx, |_| flushed.load(Ordering::Acquire));

            drive_shutdown(&dev, &mut ctx);
        }

        // Reopen the same media in restore mode.
        let (dev, _ctx) = io_dev_restore(mem, uuid);

        for (lba, fill) in [(1u64, 0x11u8), (5, 0x55), (42, 0xaa)] {
            let ppa = dev.l2p.get(lba);
            assert!(!ppa.is_invalid() && !ppa.is_cached());
            let band = dev.band_from_ppa(ppa);
            assert!(band.lbkoff_valid(band.lbkoff_from_ppa(&dev, ppa)));
            assert_eq!(read_block(&dev, lba), vec![fill; BLOCK_SIZE]);
        }

        // Nothing else must have surfaced.
        for lba in [0u64, 2, 3, 4, 6, 43, 100] {
            assert!(dev.l2p.get(lba).is_invalid());
        }

        // Bands without valid data are free again.
        for band in dev.bands.iter() {
            if band.has_chunks() && band.is_empty() {
                assert!(band.check_state(BandState::Free));
            }
        }
    }

    #[test]
    fn admission_limits_follow_free_bands() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let (dev, _ctx) = io_dev_with_uuid(mem, Uuid::new_v4());

        // 8 free bands with the default thresholds: the HIGH tier (10 free
        // bands) applies.
        assert_eq!(dev.current_limit(), Some(LimitTier::High));
        let limits = dev.rwb.get_limits();
        assert_eq!(
            limits[EntryType::User as usize],
            5 * dev.rwb.entry_cnt() / 100
        );
        // Internal writes keep the full credit.
        assert_eq!(limits[EntryType::Internal as usize], dev.rwb.entry_cnt());
    }

    #[test]
    fn write_failure_triggers_priority_relocation() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let (dev, mut ctx) = io_dev_with_uuid(mem.clone(), Uuid::new_v4());

        // The first write pointer lands on the first free band and its
        // first data batch goes to the second chunk of the stripe.
        let first_band = dev.free_bands.lock()[0];
        mem.fail_next_write(dev.fmt.pack(Ppa::new(1, 0, first_band as u32, 0)));

        for lba in 0..16 {
            write_block(&dev, lba, 0x77);
        }

        // The failed batch is reverted and rewritten onto a fresh band.
        tick_until(&mut ctx, |_| {
            let ppa = dev.l2p.get(0);
            !ppa.is_cached() && !ppa.is_invalid()
        });

        let ppa = dev.l2p.get(0);
        assert_ne!(ppa.chk() as usize, first_band);
        assert_eq!(read_block(&dev, 0), vec![0x77u8; BLOCK_SIZE]);

        // The failed band drains through the priority queue and frees up.
        tick_until(&mut ctx, |_| {
            dev.bands[first_band].check_state(BandState::Free)
        });
        assert!(!dev.bands[first_band]
            .high_prio
            .load(Ordering::Acquire));
        assert!(dev.bands[first_band].is_empty());
    }

    #[test]
    fn erase_failure_shrinks_the_band() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let (dev, mut ctx) = io_dev_with_uuid(mem.clone(), Uuid::new_v4());

        let band_id = dev.free_bands.lock()[1];
        let band = &dev.bands[band_id];
        assert_eq!(band.num_chunks(), 4);

        // A chunk that still holds data gets reset on reuse; make that
        // reset fail.
        let start_ppa = band.chunks.lock().slots[2].start_ppa;
        band.chunks.lock().slots[2].state = ChunkState::Closed;
        mem.fail_next_reset(dev.fmt.pack(start_ppa));

        ctx.band_erase(band_id);
        ctx.tick();

        assert_eq!(band.num_chunks(), 3);
        assert!(band.chunks.lock().slots[2].is_bad());
        // The remaining chunks keep the band usable.
        assert_eq!(band.num_usable_lbks(&dev), 3 * dev.lbks_in_chunk());
    }

    #[test]
    fn write_admission_resumes_after_try_again() {
        let mem = Arc::new(MemController::new(IO_GEO));
        let (dev, _ctx) = io_dev_with_uuid(mem, Uuid::new_v4());

        assert!(WriteIo::new(LBA_INVALID, Buf::alloc(1).unwrap(), Box::new(|_, _| ())).is_err());

        // One entry of user credit: a two-block write absorbs one block
        // and asks to be retried.
        dev.rwb.set_limits([dev.rwb.entry_cnt(), 1]);

        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        let mut io = WriteIo::new(
            0,
            Buf::alloc(2).unwrap(),
            Box::new(move |_, status| {
                assert!(status.is_ok());
                done_clone.store(true, Ordering::Release);
            }),
        )
        .unwrap();

        let err = dev.submit_user_write(&mut io).unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::TryAgain);
        assert_eq!(io.io.pos, 1);
        assert!(!done.load(Ordering::Acquire));

        // Credit comes back; the request picks up where it left off.
        dev.rwb.set_limits([dev.rwb.entry_cnt(), dev.rwb.entry_cnt()]);
        dev.submit_user_write(&mut io).unwrap();
        assert!(done.load(Ordering::Acquire));
        assert!(dev.l2p.get(0).is_cached());
        assert!(dev.l2p.get(1).is_cached());
    }
}
