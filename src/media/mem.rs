// SPDX-License-Identifier: MPL-2.0

//! A memory-backed open-channel controller.
//!
//! `MemController` enforces the open-channel discipline for real: writes
//! within a chunk must land exactly at the chunk's write pointer, a chunk
//! must be reset before it can be rewritten, and reset failures take the
//! chunk offline for good. Chunk storage is allocated lazily, so huge
//! geometries stay cheap as long as only a few chunks are touched.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::RwLock;

use super::{
    AerCallback, ChunkInfo, ChunkNotification, MediaChunkState, MediaController, MediaError,
    MediaResult, NotificationMask, QpairId,
};
use crate::{
    geom::{Geometry, PpaFormat, BLOCK_SIZE},
    prelude::*,
};

struct MemChunk {
    state: MediaChunkState,
    write_ptr: u32,
    data: Vec<u8>,
}

impl MemChunk {
    fn new(clba: u32) -> Self {
        Self {
            state: MediaChunkState::Free,
            write_ptr: 0,
            data: vec![0; clba as usize * BLOCK_SIZE],
        }
    }
}

/// Flattened global parallel unit number and chunk index.
type ChunkKey = (u32, u32);

#[derive(Default)]
struct FaultSet {
    write: HashSet<ChunkKey>,
    reset: HashSet<ChunkKey>,
    read_high_ecc: HashSet<ChunkKey>,
}

pub struct MemController {
    geo: Geometry,
    fmt: PpaFormat,
    md_size: usize,
    chunks: SpinLock<HashMap<ChunkKey, MemChunk>>,
    faults: SpinLock<FaultSet>,
    notifications: SpinLock<Vec<ChunkNotification>>,
    notification_counter: AtomicU64,
    aer_cb: RwLock<Option<AerCallback>>,
    next_qpair: AtomicUsize,
}

impl MemController {
    pub fn new(geo: Geometry) -> Self {
        Self {
            fmt: PpaFormat::new(&geo),
            geo,
            md_size: 0,
            chunks: SpinLock::new(HashMap::new()),
            faults: SpinLock::new(FaultSet::default()),
            notifications: SpinLock::new(Vec::new()),
            notification_counter: AtomicU64::new(0),
            aer_cb: RwLock::new(None),
            next_qpair: AtomicUsize::new(0),
        }
    }

    fn key_of(&self, ppa: u64) -> (ChunkKey, u32) {
        let ppa = self.fmt.unpack(ppa);
        let punit = ppa.pu() * self.geo.num_grp + ppa.grp();
        ((punit, ppa.chk()), ppa.lbk())
    }

    fn check_key(&self, key: ChunkKey, lbk: u32) -> MediaResult {
        if key.0 >= self.geo.num_grp * self.geo.num_pu
            || key.1 >= self.geo.num_chk
            || lbk >= self.geo.clba
        {
            return Err(MediaError::OutOfRange);
        }
        Ok(())
    }

    /// Make the next write to the chunk containing `ppa` fail.
    pub fn fail_next_write(&self, ppa: u64) {
        let (key, _) = self.key_of(ppa);
        self.faults.lock().write.insert(key);
    }

    /// Make the next reset of the chunk containing `ppa` fail and take the
    /// chunk offline.
    pub fn fail_next_reset(&self, ppa: u64) {
        let (key, _) = self.key_of(ppa);
        self.faults.lock().reset.insert(key);
    }

    /// Make the next read of the chunk containing `ppa` report high-ECC.
    pub fn read_high_ecc_once(&self, ppa: u64) {
        let (key, _) = self.key_of(ppa);
        self.faults.lock().read_high_ecc.insert(key);
    }

    /// Force a chunk into a media state, allocating it if needed. Used to
    /// seed bad-block tables for bring-up tests.
    pub fn set_chunk_state(&self, ppa: u64, state: MediaChunkState) {
        let (key, _) = self.key_of(ppa);
        let mut chunks = self.chunks.lock();
        let chunk = chunks
            .entry(key)
            .or_insert_with(|| MemChunk::new(self.geo.clba));
        chunk.state = state;
    }

    /// Append a chunk notification and fire the asynchronous event callback.
    pub fn notify_chunk(&self, ppa: u64, mask: NotificationMask) {
        let nc = self.notification_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.notifications
            .lock()
            .push(ChunkNotification { nc, ppa, mask });

        if let Some(cb) = self.aer_cb.read().as_ref() {
            cb();
        }
    }
}

impl MediaController for MemController {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn md_size(&self) -> usize {
        self.md_size
    }

    fn alloc_io_qpair(&self) -> QpairId {
        self.next_qpair.fetch_add(1, Ordering::Relaxed)
    }

    fn free_io_qpair(&self, _qpair: QpairId) {}

    fn read(&self, _qpair: QpairId, ppa: u64, lbk_cnt: usize, buf: &mut [u8]) -> MediaResult {
        assert_eq!(buf.len(), lbk_cnt * BLOCK_SIZE);

        let (key, lbk) = self.key_of(ppa);
        self.check_key(key, lbk)?;
        if lbk as usize + lbk_cnt > self.geo.clba as usize {
            return Err(MediaError::OutOfRange);
        }

        if self.faults.lock().read_high_ecc.remove(&key) {
            return Err(MediaError::ReadHighEcc);
        }

        let chunks = self.chunks.lock();
        match chunks.get(&key) {
            Some(chunk) => {
                let start = lbk as usize * BLOCK_SIZE;
                buf.copy_from_slice(&chunk.data[start..start + buf.len()]);
            }
            // Never written since the last reset.
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&self, _qpair: QpairId, ppa: u64, bufs: &[&[u8]], md: Option<&[u8]>) -> MediaResult {
        let lbk_cnt: usize = bufs.iter().map(|buf| buf.len() / BLOCK_SIZE).sum();
        debug_assert!(bufs.iter().all(|buf| buf.len() % BLOCK_SIZE == 0));
        if let Some(md) = md {
            debug_assert_eq!(md.len(), lbk_cnt * self.md_size.max(1));
        }

        let (key, lbk) = self.key_of(ppa);
        self.check_key(key, lbk)?;
        if lbk as usize + lbk_cnt > self.geo.clba as usize {
            return Err(MediaError::OutOfRange);
        }

        if self.faults.lock().write.remove(&key) {
            return Err(MediaError::WriteFailed);
        }

        let mut chunks = self.chunks.lock();
        let chunk = chunks
            .entry(key)
            .or_insert_with(|| MemChunk::new(self.geo.clba));

        match chunk.state {
            MediaChunkState::Free => chunk.state = MediaChunkState::Open,
            MediaChunkState::Open => (),
            _ => return Err(MediaError::WriteFailed),
        }
        // Writes within a chunk are sequential.
        if chunk.write_ptr != lbk {
            return Err(MediaError::WriteFailed);
        }

        let mut pos = lbk as usize * BLOCK_SIZE;
        for buf in bufs {
            chunk.data[pos..pos + buf.len()].copy_from_slice(buf);
            pos += buf.len();
        }

        chunk.write_ptr += lbk_cnt as u32;
        if chunk.write_ptr == self.geo.clba {
            chunk.state = MediaChunkState::Closed;
        }
        Ok(())
    }

    fn vector_reset(&self, _qpair: QpairId, ppas: &[u64]) -> MediaResult {
        for &ppa in ppas {
            let (key, lbk) = self.key_of(ppa);
            self.check_key(key, lbk)?;

            let mut chunks = self.chunks.lock();
            if self.faults.lock().reset.remove(&key) {
                let chunk = chunks
                    .entry(key)
                    .or_insert_with(|| MemChunk::new(self.geo.clba));
                chunk.state = MediaChunkState::Offline;
                return Err(MediaError::ResetFailed);
            }

            // Dropping the storage models the erase; reads of a free chunk
            // return zeroes.
            chunks.remove(&key);
        }
        Ok(())
    }

    fn chunk_info(&self, offset: usize, out: &mut [ChunkInfo]) -> MediaResult {
        let total =
            self.geo.num_grp as usize * self.geo.num_pu as usize * self.geo.num_chk as usize;
        if offset + out.len() > total {
            return Err(MediaError::OutOfRange);
        }

        let chunks = self.chunks.lock();
        for (i, info) in out.iter_mut().enumerate() {
            let idx = offset + i;
            let num_chk = self.geo.num_chk as usize;
            let num_pu = self.geo.num_pu as usize;
            // The log page is ordered group-major, then parallel unit,
            // then chunk.
            let grp = (idx / (num_pu * num_chk)) as u32;
            let pu = ((idx / num_chk) % num_pu) as u32;
            let chk = (idx % num_chk) as u32;
            let key = (pu * self.geo.num_grp + grp, chk);

            *info = match chunks.get(&key) {
                Some(chunk) => ChunkInfo {
                    state: chunk.state,
                    write_ptr: chunk.write_ptr,
                },
                None => ChunkInfo {
                    state: MediaChunkState::Free,
                    write_ptr: 0,
                },
            };
        }
        Ok(())
    }

    fn chunk_notifications(
        &self,
        out: &mut [ChunkNotification],
    ) -> core::result::Result<usize, MediaError> {
        let log = self.notifications.lock();
        let cnt = log.len().min(out.len());
        // Serve the newest entries; older ones have been superseded by the
        // notification counter filter on the consumer side.
        let start = log.len() - cnt;
        out[..cnt].copy_from_slice(&log[start..]);
        Ok(cnt)
    }

    fn register_aer_callback(&self, cb: Option<AerCallback>) {
        *self.aer_cb.write() = cb;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{LbaFormat, Ppa};

    fn test_ctrlr() -> MemController {
        MemController::new(Geometry {
            num_grp: 2,
            num_pu: 2,
            num_chk: 8,
            clba: 32,
            ws_opt: 4,
            ws_min: 1,
            lbaf: LbaFormat {
                grp_len: 1,
                pu_len: 1,
                chk_len: 3,
                lbk_len: 5,
            },
        })
    }

    fn packed(ctrlr: &MemController, grp: u32, pu: u32, chk: u32, lbk: u32) -> u64 {
        ctrlr.fmt.pack(Ppa::new(grp, pu, chk, lbk))
    }

    #[test]
    fn sequential_write_discipline() {
        let ctrlr = test_ctrlr();
        let qp = ctrlr.alloc_io_qpair();
        let block = vec![0x68u8; BLOCK_SIZE];

        // First write must start at lbk 0.
        assert!(ctrlr
            .write(qp, packed(&ctrlr, 0, 0, 0, 4), &[&block], None)
            .is_err());
        assert!(ctrlr
            .write(qp, packed(&ctrlr, 0, 0, 0, 0), &[&block], None)
            .is_ok());
        // And continue at the write pointer.
        assert!(ctrlr
            .write(qp, packed(&ctrlr, 0, 0, 0, 2), &[&block], None)
            .is_err());
        assert!(ctrlr
            .write(qp, packed(&ctrlr, 0, 0, 0, 1), &[&block], None)
            .is_ok());

        let mut out = vec![0u8; BLOCK_SIZE];
        ctrlr
            .read(qp, packed(&ctrlr, 0, 0, 0, 1), 1, &mut out)
            .unwrap();
        assert_eq!(out, block);
    }

    #[test]
    fn reset_frees_chunk() {
        let ctrlr = test_ctrlr();
        let qp = ctrlr.alloc_io_qpair();
        let block = vec![0xabu8; BLOCK_SIZE];
        let ppa = packed(&ctrlr, 1, 0, 3, 0);

        ctrlr.write(qp, ppa, &[&block], None).unwrap();
        ctrlr.vector_reset(qp, &[ppa]).unwrap();

        let mut out = vec![0xffu8; BLOCK_SIZE];
        ctrlr.read(qp, ppa, 1, &mut out).unwrap();
        assert_eq!(out, vec![0u8; BLOCK_SIZE]);

        // Writable from scratch again.
        ctrlr.write(qp, ppa, &[&block], None).unwrap();
    }

    #[test]
    fn reset_failure_goes_offline() {
        let ctrlr = test_ctrlr();
        let qp = ctrlr.alloc_io_qpair();
        let ppa = packed(&ctrlr, 0, 1, 2, 0);

        ctrlr.fail_next_reset(ppa);
        assert_eq!(
            ctrlr.vector_reset(qp, &[ppa]),
            Err(MediaError::ResetFailed)
        );

        let mut info = [ChunkInfo {
            state: MediaChunkState::Free,
            write_ptr: 0,
        }];
        // grp 0, pu 1, chk 2 in group-major log ordering.
        let offset = (1 * ctrlr.geo.num_chk as usize) + 2;
        ctrlr.chunk_info(offset, &mut info).unwrap();
        assert_eq!(info[0].state, MediaChunkState::Offline);
    }

    #[test]
    fn notification_log() {
        let ctrlr = test_ctrlr();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_clone = fired.clone();
        ctrlr.register_aer_callback(Some(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        })));

        ctrlr.notify_chunk(packed(&ctrlr, 0, 0, 1, 0), NotificationMask::CHUNK);
        ctrlr.notify_chunk(packed(&ctrlr, 1, 1, 2, 0), NotificationMask::PU);
        assert_eq!(fired.load(Ordering::Relaxed), 2);

        let mut out = [ChunkNotification {
            nc: 0,
            ppa: 0,
            mask: NotificationMask::LBK,
        }; 4];
        let cnt = ctrlr.chunk_notifications(&mut out).unwrap();
        assert_eq!(cnt, 2);
        assert_eq!(out[0].nc, 1);
        assert_eq!(out[1].nc, 2);
        assert!(out[1].mask.contains(NotificationMask::PU));
    }
}
