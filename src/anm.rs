// SPDX-License-Identifier: MPL-2.0

//! The asynchronous notification manager (ANM).
//!
//! One background thread per context polls every registered controller's
//! chunk notification log and fans media-health events out to the devices
//! subscribed to the affected parallel units. The notification counter of
//! each controller filters out entries that were already seen.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{
    geom::{Geometry, Ppa, PpaFormat, PunitRange},
    media::{ChunkNotification, MediaController, NotificationMask},
    prelude::*,
};

/// Number of log entries read in a single log page call.
const ANM_LOG_ENTRIES: usize = 16;

/// Scope of a chunk notification event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnmRange {
    Lbk,
    Chk,
    Pu,
}

/// A media-health event delivered to a device's notification handler.
#[derive(Clone, Copy, Debug)]
pub struct AnmEvent {
    pub ppa: Ppa,
    pub range: AnmRange,
}

/// Handler a device registers for its events. The event is consumed (and
/// thereby freed) by the handler.
pub type AnmHandler = Box<dyn Fn(AnmEvent) + Send + Sync>;

struct AnmPoller {
    /// Token identifying the subscription for unregistration.
    token: usize,
    geo: Geometry,
    fmt: PpaFormat,
    range: PunitRange,
    handler: AnmHandler,
}

impl AnmPoller {
    fn in_range(&self, ppa: Ppa) -> bool {
        let punit = ppa.pu() * self.geo.num_grp + ppa.grp();
        punit >= self.range.begin && punit <= self.range.end
    }
}

struct AnmCtrlr {
    ctrlr: Arc<dyn MediaController>,
    /// Outstanding event counter; forces a log page read when non-zero.
    outstanding: Arc<AtomicU32>,
    /// Last seen notification counter.
    nc: u64,
    pollers: Vec<AnmPoller>,
}

impl AnmCtrlr {
    fn new(ctrlr: Arc<dyn MediaController>) -> Self {
        // Force an initial log page retrieval to consume events already
        // present on the controller.
        let outstanding = Arc::new(AtomicU32::new(1));

        let aer_counter = outstanding.clone();
        ctrlr.register_aer_callback(Some(Box::new(move || {
            aer_counter.fetch_add(1, Ordering::AcqRel);
        })));

        Self {
            ctrlr,
            outstanding,
            nc: 0,
            pollers: Vec::new(),
        }
    }

    fn log_range(log: &ChunkNotification) -> Option<AnmRange> {
        if log.mask.contains(NotificationMask::LBK) {
            return Some(AnmRange::Lbk);
        }
        if log.mask.contains(NotificationMask::CHUNK) {
            return Some(AnmRange::Chk);
        }
        if log.mask.contains(NotificationMask::PU) {
            return Some(AnmRange::Pu);
        }
        None
    }

    /// A log entry is fresh if its counter advances past the last one we
    /// saw. The counter baseline is taken from the first entry ever read.
    fn log_valid(&mut self, log: &ChunkNotification) -> bool {
        if self.nc == 0 && log.nc != 0 {
            self.nc = log.nc - 1;
        }

        if log.nc > self.nc {
            self.nc = log.nc;
            return true;
        }
        false
    }

    fn process_log(&mut self) {
        self.outstanding.store(0, Ordering::Release);

        let mut logs = [ChunkNotification {
            nc: 0,
            ppa: 0,
            mask: NotificationMask::empty(),
        }; ANM_LOG_ENTRIES];

        let cnt = match self.ctrlr.chunk_notifications(&mut logs) {
            Ok(cnt) => cnt,
            Err(err) => {
                error!("failed to read the chunk notification log: {:?}", err);
                return;
            }
        };

        let mut dispatched = false;
        for log in &logs[..cnt] {
            if !self.log_valid(log) {
                continue;
            }
            dispatched = true;

            let Some(range) = Self::log_range(log) else {
                continue;
            };

            // Deliver to the first device whose punit slice covers the
            // address.
            for poller in &self.pollers {
                let ppa = poller.fmt.unpack(log.ppa);
                if poller.in_range(ppa) {
                    (poller.handler)(AnmEvent { ppa, range });
                    break;
                }
            }
        }

        // There may be more entries on the controller than a single log
        // page holds.
        if dispatched && cnt == ANM_LOG_ENTRIES {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        }
    }
}

struct AnmShared {
    running: AtomicBool,
    ctrlrs: SpinLock<Vec<AnmCtrlr>>,
}

/// The notification manager: a single polling thread plus the controller
/// registry. Owned by the library context and stopped when it goes away.
pub(crate) struct Anm {
    shared: Arc<AnmShared>,
    handle: Option<JoinHandle<()>>,
    next_token: core::sync::atomic::AtomicUsize,
}

impl Anm {
    pub fn start() -> Result<Self> {
        let shared = Arc::new(AnmShared {
            running: AtomicBool::new(true),
            ctrlrs: SpinLock::new(Vec::new()),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("ocssd_anm".to_string())
            .spawn(move || anm_thread(thread_shared))
            .map_err(|_| OutOfMemory.reason("failed to spawn the anm thread"))?;

        Ok(Self {
            shared,
            handle: Some(handle),
            next_token: core::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn find_ctrlr<'a>(
        ctrlrs: &'a mut Vec<AnmCtrlr>,
        ctrlr: &Arc<dyn MediaController>,
    ) -> Option<&'a mut AnmCtrlr> {
        ctrlrs
            .iter_mut()
            .find(|entry| Arc::ptr_eq(&entry.ctrlr, ctrlr))
    }

    /// Register a controller; repeated registrations are idempotent.
    pub fn register_ctrlr(&self, ctrlr: Arc<dyn MediaController>) {
        let mut ctrlrs = self.shared.ctrlrs.lock();
        if Self::find_ctrlr(&mut ctrlrs, &ctrlr).is_none() {
            ctrlrs.push(AnmCtrlr::new(ctrlr));
        }
    }

    /// Drop a controller once no device subscription remains.
    pub fn unregister_ctrlr(&self, ctrlr: &Arc<dyn MediaController>) {
        let mut ctrlrs = self.shared.ctrlrs.lock();
        let unused = match Self::find_ctrlr(&mut ctrlrs, ctrlr) {
            Some(entry) if entry.pollers.is_empty() => {
                entry.ctrlr.register_aer_callback(None);
                true
            }
            _ => false,
        };
        if unused {
            ctrlrs.retain(|entry| !Arc::ptr_eq(&entry.ctrlr, ctrlr));
        }
    }

    /// Subscribe a device's punit slice to its controller's events.
    /// Returns a token for unregistration.
    pub fn register_device(
        &self,
        ctrlr: &Arc<dyn MediaController>,
        geo: Geometry,
        range: PunitRange,
        handler: AnmHandler,
    ) -> Result<usize> {
        let token = self
            .next_token
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);

        let mut ctrlrs = self.shared.ctrlrs.lock();
        let Some(entry) = Self::find_ctrlr(&mut ctrlrs, ctrlr) else {
            bail!(NotFound, "controller is not registered with the anm");
        };

        entry.pollers.push(AnmPoller {
            token,
            fmt: PpaFormat::new(&geo),
            geo,
            range,
            handler,
        });
        Ok(token)
    }

    pub fn unregister_device(&self, ctrlr: &Arc<dyn MediaController>, token: usize) {
        let mut ctrlrs = self.shared.ctrlrs.lock();
        if let Some(entry) = Self::find_ctrlr(&mut ctrlrs, ctrlr) {
            entry.pollers.retain(|poller| poller.token != token);
        }
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Anm {
    fn drop(&mut self) {
        self.stop();
    }
}

fn anm_thread(shared: Arc<AnmShared>) {
    while shared.running.load(Ordering::Acquire) {
        {
            let mut ctrlrs = shared.ctrlrs.lock();
            for entry in ctrlrs.iter_mut() {
                entry.ctrlr.process_admin_completions();

                if entry.outstanding.load(Ordering::Acquire) > 0 {
                    entry.process_log();
                }
            }
        }

        std::thread::sleep(Duration::from_micros(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::LbaFormat;
    use crate::media::MemController;
    use core::sync::atomic::AtomicUsize;

    fn geo() -> Geometry {
        Geometry {
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
        }
    }

    #[test]
    fn events_reach_the_matching_device() {
        let mem = Arc::new(MemController::new(geo()));
        let ctrlr: Arc<dyn MediaController> = mem.clone();
        let anm = Anm::start().unwrap();
        anm.register_ctrlr(ctrlr.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        anm.register_device(
            &ctrlr,
            geo(),
            PunitRange { begin: 0, end: 1 },
            Box::new(move |event| {
                assert_eq!(event.range, AnmRange::Chk);
                hits_clone.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        // grp 0 / pu 0 flattens to punit 0, inside the registered range.
        let fmt = PpaFormat::new(&geo());
        let ppa = fmt.pack(Ppa::new(0, 0, 3, 0));
        mem.notify_chunk(ppa, NotificationMask::CHUNK);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::Relaxed) == 0 {
            assert!(std::time::Instant::now() < deadline, "event never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn stale_entries_are_filtered() {
        let mut entry = AnmCtrlr::new(Arc::new(MemController::new(geo())));
        let log = |nc| ChunkNotification {
            nc,
            ppa: 0,
            mask: NotificationMask::CHUNK,
        };

        // The baseline comes from the first entry.
        assert!(entry.log_valid(&log(5)));
        assert!(!entry.log_valid(&log(5)));
        assert!(!entry.log_valid(&log(4)));
        assert!(entry.log_valid(&log(6)));
    }
}
