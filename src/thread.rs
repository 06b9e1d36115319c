// SPDX-License-Identifier: MPL-2.0

//! Single-consumer task loops with message rings.
//!
//! Each IO role (core writer, reader, notification manager) runs as a tight
//! poll loop on its own OS thread. Work crossing thread boundaries is
//! enqueued on the owner's message ring and runs exclusively on the owner;
//! there is no preemption and no blocking primitive inside the loops.

use core::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::prelude::*;

/// Shared control block of a task loop.
pub(crate) struct ThreadCtl<M> {
    name: &'static str,
    running: AtomicBool,
    initialized: AtomicBool,
    msgs: SegQueue<M>,
}

impl<M> ThreadCtl<M> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            msgs: SegQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a message for the owning thread.
    pub fn send(&self, msg: M) {
        self.msgs.push(msg);
    }

    /// Dequeue one message. Only the owning thread calls this.
    pub fn recv(&self) -> Option<M> {
        self.msgs.pop()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

/// Wait until every predicate reports readiness, giving up after `timeout`.
pub(crate) fn wait_initialized(
    ctls: &[&dyn Fn() -> bool],
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    while !ctls.iter().all(|initialized| initialized()) {
        if Instant::now() > deadline {
            bail!(TimedOut, "thread initialization timed out");
        }
        std::thread::sleep(Duration::from_micros(100));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn message_ring_is_fifo() {
        let ctl: ThreadCtl<u32> = ThreadCtl::new("test");
        ctl.send(1);
        ctl.send(2);
        ctl.send(3);
        assert_eq!(ctl.recv(), Some(1));
        assert_eq!(ctl.recv(), Some(2));
        assert_eq!(ctl.recv(), Some(3));
        assert_eq!(ctl.recv(), None);
    }

    #[test]
    fn stop_is_sticky() {
        let ctl: ThreadCtl<()> = ThreadCtl::new("test");
        assert!(ctl.is_running());
        ctl.stop();
        assert!(!ctl.is_running());
        assert_eq!(ctl.name(), "test");
    }

    #[test]
    fn wait_initialized_times_out() {
        let ready = || false;
        let err = wait_initialized(&[&ready], Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::TimedOut);

        let ready = || true;
        assert!(wait_initialized(&[&ready], Duration::from_millis(1)).is_ok());
    }
}
