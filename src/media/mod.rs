// SPDX-License-Identifier: MPL-2.0

//! The interface to the PPA-mode open-channel controller.
//!
//! The wire driver itself is an external collaborator; the FTL consumes it
//! through [`MediaController`]. Submissions execute against the media and
//! report a per-command status; the FTL defers its own completion handling
//! through per-thread completion queues so that callbacks never run inside
//! a submission call.

mod mem;

pub use self::mem::MemController;

use crate::geom::Geometry;

/// Identifier of an IO queue pair allocated from a controller.
pub type QpairId = usize;

/// Why a media command failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaError {
    /// Media read with ECC pushed to its limit. The data was recovered and
    /// the command counts as successful at the FTL level.
    ReadHighEcc,
    /// Write to a position other than the chunk's write pointer, or to a
    /// non-writable chunk.
    WriteFailed,
    /// Chunk reset failed; the chunk went offline.
    ResetFailed,
    /// Address outside the device geometry.
    OutOfRange,
    /// Any other command failure.
    Generic,
}

pub type MediaResult = core::result::Result<(), MediaError>;

/// Per-chunk state as reported by the chunk information log page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaChunkState {
    Free,
    Open,
    Closed,
    Offline,
    Reserved,
}

/// One entry of the chunk information log page.
#[derive(Clone, Copy, Debug)]
pub struct ChunkInfo {
    pub state: MediaChunkState,
    /// Chunk-internal write pointer.
    pub write_ptr: u32,
}

bitflags::bitflags! {
    /// Scope of a chunk notification.
    pub struct NotificationMask: u32 {
        const LBK   = 1 << 0;
        const CHUNK = 1 << 1;
        const PU    = 1 << 2;
    }
}

/// One entry of the chunk notification log page.
#[derive(Clone, Copy, Debug)]
pub struct ChunkNotification {
    /// Notification counter, strictly increasing per controller.
    pub nc: u64,
    /// Packed address the notification refers to.
    pub ppa: u64,
    pub mask: NotificationMask,
}

/// Callback fired when the controller signals an asynchronous event
/// concerning the chunk notification log.
pub type AerCallback = Box<dyn Fn() + Send + Sync>;

/// A PPA-mode open-channel controller.
///
/// # Thread safety
///
/// Implementations promise the atomicity of individual commands; commands
/// may be submitted concurrently from multiple queue pairs.
pub trait MediaController: Send + Sync {
    /// The device geometry.
    fn geometry(&self) -> Geometry;

    /// Size of the per-block metadata region in bytes (0 if none).
    fn md_size(&self) -> usize;

    /// Allocate an IO queue pair.
    fn alloc_io_qpair(&self) -> QpairId;

    /// Release an IO queue pair.
    fn free_io_qpair(&self, qpair: QpairId);

    /// Read `lbk_cnt` blocks starting at the packed address into `buf`.
    fn read(&self, qpair: QpairId, ppa: u64, lbk_cnt: usize, buf: &mut [u8]) -> MediaResult;

    /// Write the gathered buffers at the packed address, with optional
    /// per-block metadata. Writes within a chunk must be sequential.
    fn write(&self, qpair: QpairId, ppa: u64, bufs: &[&[u8]], md: Option<&[u8]>) -> MediaResult;

    /// Reset (erase) the chunks containing the given packed addresses.
    fn vector_reset(&self, qpair: QpairId, ppas: &[u64]) -> MediaResult;

    /// Read `out.len()` entries of the chunk information log page starting
    /// at `offset` (in entries, ordered group-major, then parallel unit,
    /// then chunk).
    fn chunk_info(&self, offset: usize, out: &mut [ChunkInfo]) -> MediaResult;

    /// Read the pending chunk notification log entries, newest last.
    /// Returns the number of entries written to `out`.
    fn chunk_notifications(
        &self,
        out: &mut [ChunkNotification],
    ) -> core::result::Result<usize, MediaError>;

    /// Register (or clear) the asynchronous event callback.
    fn register_aer_callback(&self, cb: Option<AerCallback>);

    /// Process outstanding admin completions. Returns how many were handled.
    fn process_admin_completions(&self) -> usize {
        0
    }
}
