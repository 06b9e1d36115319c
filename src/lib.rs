// SPDX-License-Identifier: MPL-2.0

//! A flash translation layer for Open-Channel SSDs.
//!
//! The crate exposes a conventional logical block device on top of media
//! organized as parallel units of erase-block chunks. Writes are absorbed
//! and batched by a ring write buffer, striped across the parallel units
//! band by band, and made durable through CRC-protected per-band metadata
//! that a later open can replay to rebuild the logical-to-physical table.
//! Garbage collection relocates still-valid blocks out of closed bands so
//! the bands can be erased and reused, preferring the least-worn band for
//! every new write.

mod anm;
mod band;
mod conf;
mod dev;
mod error;
mod geom;
mod io;
mod l2p;
mod media;
mod meta;
mod prelude;
mod reader;
mod reloc;
mod restore;
mod rwb;
mod thread;
mod util;
mod writer;

pub use self::{
    anm::{AnmEvent, AnmHandler, AnmRange},
    conf::{DefragConf, Limit, LimitTier, OcssdConf},
    dev::{DevAttrs, InitOpts, Mode, OcssdContext, OcssdDev, StatsSnapshot},
    error::{Errno, Error},
    geom::{Geometry, Lba, LbaFormat, Ppa, PunitRange, BLOCK_SIZE, LBA_INVALID},
    io::{FlushCb, ReadCb, WriteCb, WriteIo},
    media::{
        AerCallback, ChunkInfo, ChunkNotification, MediaChunkState, MediaController, MediaError,
        MemController, NotificationMask, QpairId,
    },
    meta::MdStatus,
    util::Buf,
};

pub type Result<T> = core::result::Result<T, Error>;
