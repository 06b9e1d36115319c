// SPDX-License-Identifier: MPL-2.0

//! IO descriptors shared by the write pipeline.

use crate::{
    band::BandId,
    geom::{Lba, Ppa, LBA_INVALID},
    prelude::*,
    util::Buf,
};

bitflags::bitflags! {
    /// Flags carried by pipeline IOs and ring write buffer entries.
    pub(crate) struct IoFlags: u32 {
        /// Internal IO (relocation, metadata, padding).
        const INTERNAL   = 1 << 0;
        /// The IO must not go through if another one has been scheduled to
        /// the same LBA since its data was read.
        const WEAK       = 1 << 1;
        /// The IO is used for padding.
        const PAD        = 1 << 2;
        /// The IO operates on metadata.
        const MD         = 1 << 3;
        /// Addresses are PPAs instead of LBAs.
        const PPA_MODE   = 1 << 4;
        /// The IO carries noncontiguous LBAs.
        const VECTOR_LBA = 1 << 5;
    }
}

impl IoFlags {
    /// The subset of flags an RWB entry inherits from its IO.
    pub fn rwb_flags(self) -> IoFlags {
        self & (IoFlags::INTERNAL | IoFlags::WEAK | IoFlags::PAD)
    }
}

/// A write absorbed block by block into the ring write buffer.
pub(crate) struct Io {
    /// First LBA (contiguous mode).
    pub lba: Lba,
    /// Per-block LBAs (`VECTOR_LBA` mode).
    pub lbas: Vec<Lba>,
    /// Source media address of a relocation write.
    pub ppa: Ppa,
    /// Band the source address belongs to.
    pub band: Option<BandId>,
    /// Number of blocks already absorbed.
    pub pos: usize,
    pub lbk_cnt: usize,
    pub buf: Option<Buf>,
    pub flags: IoFlags,
}

impl Io {
    pub fn user_write(lba: Lba, buf: Buf) -> Self {
        Self {
            lba,
            lbas: Vec::new(),
            ppa: Ppa::invalid(),
            band: None,
            pos: 0,
            lbk_cnt: buf.nblocks(),
            buf: Some(buf),
            flags: IoFlags::empty(),
        }
    }

    /// The LBA of the block currently being absorbed.
    pub fn current_lba(&self) -> Lba {
        if self.flags.contains(IoFlags::VECTOR_LBA) {
            self.lbas[self.pos]
        } else if self.lba == LBA_INVALID {
            LBA_INVALID
        } else {
            self.lba + self.pos as Lba
        }
    }
}

/// Callback completing a user write. The data buffer is handed back once
/// the write has been absorbed by the write buffer; durability is
/// asynchronous (see `flush`).
pub type WriteCb = Box<dyn FnOnce(Buf, Result<()>) + Send>;

/// A user write request.
///
/// On `Errno::TryAgain` the request keeps its progress and may simply be
/// resubmitted once write credit frees up.
pub struct WriteIo {
    pub(crate) io: Io,
    pub(crate) cb: Option<WriteCb>,
}

impl WriteIo {
    pub fn new(lba: Lba, buf: Buf, cb: WriteCb) -> Result<Self> {
        if buf.nblocks() == 0 {
            bail!(InvalidArgs, "write requires at least one block");
        }
        if lba == LBA_INVALID {
            bail!(InvalidArgs, "invalid write LBA");
        }

        Ok(Self {
            io: Io::user_write(lba, buf),
            cb: Some(cb),
        })
    }
}

/// Callback completing a user read. The buffer holds the data read for
/// every mapped block; blocks whose LBA was never written are left
/// untouched.
pub type ReadCb = Box<dyn FnOnce(Buf, Result<()>) + Send>;

/// A user read travelling to the read thread.
pub(crate) struct ReadIo {
    pub lba: Lba,
    pub lbk_cnt: usize,
    pub buf: Buf,
    pub cb: ReadCb,
}

/// Callback completing a flush.
pub type FlushCb = Box<dyn FnOnce(Result<()>) + Send>;
