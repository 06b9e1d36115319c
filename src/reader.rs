// SPDX-License-Identifier: MPL-2.0

//! The read path.
//!
//! User reads resolve one block at a time so that cache hits against the
//! ring write buffer interleave freely with device reads. Metadata reads
//! run in PPA mode and have to jump across the chunks in `xfer_size`
//! increments, the same way the metadata was written.

use crate::{
    band::Band,
    dev::Dev,
    geom::{Lba, Ppa, BLOCK_SIZE},
    io::ReadIo,
    media::{MediaError, QpairId},
    prelude::*,
};

/// Read a metadata region laid out along the band's stripe order.
pub(crate) fn read_md_region(
    dev: &Dev,
    qpair: QpairId,
    band: &Band,
    start_ppa: Ppa,
    lbk_cnt: usize,
    buf: &mut [u8],
) -> Result<()> {
    debug_assert!(buf.len() >= lbk_cnt * BLOCK_SIZE);

    let mut lbk = 0;
    while lbk < lbk_cnt {
        let ppa = if lbk == 0 {
            start_ppa
        } else {
            band.next_xfer_ppa(dev, start_ppa, lbk)
        };
        if ppa.is_invalid() {
            bail!(IoFailed, "metadata region runs past the band");
        }

        // Stay within the current transfer unit.
        let max_lbks = dev.xfer_size - ppa.lbk() as usize % dev.xfer_size;
        let cnt = max_lbks.min(lbk_cnt - lbk);
        debug_assert_eq!(
            ppa.lbk() as usize / dev.xfer_size,
            (ppa.lbk() as usize + cnt - 1) / dev.xfer_size
        );

        let slice = &mut buf[lbk * BLOCK_SIZE..(lbk + cnt) * BLOCK_SIZE];
        match dev.ctrlr.read(qpair, dev.fmt.pack(ppa), cnt, slice) {
            Ok(()) | Err(MediaError::ReadHighEcc) => (),
            Err(_) => bail!(IoFailed, "metadata read failed"),
        }

        lbk += cnt;
    }

    Ok(())
}

/// Copy a cached block out of the ring write buffer.
///
/// The L2P is re-checked under the entry lock; if it moved on since the
/// lookup the caller has to retry the block from a fresh lookup.
fn cache_read(dev: &Dev, lba: Lba, ppa: Ppa, out: &mut [u8]) -> core::result::Result<(), ()> {
    let entry = dev.rwb.entry_from_offset(ppa.cache_offset() as usize);
    let inner = entry.lock();

    let cur = dev.l2p.get(lba);
    if cur != ppa {
        return Err(());
    }

    out.copy_from_slice(&inner.data);
    Ok(())
}

/// Resolve and execute a user read, then complete it.
pub(crate) fn process_read(dev: &Dev, io: ReadIo) {
    let ReadIo {
        lba,
        lbk_cnt,
        mut buf,
        cb,
    } = io;

    let mut status = Ok(());
    let mut lbk = 0;
    while lbk < lbk_cnt {
        let cur = lba + lbk as Lba;
        let ppa = dev.l2p.get(cur);

        // Unmapped blocks leave the caller's buffer untouched.
        if ppa.is_invalid() {
            lbk += 1;
            continue;
        }

        if ppa.is_cached() {
            if cache_read(dev, cur, ppa, buf.block_mut(lbk)).is_ok() {
                lbk += 1;
            }
            // A write completed under us; re-read the L2P.
            continue;
        }

        match dev
            .ctrlr
            .read(dev.read_qpair, dev.fmt.pack(ppa), 1, buf.block_mut(lbk))
        {
            Ok(()) | Err(MediaError::ReadHighEcc) => (),
            Err(_) => {
                error!("device read failed at lba {}", cur);
                status = Err(IoFailed.reason("device read failed"));
            }
        }
        lbk += 1;
    }

    cb(buf, status);
}
