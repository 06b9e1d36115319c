// SPDX-License-Identifier: MPL-2.0

//! Restore: rebuilding the L2P from on-media band metadata.
//!
//! Opening an existing device reads every band's head metadata, orders the
//! bands by sequence number, ingests the tail metadata in that order and
//! replays the LBA maps into the L2P. A newer band overwriting an LBA
//! invalidates the older band's claim on it, exactly as live writes would
//! have.

use crate::{
    band::BandId,
    dev::Dev,
    geom::Lba,
    meta::MdStatus,
    prelude::*,
    util::Buf,
};

pub(crate) struct Restore {
    /// Band ids in ascending sequence order.
    order: Vec<BandId>,
    /// Per-band head metadata status.
    statuses: Vec<MdStatus>,
    /// Tail metadata read scratch.
    md_buf: Buf,
    /// LBA map scratch shared across bands.
    lba_map: Box<[Lba]>,
}

/// Read the head metadata of every closed band and decide whether the
/// device holds a consistent image. On success the advertised capacity is
/// known and the caller may allocate the L2P.
pub(crate) fn check_device(dev: &Dev) -> Result<Restore> {
    let mut statuses = vec![MdStatus::NoMd; dev.bands.len()];
    let mut head_buf = Buf::alloc(dev.layout.head_md_num_lbks())?;

    let shut: Vec<BandId> = dev.shut_bands.lock().clone();
    for &id in &shut {
        statuses[id] = dev.bands[id].read_head_md(dev, dev.core_qpair, &mut head_buf);
    }

    // At least one band must carry a valid head; the rest may legitimately
    // have never been written to.
    if !shut
        .iter()
        .any(|&id| statuses[id] == MdStatus::Success)
    {
        bail!(CorruptedMeta, "unable to find a valid head metadata");
    }

    for &id in &shut {
        match statuses[id] {
            MdStatus::Success | MdStatus::NoMd | MdStatus::IoFailure => (),
            status => {
                error!("inconsistent head metadata on band {}: {:?}", id, status);
                bail!(CorruptedMeta, "inconsistent head metadata");
            }
        }
    }

    // Sort bands in sequence number ascending order.
    let mut order: Vec<BandId> = (0..dev.bands.len()).collect();
    order.sort_by_key(|&id| dev.bands[id].md.lock().seq);

    // No two written bands may share a sequence number.
    let written: Vec<BandId> = order
        .iter()
        .copied()
        .filter(|&id| statuses[id] == MdStatus::Success)
        .collect();
    for pair in written.windows(2) {
        let (lseq, rseq) = (
            dev.bands[pair[0]].md.lock().seq,
            dev.bands[pair[1]].md.lock().seq,
        );
        if lseq == rseq {
            bail!(CorruptedMeta, "duplicate band sequence number");
        }
    }

    Ok(Restore {
        order,
        statuses,
        md_buf: Buf::alloc(dev.layout.tail_md_num_lbks())?,
        lba_map: vec![0; dev.num_band_lbks()].into_boxed_slice(),
    })
}

/// Replay one band's LBA map into the L2P.
fn restore_l2p(dev: &Dev, band_id: BandId, lba_map: &[Lba]) -> Result<()> {
    let band = &dev.bands[band_id];

    for lbkoff in 0..dev.num_band_lbks() {
        if !band.lbkoff_valid(lbkoff) {
            continue;
        }

        let lba = lba_map[lbkoff];
        if lba >= dev.l2p.len() {
            bail!(CorruptedMeta, "restored lba out of range");
        }

        let old = dev.l2p.get(lba);
        if !old.is_invalid() {
            dev.invalidate_addr(old);
        }

        let ppa = band.ppa_from_lbkoff(dev, lbkoff);
        band.set_addr(dev, lba, ppa);
        dev.l2p.set(lba, ppa);
    }

    Ok(())
}

/// Ingest the tail metadata in sequence order and rebuild the L2P.
pub(crate) fn restore_state(dev: &Dev, restore: &mut Restore) -> Result<()> {
    for i in 0..restore.order.len() {
        let band_id = restore.order[i];
        let band = &dev.bands[band_id];

        if !band.has_chunks() || restore.statuses[band_id] != MdStatus::Success {
            band.md_clear(dev);
            continue;
        }

        // The valid map has to be rebuilt by replaying the LBA map, not
        // taken from media verbatim: newer bands may have invalidated
        // parts of it already.
        let tail_ppa = band.tail_md_ppa(dev);
        band.set_tail_md_ppa(tail_ppa);
        let status = band.read_tail_md(
            dev,
            dev.core_qpair,
            tail_ppa,
            &mut restore.md_buf,
            Some(&mut restore.lba_map),
        );
        if status != MdStatus::Success {
            error!("unable to read tail metadata of band {}: {:?}", band_id, status);
            bail!(CorruptedMeta, "tail metadata read failed");
        }

        // The tail's valid map seeds the replay; counting restarts from
        // zero so that the in-memory count matches what actually lands in
        // the L2P.
        {
            let mut md = band.md.lock();
            md.num_vld = 0;
        }
        restore_l2p(dev, band_id, &restore.lba_map)?;
    }

    Ok(())
}
