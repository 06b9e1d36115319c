// SPDX-License-Identifier: MPL-2.0

//! On-media band metadata.
//!
//! Every band carries a head block written when the band opens and a tail
//! region written when it closes. Multi-byte integers are little-endian and
//! the header checksum is CRC32C over the metadata region with the checksum
//! field itself skipped.
//!
//! # On-media format
//!
//! ```text
//! Head (padded to xfer_size blocks):
//! ┌──────┬─────┬─────┬──────────┬────────┬─────────┬───────────┐
//! │ UUID │ Ver │ Seq │ Checksum │ WrCnt  │ LbaCnt  │ XferSize  │
//! │ (16B)│ (1B)│ (8B)│   (4B)   │  (8B)  │  (8B)   │   (4B)    │
//! └──────┴─────┴─────┴──────────┴────────┴─────────┴───────────┘
//!
//! Tail (padded to a multiple of xfer_size blocks):
//! ┌──────────────────────────┬───────────────┬──────────────────┐
//! │ Header + NumLbks (1 blk) │ Valid bitmap  │     LBA map      │
//! └──────────────────────────┴───────────────┴──────────────────┘
//! ```

use static_assertions::const_assert_eq;
use uuid::Uuid;
use zerocopy::{
    little_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::{
    geom::{Lba, BLOCK_SIZE},
    util::BitMap,
};

/// Current metadata version.
pub const MD_VERSION: u8 = 1;

/// Outcome of a metadata read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MdStatus {
    Success,
    /// Metadata read failure.
    IoFailure,
    /// Invalid version.
    InvalidVer,
    /// UUID doesn't match.
    NoMd,
    /// UUID and version match but CRC doesn't.
    InvalidCrc,
    /// Vld or lba map size doesn't match.
    InvalidSize,
}

#[repr(C)]
#[derive(Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct MdHeader {
    pub uuid: [u8; 16],
    pub ver: u8,
    pub seq: U64,
    pub checksum: U32,
}

const_assert_eq!(core::mem::size_of::<MdHeader>(), 29);

const CHECKSUM_OFFSET: usize = 16 + 1 + 8;

#[repr(C)]
#[derive(Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct TailMdHdr {
    pub hdr: MdHeader,
    /// Max number of lbks covered by the maps.
    pub num_lbks: U64,
}

const_assert_eq!(core::mem::size_of::<TailMdHdr>(), 37);

#[repr(C)]
#[derive(Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct HeadMd {
    pub hdr: MdHeader,
    /// Number of defrag cycles.
    pub wr_cnt: U64,
    /// Number of surfaced LBAs.
    pub lba_cnt: U64,
    /// Transfer size.
    pub xfer_size: U32,
}

const_assert_eq!(core::mem::size_of::<HeadMd>(), 49);

/// CRC32C over `region` with the checksum word excluded.
fn calc_crc(region: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&region[..CHECKSUM_OFFSET]);
    crc32c::crc32c_append(crc, &region[CHECKSUM_OFFSET + 4..])
}

fn fill_hdr(region: &mut [u8], uuid: &Uuid, seq: u64) {
    let hdr = MdHeader::mut_from_prefix(region).unwrap().0;
    hdr.uuid = *uuid.as_bytes();
    hdr.ver = MD_VERSION;
    hdr.seq = U64::new(seq);
    hdr.checksum = U32::new(0);
    let crc = calc_crc(region);
    let hdr = MdHeader::mut_from_prefix(region).unwrap().0;
    hdr.checksum = U32::new(crc);
}

fn check_hdr(region: &[u8], uuid: &Uuid) -> MdStatus {
    let hdr = match MdHeader::ref_from_prefix(region) {
        Ok((hdr, _)) => hdr,
        Err(_) => return MdStatus::InvalidSize,
    };

    if hdr.uuid != *uuid.as_bytes() {
        return MdStatus::NoMd;
    }
    if hdr.ver != MD_VERSION {
        return MdStatus::InvalidVer;
    }
    if calc_crc(region) != hdr.checksum.get() {
        return MdStatus::InvalidCrc;
    }

    MdStatus::Success
}

/// Sizes of the metadata regions, fixed by the geometry and punit range.
#[derive(Clone, Copy, Debug)]
pub struct MdLayout {
    /// Maximum number of logical blocks in a band (punits × clba).
    pub num_band_lbks: usize,
    /// Transfer unit in logical blocks.
    pub xfer_size: usize,
}

impl MdLayout {
    pub fn tail_hdr_num_lbks(&self) -> usize {
        core::mem::size_of::<TailMdHdr>().div_ceil(BLOCK_SIZE)
    }

    pub fn vld_map_size(&self) -> usize {
        self.num_band_lbks.div_ceil(8)
    }

    pub fn vld_map_num_lbks(&self) -> usize {
        self.vld_map_size().div_ceil(BLOCK_SIZE)
    }

    pub fn lba_map_size(&self) -> usize {
        self.num_band_lbks * core::mem::size_of::<u64>()
    }

    pub fn lba_map_num_lbks(&self) -> usize {
        self.lba_map_size().div_ceil(BLOCK_SIZE)
    }

    pub fn head_md_num_lbks(&self) -> usize {
        self.xfer_size
    }

    pub fn tail_md_num_lbks(&self) -> usize {
        (self.tail_hdr_num_lbks() + self.vld_map_num_lbks() + self.lba_map_num_lbks())
            .div_ceil(self.xfer_size)
            * self.xfer_size
    }

    fn vld_map_offset(&self) -> usize {
        self.tail_hdr_num_lbks() * BLOCK_SIZE
    }

    fn lba_map_offset(&self) -> usize {
        self.vld_map_offset() + self.vld_map_num_lbks() * BLOCK_SIZE
    }

    /// Serialize the head metadata into `buf` (head_md_num_lbks blocks).
    pub fn pack_head_md(
        &self,
        buf: &mut [u8],
        uuid: &Uuid,
        seq: u64,
        wr_cnt: u64,
        lba_cnt: u64,
    ) {
        assert!(buf.len() >= self.head_md_num_lbks() * BLOCK_SIZE);

        let head = HeadMd::mut_from_prefix(buf).unwrap().0;
        head.wr_cnt = U64::new(wr_cnt);
        head.lba_cnt = U64::new(lba_cnt);
        head.xfer_size = U32::new(self.xfer_size as u32);
        // The head checksum covers the struct alone, not the padding.
        fill_hdr(&mut buf[..core::mem::size_of::<HeadMd>()], uuid, seq);
    }

    /// Validate and extract the head metadata from `buf`. On success returns
    /// `(seq, wr_cnt, lba_cnt, xfer_size)`.
    pub fn unpack_head_md(
        &self,
        buf: &[u8],
        uuid: &Uuid,
    ) -> (MdStatus, Option<(u64, u64, u64, u32)>) {
        let region = &buf[..core::mem::size_of::<HeadMd>()];
        let status = check_hdr(region, uuid);
        if status != MdStatus::Success {
            return (status, None);
        }

        let head = HeadMd::ref_from_prefix(region).unwrap().0;
        if head.xfer_size.get() as usize != self.xfer_size {
            return (MdStatus::InvalidSize, None);
        }

        (
            MdStatus::Success,
            Some((
                head.hdr.seq.get(),
                head.wr_cnt.get(),
                head.lba_cnt.get(),
                head.xfer_size.get(),
            )),
        )
    }

    /// Serialize the tail metadata into `buf` (tail_md_num_lbks blocks).
    pub fn pack_tail_md(
        &self,
        buf: &mut [u8],
        uuid: &Uuid,
        seq: u64,
        vld_map: &BitMap,
        lba_map: &[Lba],
    ) {
        let total = self.tail_md_num_lbks() * BLOCK_SIZE;
        assert!(buf.len() >= total);
        assert_eq!(lba_map.len(), self.num_band_lbks);

        buf[..total].fill(0);

        let tail = TailMdHdr::mut_from_prefix(buf).unwrap().0;
        tail.num_lbks = U64::new(self.num_band_lbks as u64);

        let vld_offset = self.vld_map_offset();
        buf[vld_offset..vld_offset + self.vld_map_size()].copy_from_slice(vld_map.as_bytes());

        let mut pos = self.lba_map_offset();
        for lba in lba_map {
            buf[pos..pos + 8].copy_from_slice(&lba.to_le_bytes());
            pos += 8;
        }

        fill_hdr(&mut buf[..total], uuid, seq);
    }

    /// Validate the tail metadata in `buf` and restore the maps. On success
    /// returns the sequence number.
    pub fn unpack_tail_md(
        &self,
        buf: &[u8],
        uuid: &Uuid,
        vld_map: Option<&mut BitMap>,
        lba_map: Option<&mut [Lba]>,
    ) -> (MdStatus, Option<u64>) {
        let total = self.tail_md_num_lbks() * BLOCK_SIZE;
        let status = check_hdr(&buf[..total], uuid);
        if status != MdStatus::Success {
            return (status, None);
        }

        let tail = TailMdHdr::ref_from_prefix(buf).unwrap().0;
        if tail.num_lbks.get() as usize != self.num_band_lbks {
            return (MdStatus::InvalidSize, None);
        }

        if let Some(vld_map) = vld_map {
            let vld_offset = self.vld_map_offset();
            vld_map.copy_from_bytes(&buf[vld_offset..vld_offset + self.vld_map_size()]);
        }

        if let Some(lba_map) = lba_map {
            assert_eq!(lba_map.len(), self.num_band_lbks);
            let mut pos = self.lba_map_offset();
            for lba in lba_map.iter_mut() {
                *lba = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
                pos += 8;
            }
        }

        (MdStatus::Success, Some(tail.hdr.seq.get()))
    }

    /// Restore only the LBA map from a buffer holding the map region of the
    /// tail metadata.
    pub fn unpack_lba_map(&self, buf: &[u8], lba_map: &mut [Lba]) {
        assert_eq!(lba_map.len(), self.num_band_lbks);
        let mut pos = 0;
        for lba in lba_map.iter_mut() {
            *lba = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::LBA_INVALID;

    fn layout() -> MdLayout {
        MdLayout {
            num_band_lbks: 800,
            xfer_size: 16,
        }
    }

    #[test]
    fn layout_sizes() {
        let layout = layout();
        assert_eq!(layout.tail_hdr_num_lbks(), 1);
        assert_eq!(layout.vld_map_size(), 100);
        assert_eq!(layout.vld_map_num_lbks(), 1);
        assert_eq!(layout.lba_map_size(), 6400);
        assert_eq!(layout.lba_map_num_lbks(), 2);
        assert_eq!(layout.head_md_num_lbks(), 16);
        // 1 + 1 + 2 rounded up to a multiple of 16.
        assert_eq!(layout.tail_md_num_lbks(), 16);
    }

    #[test]
    fn head_md_round_trip() {
        let layout = layout();
        let uuid = Uuid::new_v4();
        let mut buf = vec![0u8; layout.head_md_num_lbks() * BLOCK_SIZE];

        layout.pack_head_md(&mut buf, &uuid, 7, 3, 12345);
        let (status, info) = layout.unpack_head_md(&buf, &uuid);
        assert_eq!(status, MdStatus::Success);
        assert_eq!(info, Some((7, 3, 12345, 16)));
    }

    #[test]
    fn head_md_rejects_foreign_and_damaged() {
        let layout = layout();
        let uuid = Uuid::new_v4();
        let mut buf = vec![0u8; layout.head_md_num_lbks() * BLOCK_SIZE];
        layout.pack_head_md(&mut buf, &uuid, 7, 3, 12345);

        let (status, _) = layout.unpack_head_md(&buf, &Uuid::new_v4());
        assert_eq!(status, MdStatus::NoMd);

        let mut damaged = buf.clone();
        damaged[40] ^= 0xff;
        let (status, _) = layout.unpack_head_md(&damaged, &uuid);
        assert_eq!(status, MdStatus::InvalidCrc);

        let mut wrong_ver = buf.clone();
        wrong_ver[16] = MD_VERSION + 1;
        let (status, _) = layout.unpack_head_md(&wrong_ver, &uuid);
        assert_eq!(status, MdStatus::InvalidVer);
    }

    #[test]
    fn tail_md_round_trip() {
        let layout = layout();
        let uuid = Uuid::new_v4();
        let mut buf = vec![0u8; layout.tail_md_num_lbks() * BLOCK_SIZE];

        let mut vld_map = BitMap::new(layout.num_band_lbks);
        let mut lba_map = vec![LBA_INVALID; layout.num_band_lbks];
        vld_map.set_bit(0);
        vld_map.set_bit(68);
        vld_map.set_bit(799);
        lba_map[0] = 42;
        lba_map[68] = 0x68676564;
        lba_map[799] = 1;

        layout.pack_tail_md(&mut buf, &uuid, 9, &vld_map, &lba_map);

        let mut vld_out = BitMap::filled(layout.num_band_lbks);
        let mut lba_out = vec![0u64; layout.num_band_lbks];
        let (status, seq) = layout.unpack_tail_md(
            &buf,
            &uuid,
            Some(&mut vld_out),
            Some(&mut lba_out),
        );
        assert_eq!(status, MdStatus::Success);
        assert_eq!(seq, Some(9));
        assert_eq!(vld_out.count_ones(), 3);
        assert!(vld_out.test_bit(68));
        assert_eq!(lba_out, lba_map);
    }

    #[test]
    fn tail_md_crc_covers_maps() {
        let layout = layout();
        let uuid = Uuid::new_v4();
        let mut buf = vec![0u8; layout.tail_md_num_lbks() * BLOCK_SIZE];

        let vld_map = BitMap::filled(layout.num_band_lbks);
        let lba_map = vec![5u64; layout.num_band_lbks];
        layout.pack_tail_md(&mut buf, &uuid, 1, &vld_map, &lba_map);

        // Flip a bit deep inside the LBA map region.
        buf[3 * BLOCK_SIZE + 17] ^= 1;
        let (status, _) = layout.unpack_tail_md(&buf, &uuid, None, None);
        assert_eq!(status, MdStatus::InvalidCrc);
    }
}
