// SPDX-License-Identifier: MPL-2.0

//! Device geometry and the physical page address (PPA) model.
//!
//! A PPA names a logical block on the media by its (group, parallel unit,
//! chunk, block) coordinates. Internally a PPA is carried in a fixed 64-bit
//! logical layout; the geometry-derived [`PpaFormat`] translates it to and
//! from the packed form the device consumes. A third, "cached" flavor points
//! into the ring write buffer instead of the media and must survive the same
//! packing round trip.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Size of a single logical block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// A logical block address presented to the user.
pub type Lba = u64;

/// Reserved LBA denoting "no LBA".
pub const LBA_INVALID: Lba = u64::MAX;

/// Bit lengths of the PPA fields as published by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbaFormat {
    pub grp_len: u8,
    pub pu_len: u8,
    pub chk_len: u8,
    pub lbk_len: u8,
}

/// Device geometry. Immutable after discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Number of groups.
    pub num_grp: u32,
    /// Number of parallel units within a group.
    pub num_pu: u32,
    /// Number of chunks within a parallel unit.
    pub num_chk: u32,
    /// Number of logical blocks within a chunk.
    pub clba: u32,
    /// Optimal write size in logical blocks (the transfer unit).
    pub ws_opt: u32,
    /// Minimal write size in logical blocks.
    pub ws_min: u32,
    /// PPA field widths.
    pub lbaf: LbaFormat,
}

impl Geometry {
    /// Total number of parallel units across all groups.
    pub fn total_punits(&self) -> usize {
        (self.num_grp * self.num_pu) as usize
    }
}

/// Inclusive range over the flattened parallel unit numbering
/// (`pu * num_grp + grp`). The device operates only on this slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunitRange {
    pub begin: u32,
    pub end: u32,
}

impl PunitRange {
    /// Number of parallel units in the range.
    pub fn num_punits(&self) -> usize {
        (self.end - self.begin + 1) as usize
    }

    /// Whether the two ranges share any parallel unit.
    pub fn intersects(&self, other: &PunitRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

// Internal logical layout of a PPA. Field widths are fixed and independent
// of the geometry; only the packed form is geometry-derived.
const LBK_SHIFT: u64 = 0;
const LBK_BITS: u64 = 32;
const CHK_SHIFT: u64 = 32;
const CHK_BITS: u64 = 16;
const PU_SHIFT: u64 = 48;
const PU_BITS: u64 = 8;
const GRP_SHIFT: u64 = 56;
const GRP_BITS: u64 = 7;
const CACHED_BIT: u64 = 1 << 63;
const CACHE_OFFSET_MASK: u64 = (1 << 48) - 1;

const fn field_mask(bits: u64) -> u64 {
    (1 << bits) - 1
}

/// A physical page address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ppa {
    raw: u64,
}

impl Ppa {
    /// The reserved sentinel address.
    pub const fn invalid() -> Self {
        Self { raw: u64::MAX }
    }

    /// An address on the media.
    pub fn new(grp: u32, pu: u32, chk: u32, lbk: u32) -> Self {
        debug_assert!((grp as u64) <= field_mask(GRP_BITS));
        debug_assert!((pu as u64) <= field_mask(PU_BITS));
        debug_assert!((chk as u64) <= field_mask(CHK_BITS));
        Self {
            raw: ((grp as u64) << GRP_SHIFT)
                | ((pu as u64) << PU_SHIFT)
                | ((chk as u64) << CHK_SHIFT)
                | ((lbk as u64) << LBK_SHIFT),
        }
    }

    /// An address referring to the ring write buffer entry at `offset`.
    pub fn cached(offset: u64) -> Self {
        debug_assert!(offset < CACHE_OFFSET_MASK);
        Self {
            raw: CACHED_BIT | offset,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.raw == u64::MAX
    }

    pub fn is_cached(&self) -> bool {
        !self.is_invalid() && self.raw & CACHED_BIT != 0
    }

    /// Offset into the ring write buffer. Meaningful only for cached PPAs.
    pub fn cache_offset(&self) -> u64 {
        debug_assert!(self.is_cached());
        self.raw & CACHE_OFFSET_MASK
    }

    pub fn grp(&self) -> u32 {
        ((self.raw >> GRP_SHIFT) & field_mask(GRP_BITS)) as u32
    }

    pub fn pu(&self) -> u32 {
        ((self.raw >> PU_SHIFT) & field_mask(PU_BITS)) as u32
    }

    pub fn chk(&self) -> u32 {
        ((self.raw >> CHK_SHIFT) & field_mask(CHK_BITS)) as u32
    }

    pub fn lbk(&self) -> u32 {
        ((self.raw >> LBK_SHIFT) & field_mask(LBK_BITS)) as u32
    }

    /// The same address with the block coordinate replaced.
    pub fn with_lbk(self, lbk: u32) -> Self {
        Self {
            raw: (self.raw & !(field_mask(LBK_BITS) << LBK_SHIFT)) | ((lbk as u64) << LBK_SHIFT),
        }
    }

    /// The same address with the chunk coordinate replaced.
    pub fn with_chk(self, chk: u32) -> Self {
        debug_assert!((chk as u64) <= field_mask(CHK_BITS));
        Self {
            raw: (self.raw & !(field_mask(CHK_BITS) << CHK_SHIFT)) | ((chk as u64) << CHK_SHIFT),
        }
    }

    /// The raw 64-bit logical form, usable for identity comparisons.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Reconstruct a PPA from its raw logical form.
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }
}

impl Default for Ppa {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Debug for Ppa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "Ppa(invalid)")
        } else if self.is_cached() {
            write!(f, "Ppa(cached, off={})", self.cache_offset())
        } else {
            write!(
                f,
                "Ppa(grp={}, pu={}, chk={}, lbk={})",
                self.grp(),
                self.pu(),
                self.chk(),
                self.lbk()
            )
        }
    }
}

/// Geometry-derived offsets and masks of the packed PPA form.
#[derive(Clone, Copy, Debug)]
pub struct PpaFormat {
    lbk_offset: u32,
    lbk_mask: u64,
    chk_offset: u32,
    chk_mask: u64,
    pu_offset: u32,
    pu_mask: u64,
    grp_offset: u32,
    grp_mask: u64,
    /// Total number of address bits.
    ppa_len: u32,
}

impl PpaFormat {
    pub fn new(geo: &Geometry) -> Self {
        let lbaf = &geo.lbaf;
        let lbk_offset = 0;
        let chk_offset = lbk_offset + lbaf.lbk_len as u32;
        let pu_offset = chk_offset + lbaf.chk_len as u32;
        let grp_offset = pu_offset + lbaf.pu_len as u32;

        Self {
            lbk_offset,
            lbk_mask: field_mask(lbaf.lbk_len as u64),
            chk_offset,
            chk_mask: field_mask(lbaf.chk_len as u64),
            pu_offset,
            pu_mask: field_mask(lbaf.pu_len as u64),
            grp_offset,
            grp_mask: field_mask(lbaf.grp_len as u64),
            ppa_len: grp_offset + lbaf.grp_len as u32,
        }
    }

    /// Total number of address bits of the packed form.
    pub fn ppa_len(&self) -> u32 {
        self.ppa_len
    }

    /// Whether L2P entries fit into 32 bits (31 address bits plus the
    /// cache flag).
    pub fn is_narrow(&self) -> bool {
        self.ppa_len < 32
    }

    /// Pack a media address into the device wire form.
    pub fn pack(&self, ppa: Ppa) -> u64 {
        debug_assert!(!ppa.is_cached() && !ppa.is_invalid());
        ((ppa.lbk() as u64) << self.lbk_offset)
            | ((ppa.chk() as u64) << self.chk_offset)
            | ((ppa.pu() as u64) << self.pu_offset)
            | ((ppa.grp() as u64) << self.grp_offset)
    }

    /// Unpack a device wire address.
    pub fn unpack(&self, raw: u64) -> Ppa {
        Ppa::new(
            ((raw >> self.grp_offset) & self.grp_mask) as u32,
            ((raw >> self.pu_offset) & self.pu_mask) as u32,
            ((raw >> self.chk_offset) & self.chk_mask) as u32,
            ((raw >> self.lbk_offset) & self.lbk_mask) as u32,
        )
    }

    /// Pack into the 32-bit L2P entry form. Bit 31 carries the cache flag;
    /// the all-ones word is the invalid sentinel.
    pub fn to_packed32(&self, ppa: Ppa) -> u32 {
        debug_assert!(self.is_narrow());
        if ppa.is_invalid() {
            u32::MAX
        } else if ppa.is_cached() {
            (1 << 31) | (ppa.cache_offset() as u32)
        } else {
            self.pack(ppa) as u32
        }
    }

    /// Inverse of [`Self::to_packed32`].
    pub fn from_packed32(&self, raw: u32) -> Ppa {
        if raw == u32::MAX {
            Ppa::invalid()
        } else if raw & (1 << 31) != 0 {
            Ppa::cached((raw & !(1 << 31)) as u64)
        } else {
            self.unpack(raw as u64)
        }
    }

    /// Pack into the 64-bit L2P entry form (the logical layout itself).
    pub fn to_packed64(&self, ppa: Ppa) -> u64 {
        ppa.raw
    }

    /// Inverse of [`Self::to_packed64`].
    pub fn from_packed64(&self, raw: u64) -> Ppa {
        Ppa { raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_geo() -> Geometry {
        Geometry {
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
        }
    }

    #[test]
    fn ppa_fields() {
        let ppa = Ppa::new(2, 1, 68, 31);
        assert_eq!(ppa.grp(), 2);
        assert_eq!(ppa.pu(), 1);
        assert_eq!(ppa.chk(), 68);
        assert_eq!(ppa.lbk(), 31);
        assert!(!ppa.is_invalid());
        assert!(!ppa.is_cached());

        let ppa = ppa.with_lbk(99).with_chk(42);
        assert_eq!(ppa.lbk(), 99);
        assert_eq!(ppa.chk(), 42);
        assert_eq!(ppa.grp(), 2);
    }

    #[test]
    fn ppa_sentinels() {
        assert!(Ppa::invalid().is_invalid());
        assert!(!Ppa::invalid().is_cached());

        let cached = Ppa::cached(1337);
        assert!(cached.is_cached());
        assert!(!cached.is_invalid());
        assert_eq!(cached.cache_offset(), 1337);
    }

    #[test]
    fn pack_round_trip() {
        let fmt = PpaFormat::new(&test_geo());
        assert_eq!(fmt.ppa_len(), 22);
        assert!(fmt.is_narrow());

        for grp in 0..4 {
            for pu in 0..3 {
                for &chk in &[0u32, 68, 1499] {
                    for &lbk in &[0u32, 1, 99] {
                        let ppa = Ppa::new(grp, pu, chk, lbk);
                        assert_eq!(fmt.unpack(fmt.pack(ppa)), ppa);
                    }
                }
            }
        }
    }

    #[test]
    fn packed32_round_trip() {
        let fmt = PpaFormat::new(&test_geo());

        let ppa = Ppa::new(2, 0, 68, 5);
        assert_eq!(fmt.from_packed32(fmt.to_packed32(ppa)), ppa);

        let cached = Ppa::cached(96);
        assert_eq!(fmt.from_packed32(fmt.to_packed32(cached)), cached);

        let invalid = Ppa::invalid();
        assert!(fmt.from_packed32(fmt.to_packed32(invalid)).is_invalid());
    }

    #[test]
    fn punit_range() {
        let range = PunitRange { begin: 2, end: 9 };
        assert_eq!(range.num_punits(), 8);
        assert!(range.intersects(&PunitRange { begin: 9, end: 11 }));
        assert!(range.intersects(&PunitRange { begin: 0, end: 2 }));
        assert!(!range.intersects(&PunitRange { begin: 10, end: 11 }));
    }
}
