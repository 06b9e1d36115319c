// SPDX-License-Identifier: MPL-2.0

//! The logical-to-physical table.
//!
//! One entry per user LBA, read and written with single-word atomics. When
//! the packed PPA fits in 31 bits the table uses 32-bit entries, otherwise
//! 64-bit ones.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::geom::{Lba, Ppa, PpaFormat};

enum Entries {
    Narrow(Box<[AtomicU32]>),
    Wide(Box<[AtomicU64]>),
}

pub struct L2pTable {
    entries: Entries,
    fmt: PpaFormat,
}

impl L2pTable {
    /// Allocate a table of `len` entries, all set to the invalid sentinel.
    pub fn new(len: u64, fmt: PpaFormat) -> Self {
        let entries = if fmt.is_narrow() {
            let v: Vec<AtomicU32> = (0..len).map(|_| AtomicU32::new(u32::MAX)).collect();
            Entries::Narrow(v.into_boxed_slice())
        } else {
            let v: Vec<AtomicU64> = (0..len).map(|_| AtomicU64::new(u64::MAX)).collect();
            Entries::Wide(v.into_boxed_slice())
        };
        Self { entries, fmt }
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        match &self.entries {
            Entries::Narrow(v) => v.len() as u64,
            Entries::Wide(v) => v.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, lba: Lba) -> Ppa {
        match &self.entries {
            Entries::Narrow(v) => self.fmt.from_packed32(v[lba as usize].load(Ordering::Acquire)),
            Entries::Wide(v) => self.fmt.from_packed64(v[lba as usize].load(Ordering::Acquire)),
        }
    }

    pub fn set(&self, lba: Lba, ppa: Ppa) {
        match &self.entries {
            Entries::Narrow(v) => {
                v[lba as usize].store(self.fmt.to_packed32(ppa), Ordering::Release)
            }
            Entries::Wide(v) => v[lba as usize].store(self.fmt.to_packed64(ppa), Ordering::Release),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{Geometry, LbaFormat};

    fn narrow_fmt() -> PpaFormat {
        PpaFormat::new(&Geometry {
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
        })
    }

    fn wide_fmt() -> PpaFormat {
        PpaFormat::new(&Geometry {
            num_grp: 4,
            num_pu: 8,
            num_chk: 1500,
            clba: 6000,
            ws_opt: 16,
            ws_min: 4,
            lbaf: LbaFormat {
                grp_len: 8,
                pu_len: 8,
                chk_len: 11,
                lbk_len: 13,
            },
        })
    }

    #[test]
    fn narrow_entries() {
        let fmt = narrow_fmt();
        assert!(fmt.is_narrow());
        let l2p = L2pTable::new(128, fmt);

        assert!(l2p.get(0).is_invalid());
        assert!(l2p.get(127).is_invalid());

        let ppa = Ppa::new(2, 0, 68, 5);
        l2p.set(42, ppa);
        assert_eq!(l2p.get(42), ppa);

        l2p.set(42, Ppa::cached(96));
        let got = l2p.get(42);
        assert!(got.is_cached());
        assert_eq!(got.cache_offset(), 96);

        l2p.set(42, Ppa::invalid());
        assert!(l2p.get(42).is_invalid());
    }

    #[test]
    fn wide_entries() {
        let fmt = wide_fmt();
        assert!(!fmt.is_narrow());
        let l2p = L2pTable::new(128, fmt);

        let ppa = Ppa::new(3, 7, 1499, 5999);
        l2p.set(0, ppa);
        assert_eq!(l2p.get(0), ppa);

        l2p.set(0, Ppa::cached(1 << 20));
        let got = l2p.get(0);
        assert!(got.is_cached());
        assert_eq!(got.cache_offset(), 1 << 20);
    }
}
