// SPDX-License-Identifier: MPL-2.0

//! Device configuration.

use serde::{Deserialize, Serialize};

use crate::{geom::BLOCK_SIZE, prelude::*};

/// Write-limit tiers, ordered by decreasing severity (and increasing
/// free-band thresholds).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(usize)]
pub enum LimitTier {
    Crit = 0,
    High = 1,
    Low = 2,
    Start = 3,
}

impl LimitTier {
    pub const COUNT: usize = 4;

    pub const ALL: [LimitTier; Self::COUNT] =
        [Self::Crit, Self::High, Self::Low, Self::Start];
}

/// A single admission threshold: when the number of free bands drops to
/// `thld`, user writes are limited to `limit` percent of the write buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub thld: usize,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefragConf {
    /// Admission thresholds, indexed by [`LimitTier`].
    pub limits: [Limit; LimitTier::COUNT],
    /// Percentage of invalid blocks above which a band becomes a defrag
    /// candidate.
    pub invld_thld: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcssdConf {
    pub defrag: DefragConf,
    /// Percentage of blocks held back from the advertised capacity.
    pub lba_rsvd: usize,
    /// Size of the ring write buffer in bytes.
    pub rwb_size: usize,
    /// Band fill percentage at which the next band is pre-erased.
    pub band_thld: usize,
    /// Max IO depth per band relocation.
    pub max_reloc_qdepth: usize,
    /// Max number of concurrently active band relocations.
    pub max_active_relocs: usize,
}

impl Default for OcssdConf {
    fn default() -> Self {
        Self {
            defrag: DefragConf {
                limits: [
                    // 5 free bands / 0 % host writes
                    Limit { thld: 5, limit: 0 },
                    // 10 free bands / 5 % host writes
                    Limit { thld: 10, limit: 5 },
                    // 20 free bands / 40 % host writes
                    Limit { thld: 20, limit: 40 },
                    // 40 free bands / 100 % host writes - defrag starts running
                    Limit {
                        thld: 40,
                        limit: 100,
                    },
                ],
                // 10 percent valid lbks
                invld_thld: 10,
            },
            // 20% spare lbks
            lba_rsvd: 20,
            // 6M write buffer
            rwb_size: 6 * 1024 * 1024,
            // 90% band fill threshold
            band_thld: 90,
            // Max 32 IO depth per band relocate
            max_reloc_qdepth: 32,
            // Max 3 active band relocates
            max_active_relocs: 3,
        }
    }
}

impl OcssdConf {
    /// Check that the configuration is internally consistent. `xfer_size`
    /// is the device's optimal write size in blocks.
    pub fn validate(&self, xfer_size: usize) -> Result<()> {
        if self.defrag.invld_thld >= 100 {
            bail!(InvalidArgs, "invld_thld must be below 100 percent");
        }
        if self.lba_rsvd == 0 || self.lba_rsvd >= 100 {
            bail!(InvalidArgs, "lba_rsvd must be within 1..99 percent");
        }
        if self.rwb_size == 0 || self.rwb_size % (BLOCK_SIZE * xfer_size) != 0 {
            bail!(
                InvalidArgs,
                "rwb_size must be a non-zero multiple of BLOCK_SIZE * xfer_size"
            );
        }
        if self.band_thld == 0 || self.band_thld > 100 {
            bail!(InvalidArgs, "band_thld must be within 1..100 percent");
        }
        if self.max_reloc_qdepth == 0 || self.max_active_relocs == 0 {
            bail!(InvalidArgs, "relocation depths must be non-zero");
        }
        for limit in &self.defrag.limits {
            if limit.limit > 100 {
                bail!(InvalidArgs, "write limits are percentages");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let conf = OcssdConf::default();
        assert!(conf.validate(16).is_ok());
        assert_eq!(conf.defrag.limits[LimitTier::Crit as usize].limit, 0);
        assert_eq!(conf.defrag.limits[LimitTier::Start as usize].thld, 40);
    }

    #[test]
    fn rejects_bad_values() {
        let mut conf = OcssdConf::default();
        conf.lba_rsvd = 0;
        assert!(conf.validate(16).is_err());

        let mut conf = OcssdConf::default();
        conf.rwb_size = BLOCK_SIZE * 16 + 1;
        assert!(conf.validate(16).is_err());

        let mut conf = OcssdConf::default();
        conf.defrag.limits[0].limit = 101;
        assert!(conf.validate(16).is_err());
    }
}
