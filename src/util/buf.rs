// SPDX-License-Identifier: MPL-2.0

//! Block-sized data buffers.
//!
//! Data moves through the translation layer in whole logical blocks, so
//! buffers are allocated and addressed in blocks. `Buf` dereferences to a
//! byte slice for the places that want the raw region (metadata packing,
//! media submission) and offers per-block views for the fill and read
//! paths.

use core::ops::{Deref, DerefMut};

use crate::prelude::*;

/// An owned, zero-initialized buffer holding a whole number of blocks.
pub struct Buf {
    bytes: Vec<u8>,
}

impl Buf {
    /// Allocate `nblocks` zeroed blocks.
    pub fn alloc(nblocks: usize) -> Result<Self> {
        if nblocks == 0 {
            bail!(InvalidArgs, "buffers are sized in whole blocks");
        }
        Ok(Self {
            bytes: vec![0; nblocks * BLOCK_SIZE],
        })
    }

    /// How many blocks the buffer holds.
    pub fn nblocks(&self) -> usize {
        self.bytes.len() / BLOCK_SIZE
    }

    /// The `idx`-th block.
    pub fn block(&self, idx: usize) -> &[u8] {
        &self.bytes[idx * BLOCK_SIZE..(idx + 1) * BLOCK_SIZE]
    }

    /// The `idx`-th block, mutably.
    pub fn block_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.bytes[idx * BLOCK_SIZE..(idx + 1) * BLOCK_SIZE]
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl TryFrom<Vec<u8>> for Buf {
    type Error = crate::error::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % BLOCK_SIZE != 0 {
            bail!(InvalidArgs, "buffers hold a whole number of blocks");
        }
        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::{Buf, BLOCK_SIZE};

    #[test]
    fn buf() {
        let mut buf = Buf::alloc(10).unwrap();
        assert_eq!(buf.nblocks(), 10);
        assert_eq!(buf.len(), 10 * BLOCK_SIZE);

        buf.block_mut(3).fill(0x68);
        assert_eq!(buf.block(3), &[0x68u8; BLOCK_SIZE][..]);
        assert_eq!(buf.block(2), &[0u8; BLOCK_SIZE][..]);
        // The raw region sees the same bytes.
        assert_eq!(buf[3 * BLOCK_SIZE], 0x68);

        assert!(Buf::alloc(0).is_err());
        assert!(Buf::try_from(vec![0u8; 100]).is_err());
        assert!(Buf::try_from(vec![0u8; BLOCK_SIZE]).is_ok());
    }
}
