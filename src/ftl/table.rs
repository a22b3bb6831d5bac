//! The logical-to-physical block table.
//!
//! The table lives only in memory. The mapping itself is persisted as the logical block number
//! in each block's spare area, and the table is rebuilt from scratch by scanning those records
//! whenever a block changes hands.

use super::error::{FtlError, Result};
use super::spare::SpareMeta;
use crate::nand::{Geometry, RawNand};

use log::{debug, warn};

/// Value of an unassigned table slot
const NO_BLOCK: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct BlockTable {
    /// Indexed by logical block number
    map: Box<[u32]>,

    /// Logical blocks `0..valid` are all mapped
    valid: u32,
}

impl BlockTable {
    /// An empty table for a device of the given geometry
    pub fn new(geometry: Geometry) -> Self {
        Self {
            map: vec![NO_BLOCK; geometry.blocks as usize].into_boxed_slice(),
            valid: 0,
        }
    }

    /// How many logical blocks are addressable; zero when the device isn't formatted
    pub fn valid_blocks(&self) -> u32 {
        self.valid
    }

    /// Resolve a logical block number to the physical block holding it
    pub fn lookup(&self, lbn: u32) -> Result<u32> {
        if lbn >= self.valid {
            return Err(FtlError::NotFormatted {
                mapped: self.valid,
                required: lbn.saturating_add(1),
            });
        }
        Ok(self.map[lbn as usize])
    }

    /// The logical block number a physical block currently holds, if any
    pub fn lbn_of(&self, pbn: u32) -> Option<u32> {
        self.map[..self.valid as usize]
            .iter()
            .position(|&mapped| mapped == pbn)
            .map(|lbn| lbn as u32)
    }

    /// Forget every mapping
    pub fn clear(&mut self) {
        self.map.fill(NO_BLOCK);
        self.valid = 0;
    }

    /// Rebuild the table from the spare records of every block.
    ///
    /// The logical numbers found must form a dense range `0..n` without duplicates, and `n`
    /// must be at least `min_blocks`. On failure the table is left empty. Returns the number
    /// of valid logical blocks.
    pub fn rebuild<N: RawNand + ?Sized>(&mut self, nand: &mut N, min_blocks: u32) -> Result<u32> {
        self.clear();
        let result = self.scan(nand, min_blocks);
        match &result {
            Ok(valid) => debug!("block table rebuilt: {valid} logical blocks"),
            Err(e) => {
                debug!("block table rebuild failed: {e}");
                self.clear();
            }
        }
        result
    }

    fn scan<N: RawNand + ?Sized>(&mut self, nand: &mut N, min_blocks: u32) -> Result<u32> {
        let geometry = nand.geometry();

        for pbn in 0..geometry.blocks {
            let Some(lbn) = SpareMeta::read(nand, geometry.page_of(pbn, 0))?.lbn() else {
                continue;
            };

            // A block that resisted marking in its first page only carries the mark in its
            // second page
            if SpareMeta::read(nand, geometry.page_of(pbn, 1))?.is_bad() {
                continue;
            }

            if lbn >= geometry.blocks {
                warn!("block {pbn} records out-of-range logical block {lbn}");
                continue;
            }

            let slot = &mut self.map[lbn as usize];
            if *slot != NO_BLOCK {
                return Err(FtlError::Corrupt {
                    lbn,
                    detail: format!("held by both block {} and block {pbn}", *slot),
                });
            }
            *slot = pbn;
        }

        let valid = self
            .map
            .iter()
            .position(|&pbn| pbn == NO_BLOCK)
            .unwrap_or(self.map.len()) as u32;

        if let Some(stray) = self.map[valid as usize..]
            .iter()
            .position(|&pbn| pbn != NO_BLOCK)
        {
            let lbn = valid + stray as u32;
            return Err(FtlError::Corrupt {
                lbn,
                detail: format!("mapped past the first unmapped logical block {valid}"),
            });
        }

        if valid < min_blocks {
            return Err(FtlError::NotFormatted {
                mapped: valid,
                required: min_blocks,
            });
        }

        self.valid = valid;
        Ok(valid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::alloc;
    use crate::nand::sim::TEST_GEOMETRY;
    use crate::nand::SimNand;

    /// Give blocks `first..first + count` the logical numbers `0..count`
    fn assign(nand: &mut SimNand, first: u32, count: u32) -> anyhow::Result<()> {
        for lbn in 0..count {
            SpareMeta::with_lbn(lbn as u16).write(nand, TEST_GEOMETRY.page_of(first + lbn, 0))?;
        }
        Ok(())
    }

    #[test]
    fn test_rebuild() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.factory_bad(2);
        assign(&mut nand, 3, 20)?;
        SpareMeta::with_lbn(20).write(&mut nand, TEST_GEOMETRY.page_of(0, 0))?;

        let mut table = BlockTable::new(TEST_GEOMETRY);
        nand.reset_stats();
        assert_eq!(table.rebuild(&mut nand, 10)?, 21);
        assert_eq!(nand.stats().programs, 0);

        assert_eq!(table.lookup(0)?, 3);
        assert_eq!(table.lookup(19)?, 22);
        assert_eq!(table.lookup(20)?, 0);
        assert!(matches!(
            table.lookup(21),
            Err(FtlError::NotFormatted { .. })
        ));
        assert_eq!(table.lbn_of(22), Some(19));
        assert_eq!(table.lbn_of(2), None);
        Ok(())
    }

    #[test]
    fn test_rebuild_skips_bad_blocks() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        assign(&mut nand, 0, 12)?;

        // Same logical number, but retired through its second page
        SpareMeta::with_lbn(5).write(&mut nand, TEST_GEOMETRY.page_of(40, 0))?;
        SpareMeta::bad().write(&mut nand, TEST_GEOMETRY.page_of(40, 1))?;

        // Out-of-range numbers are ignored
        SpareMeta::with_lbn(1000).write(&mut nand, TEST_GEOMETRY.page_of(41, 0))?;

        let mut table = BlockTable::new(TEST_GEOMETRY);
        assert_eq!(table.rebuild(&mut nand, 10)?, 12);
        assert_eq!(table.lookup(5)?, 5);

        alloc::mark_bad(&mut nand, 11);
        assert_eq!(table.rebuild(&mut nand, 10)?, 11);
        assert_eq!(table.lbn_of(11), None);
        Ok(())
    }

    #[test]
    fn test_rebuild_duplicate() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        assign(&mut nand, 0, 12)?;
        SpareMeta::with_lbn(7).write(&mut nand, TEST_GEOMETRY.page_of(50, 0))?;

        let mut table = BlockTable::new(TEST_GEOMETRY);
        let err = table.rebuild(&mut nand, 10).unwrap_err();
        assert!(matches!(err, FtlError::Corrupt { lbn: 7, .. }));
        assert_eq!(table.valid_blocks(), 0);
        Ok(())
    }

    #[test]
    fn test_rebuild_gap() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        assign(&mut nand, 0, 12)?;
        SpareMeta::with_lbn(14).write(&mut nand, TEST_GEOMETRY.page_of(60, 0))?;

        let mut table = BlockTable::new(TEST_GEOMETRY);
        let err = table.rebuild(&mut nand, 10).unwrap_err();
        assert!(matches!(err, FtlError::Corrupt { lbn: 14, .. }));
        Ok(())
    }

    #[test]
    fn test_rebuild_unformatted() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let mut table = BlockTable::new(TEST_GEOMETRY);
        assert!(matches!(
            table.rebuild(&mut nand, 10),
            Err(FtlError::NotFormatted {
                mapped: 0,
                required: 10
            })
        ));

        assign(&mut nand, 0, 9)?;
        assert!(matches!(
            table.rebuild(&mut nand, 10),
            Err(FtlError::NotFormatted { mapped: 9, .. })
        ));
        assert_eq!(table.valid_blocks(), 0);
        assert!(matches!(
            table.lookup(u32::MAX),
            Err(FtlError::NotFormatted {
                mapped: 0,
                required: u32::MAX
            })
        ));
        Ok(())
    }
}
