//! Block classification, bad block bookkeeping and replacement block selection.
//!
//! Nothing here is cached: the state of a block is always read back from its spare area, so the
//! answers stay correct across relocations, power cycles and other tools touching the flash.

use super::error::Result;
use super::spare::{SpareMeta, NO_LBN};
use crate::nand::RawNand;

use log::{error, warn};

/// These are the states that a given physical block may be detected in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockState {
    /// The block is bad, and must never be allocated
    Bad,

    /// The block is erased and unassigned; it belongs to the reserve pool
    Free,

    /// The block carries a logical block number or written data
    Used,
}

/// Counts of blocks in each [BlockState]
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct BlockHealth {
    pub bad: u32,
    pub used: u32,
    pub free: u32,
}

impl BlockHealth {
    pub fn total(&self) -> u32 {
        self.bad + self.used + self.free
    }
}

impl FromIterator<BlockState> for BlockHealth {
    fn from_iter<I: IntoIterator<Item = BlockState>>(iter: I) -> Self {
        let mut health = Self::default();
        for state in iter {
            match state {
                BlockState::Bad => health.bad += 1,
                BlockState::Used => health.used += 1,
                BlockState::Free => health.free += 1,
            }
        }
        health
    }
}

/// Read the bad block indicator of the first page, falling back to the second page
pub fn is_bad<N: RawNand + ?Sized>(nand: &mut N, pbn: u32) -> Result<bool> {
    let geometry = nand.geometry();
    if SpareMeta::read(nand, geometry.page_of(pbn, 0))?.is_bad() {
        return Ok(true);
    }
    Ok(SpareMeta::read(nand, geometry.page_of(pbn, 1))?.is_bad())
}

/// Characterize a block from its first page's spare area
pub fn block_state<N: RawNand + ?Sized>(nand: &mut N, pbn: u32) -> Result<BlockState> {
    if is_bad(nand, pbn)? {
        return Ok(BlockState::Bad);
    }

    let page = nand.geometry().page_of(pbn, 0);
    let meta = SpareMeta::read(nand, page)?;
    if meta.is_used() || meta.lbn != NO_LBN {
        Ok(BlockState::Used)
    } else {
        Ok(BlockState::Free)
    }
}

/// A block is free if it is good, has never been written and holds no logical block number
pub fn is_free<N: RawNand + ?Sized>(nand: &mut N, pbn: u32) -> Result<bool> {
    Ok(block_state(nand, pbn)? == BlockState::Free)
}

/// Search for a free block in the given plane, starting from the end of the device.
///
/// Copy-back only works between blocks of the same plane, so only blocks whose plane bit equals
/// `plane` are considered. Returns `None` when the plane has no free block left.
pub fn find_free_block<N: RawNand + ?Sized>(nand: &mut N, plane: u32) -> Result<Option<u32>> {
    let geometry = nand.geometry();

    let mut pbn = geometry.blocks - 1;
    if geometry.plane_of(pbn) != plane & 1 {
        match pbn.checked_sub(1) {
            Some(below) => pbn = below,
            None => return Ok(None),
        }
    }

    loop {
        if is_free(nand, pbn)? {
            return Ok(Some(pbn));
        }
        match pbn.checked_sub(2) {
            Some(below) => pbn = below,
            None => return Ok(None),
        }
    }
}

/// Flag a block as holding data. An error means the block should be retired.
pub fn mark_used<N: RawNand + ?Sized>(nand: &mut N, pbn: u32) -> Result<()> {
    let page = nand.geometry().page_of(pbn, 0);
    SpareMeta::used().write(nand, page)
}

/// Retire a block for good. This never fails; a block that can't even be marked is only logged.
pub fn mark_bad<N: RawNand + ?Sized>(nand: &mut N, pbn: u32) {
    let geometry = nand.geometry();
    warn!("retiring block {pbn}");

    if let Err(first) = SpareMeta::bad().write(nand, geometry.page_of(pbn, 0)) {
        // Manufacturers also accept the marker in the second page
        if let Err(second) = SpareMeta::bad().write(nand, geometry.page_of(pbn, 1)) {
            error!("block {pbn} could not be marked bad: {first}; {second}");
        }
    }
}

/// Classify every block of the device
pub fn scan_states<N: RawNand + ?Sized>(nand: &mut N) -> Result<Vec<BlockState>> {
    let block_count = nand.geometry().blocks;
    let rpt = howudoin::new()
        .label("Classifying blocks")
        .set_len(u64::from(block_count));

    let mut states = Vec::with_capacity(block_count as usize);
    for pbn in 0..block_count {
        states.push(block_state(nand, pbn)?);
        rpt.inc();
    }

    rpt.close();
    Ok(states)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::sim::TEST_GEOMETRY;
    use crate::nand::{SimFault, SimNand};

    #[test]
    fn test_fresh_blocks_are_free() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let health: BlockHealth = scan_states(&mut nand)?.into_iter().collect();
        assert_eq!(
            health,
            BlockHealth {
                bad: 0,
                used: 0,
                free: TEST_GEOMETRY.blocks
            }
        );
        Ok(())
    }

    #[test]
    fn test_bad_marker_in_second_page() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        SpareMeta::bad().write(&mut nand, TEST_GEOMETRY.page_of(9, 1))?;
        assert!(is_bad(&mut nand, 9)?);
        assert!(!is_free(&mut nand, 9)?);
        assert!(!is_bad(&mut nand, 8)?);
        Ok(())
    }

    #[test]
    fn test_mark_used_and_bad() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        mark_used(&mut nand, 3)?;
        assert_eq!(block_state(&mut nand, 3)?, BlockState::Used);

        mark_bad(&mut nand, 4);
        assert_eq!(block_state(&mut nand, 4)?, BlockState::Bad);

        // A stuck bit still leaves a non-erased marker behind
        nand.inject(5, SimFault::StuckBit);
        mark_bad(&mut nand, 5);
        assert!(is_bad(&mut nand, 5)?);

        // Unmarkable blocks are only logged
        nand.inject(6, SimFault::Program);
        mark_bad(&mut nand, 6);
        assert!(!is_bad(&mut nand, 6)?);
        assert!(mark_used(&mut nand, 6).is_err());
        Ok(())
    }

    #[test]
    fn test_find_free_block_honors_plane() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let last = TEST_GEOMETRY.blocks - 1;

        assert_eq!(find_free_block(&mut nand, 1)?, Some(last));
        assert_eq!(find_free_block(&mut nand, 0)?, Some(last - 1));

        mark_bad(&mut nand, last);
        mark_used(&mut nand, last - 2)?;
        nand.factory_bad(last - 4);
        assert_eq!(find_free_block(&mut nand, 1)?, Some(last - 6));
        assert_eq!(find_free_block(&mut nand, 0)?, Some(last - 1));
        Ok(())
    }

    #[test]
    fn test_find_free_block_exhausted() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        for pbn in (0..TEST_GEOMETRY.blocks).filter(|pbn| pbn % 2 == 0) {
            SpareMeta::with_lbn(pbn as u16).write(&mut nand, TEST_GEOMETRY.page_of(pbn, 0))?;
        }
        assert_eq!(find_free_block(&mut nand, 0)?, None);
        assert!(find_free_block(&mut nand, 1)?.is_some());
        Ok(())
    }
}
