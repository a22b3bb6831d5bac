//! Low-level formatting and the destructive block self-test.

use super::alloc;
use super::error::{FtlError, Result};
use super::spare::{SpareMeta, NO_LBN};
use super::verify::Verify;
use super::Ftl;
use crate::nand::{NandError, PageUtil, RawNand};

use log::{info, warn};

impl<N: RawNand, V: Verify> Ftl<N, V> {
    /// Erase the whole device and lay out a fresh block table.
    ///
    /// Every good block is erased; blocks that fail to erase are retired. The first
    /// `data_percent` of the good blocks, in physical order, get the logical numbers
    /// `0..n`, and the rest become the reserve pool. Returns `n`.
    pub fn format(&mut self) -> Result<u32> {
        let geometry = self.geometry();
        let required = self.config.min_blocks;
        self.table.clear();

        let rpt = howudoin::new()
            .label("Erasing blocks")
            .set_len(u64::from(geometry.blocks));
        let mut good = Vec::with_capacity(geometry.blocks as usize);
        for pbn in 0..geometry.blocks {
            if !alloc::is_bad(&mut self.nand, pbn)? {
                match self.nand.erase_block(pbn) {
                    Ok(()) => good.push(pbn),
                    Err(NandError::EraseFailed { .. }) => alloc::mark_bad(&mut self.nand, pbn),
                    Err(e) => return Err(e.into()),
                }
            }
            rpt.inc();
        }
        rpt.close();

        let good_count = good.len() as u32;
        let data_blocks = self
            .config
            .data_blocks(good_count)
            .min(u32::from(NO_LBN));
        if good_count < required || data_blocks < required {
            return Err(FtlError::TooFewGoodBlocks {
                good: good_count,
                required,
            });
        }

        let rpt = howudoin::new()
            .label("Assigning logical blocks")
            .set_len(u64::from(data_blocks));
        let mut lbn = 0;
        let mut retired = 0;
        for &pbn in &good {
            if lbn == data_blocks {
                break;
            }

            if self.assign(pbn, lbn)? {
                lbn += 1;
                rpt.inc();
            } else {
                alloc::mark_bad(&mut self.nand, pbn);
                retired += 1;
            }
        }
        rpt.close();

        if lbn < data_blocks {
            return Err(FtlError::TooFewGoodBlocks {
                good: good_count - retired,
                required: data_blocks,
            });
        }

        let valid = self.rebuild()?;
        info!(
            "formatted: {valid} logical blocks, {} in reserve, {} bad",
            good_count - retired - valid,
            geometry.blocks - good_count + retired
        );
        Ok(valid)
    }

    /// Record a logical block number in a freshly-erased block. Returns `false` if the block
    /// didn't take it.
    fn assign(&mut self, pbn: u32, lbn: u32) -> Result<bool> {
        let page = self.geometry().page_of(pbn, 0);
        match SpareMeta::with_lbn(lbn as u16).write(&mut self.nand, page) {
            Ok(()) => {}
            Err(FtlError::ProgramVerifyFailed { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        Ok(SpareMeta::read(&mut self.nand, page)?.lbn() == Some(lbn))
    }

    /// Destructively test one block: erase it, check it's blank, fill it with zeros and check
    /// that, `scan_cycles` times over, and leave it erased.
    ///
    /// A failing block is not retired here; that is up to the caller. Testing a block that holds
    /// a logical block destroys the format, and the block table is rebuilt accordingly.
    pub fn scan_block(&mut self, pbn: u32) -> Result<()> {
        self.check_block(pbn)?;
        if alloc::is_bad(&mut self.nand, pbn)? {
            return Err(FtlError::BadBlockEncountered { block: pbn });
        }

        let was_mapped = self.table.lbn_of(pbn).is_some();
        let result = self.exercise_block(pbn);

        if was_mapped {
            if let Err(e) = self.rebuild() {
                warn!("block table invalid after testing block {pbn}: {e}");
            }
        }
        result
    }

    /// Test every good block, retiring those that fail. Returns the blocks newly found bad.
    ///
    /// This erases the whole device, so it has to be formatted again afterwards.
    pub fn scan_all(&mut self) -> Result<Vec<u32>> {
        let block_count = self.geometry().blocks;
        self.table.clear();

        let rpt = howudoin::new()
            .label("Testing blocks")
            .set_len(u64::from(block_count));
        let mut newly_bad = vec![];
        for pbn in 0..block_count {
            if !alloc::is_bad(&mut self.nand, pbn)? {
                match self.exercise_block(pbn) {
                    Ok(()) => {}
                    Err(FtlError::Timeout) => return Err(FtlError::Timeout),
                    Err(e) => {
                        warn!("block {pbn} failed its self-test: {e}");
                        alloc::mark_bad(&mut self.nand, pbn);
                        newly_bad.push(pbn);
                    }
                }
            }
            rpt.inc();
        }
        rpt.close();

        info!("self-test done, {} new bad blocks", newly_bad.len());
        Ok(newly_bad)
    }

    fn exercise_block(&mut self, pbn: u32) -> Result<()> {
        let geometry = self.geometry();
        let zeros = vec![0; geometry.page_total()];
        let mut buf = vec![0; geometry.page_total()];

        for _ in 0..self.config.scan_cycles {
            self.erase_and_check(pbn, &mut buf)?;

            for page in (0..geometry.pages_per_block).map(|p| geometry.page_of(pbn, p)) {
                self.nand.write_page(page, 0, &zeros)?;
                self.nand.read_page(page, 0, &mut buf)?;
                if !buf.is_filled_with(0) {
                    return Err(FtlError::ProgramVerifyFailed { page });
                }
            }
        }

        self.erase_and_check(pbn, &mut buf)
    }

    /// Erase a block and make sure every byte of it, spare included, reads back as erased
    fn erase_and_check(&mut self, pbn: u32, buf: &mut [u8]) -> Result<()> {
        let geometry = self.geometry();
        self.nand.erase_block(pbn)?;

        for page in (0..geometry.pages_per_block).map(|p| geometry.page_of(pbn, p)) {
            self.nand.read_page(page, 0, buf)?;
            if !buf.is_erased() {
                return Err(FtlError::EraseFailed { block: pbn });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ftl::FtlConfig;
    use crate::nand::sim::TEST_GEOMETRY;
    use crate::nand::{SimFault, SimNand};

    fn ftl(nand: SimNand) -> Ftl<SimNand> {
        let config = FtlConfig::default().min_blocks(10).scan_cycles(2);
        Ftl::new(nand, config)
    }

    #[test]
    fn test_format() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.factory_bad(0);
        nand.factory_bad(7);
        nand.inject(3, SimFault::Erase);

        // Leftovers from a previous life
        nand.write_page(TEST_GEOMETRY.page_of(9, 4), 0, &[0x55; 16])?;

        let mut ftl = ftl(nand);
        // 125 good blocks, 98% of which is 122.5
        assert_eq!(ftl.format()?, 122);
        assert_eq!(ftl.valid_blocks(), 122);
        assert_eq!(ftl.table().lookup(0)?, 1);
        assert_eq!(ftl.table().lookup(1)?, 2);
        assert_eq!(ftl.table().lookup(2)?, 4);
        assert!(alloc::is_bad(ftl.nand_mut(), 3)?);
        assert!(ftl.read(0, 4096)?.is_erased());

        let health = ftl.block_health()?;
        assert_eq!(health.bad, 3);
        assert_eq!(health.used, 122);
        assert_eq!(health.free, 3);
        Ok(())
    }

    #[test]
    fn test_format_rejects_unassignable_blocks() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.inject(5, SimFault::Program);

        let mut ftl = ftl(nand);
        assert_eq!(ftl.format()?, 125);
        assert_eq!(ftl.table().lookup(5)?, 6);
        assert_eq!(ftl.table().lbn_of(5), None);
        Ok(())
    }

    #[test]
    fn test_format_too_few_good_blocks() {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        for pbn in 0..120 {
            nand.factory_bad(pbn);
        }

        let mut ftl = ftl(nand);
        assert!(matches!(
            ftl.format(),
            Err(FtlError::TooFewGoodBlocks {
                good: 8,
                required: 10
            })
        ));
        assert_eq!(ftl.valid_blocks(), 0);
    }

    #[test]
    fn test_scan_block() -> anyhow::Result<()> {
        let mut ftl = ftl(SimNand::new(TEST_GEOMETRY));
        ftl.format()?;

        // Reserve blocks can be tested without disturbing the table
        ftl.scan_block(127)?;
        assert_eq!(ftl.nand().erase_count(127), 4);
        assert_eq!(ftl.valid_blocks(), 125);

        ftl.nand_mut().inject(126, SimFault::StuckBit);
        assert!(matches!(
            ftl.scan_block(126),
            Err(FtlError::ProgramVerifyFailed { .. })
        ));
        ftl.nand_mut().inject(125, SimFault::Erase);
        assert!(matches!(
            ftl.scan_block(125),
            Err(FtlError::EraseFailed { block: 125 })
        ));

        ftl.nand_mut().factory_bad(125);
        assert!(matches!(
            ftl.scan_block(125),
            Err(FtlError::BadBlockEncountered { block: 125 })
        ));

        for pbn in [TEST_GEOMETRY.blocks, u32::MAX] {
            assert!(matches!(
                ftl.scan_block(pbn),
                Err(FtlError::BlockOutOfRange { blocks: 128, .. })
            ));
        }

        // Testing the last logical block costs exactly that block
        ftl.scan_block(124)?;
        assert_eq!(ftl.valid_blocks(), 124);
        Ok(())
    }

    #[test]
    fn test_scan_all() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.factory_bad(10);
        nand.inject(20, SimFault::StuckBit);

        let mut ftl = ftl(nand);
        ftl.format()?;
        ftl.nand_mut().inject(21, SimFault::Erase);
        assert_eq!(ftl.scan_all()?, [20, 21]);
        assert_eq!(ftl.valid_blocks(), 0);

        let health = ftl.block_health()?;
        assert_eq!(health.bad, 3);
        assert_eq!(health.free, TEST_GEOMETRY.blocks - 3);
        Ok(())
    }
}
