//! A flash translation layer presenting a raw NAND device as a linear, byte- and
//! sector-addressable store.
//!
//! Logical blocks map one-to-one onto physical blocks. Writes that can be programmed over the
//! current content go in place; anything else copies the block into a free block of the same
//! plane. Blocks that misbehave are retired by marking them bad in their spare area, and the
//! mapping is always rebuilt from the spare areas rather than patched in memory.

pub mod alloc;
mod config;
mod error;
mod format;
mod relocate;
pub mod spare;
mod table;
mod translate;
pub mod verify;

pub use alloc::{BlockHealth, BlockState};
pub use config::FtlConfig;
pub use error::{FtlError, Result};
pub use relocate::Relocations;
pub use table::BlockTable;
pub use translate::{split, Location, Piece, Placement};
pub use verify::{Crc32, ReadBack, Verify};

use crate::nand::{Geometry, RawNand};

use log::info;

/// Identification of the device under the FTL
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    pub id: u32,
    pub geometry: Geometry,
}

#[derive(Debug)]
pub struct Ftl<N: RawNand, V: Verify = ReadBack> {
    nand: N,
    table: BlockTable,
    config: FtlConfig,
    verifier: V,
    relocations: Relocations,
}

impl<N: RawNand> Ftl<N> {
    /// Put an FTL over a raw device, verifying writes by reading them back.
    ///
    /// Nothing is read from the device until [Ftl::init] or [Ftl::format].
    pub fn new(nand: N, config: FtlConfig) -> Self {
        Self::with_verifier(nand, config, ReadBack)
    }
}

impl<N: RawNand, V: Verify> Ftl<N, V> {
    pub fn with_verifier(nand: N, config: FtlConfig, verifier: V) -> Self {
        let table = BlockTable::new(nand.geometry());
        Self {
            nand,
            table,
            config,
            verifier,
            relocations: Relocations::default(),
        }
    }

    /// Reset the device and load the block table from it. Returns the number of logical blocks.
    pub fn init(&mut self) -> Result<u32> {
        self.nand.reset()?;
        let id = self.nand.read_id()?;
        info!("NAND id {id:#010x}, {:?}", self.nand.geometry());

        let valid = self.rebuild()?;
        info!("{valid} logical blocks, {} bytes", self.capacity());
        Ok(valid)
    }

    pub fn geometry(&self) -> Geometry {
        self.nand.geometry()
    }

    pub fn config(&self) -> &FtlConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: FtlConfig) {
        self.config = config;
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    /// Direct access to the device. Writing through this behind the FTL's back calls for
    /// [Ftl::init] afterwards.
    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn into_inner(self) -> N {
        self.nand
    }

    pub fn table(&self) -> &BlockTable {
        &self.table
    }

    pub fn valid_blocks(&self) -> u32 {
        self.table.valid_blocks()
    }

    /// Bytes addressable through the FTL
    pub fn capacity(&self) -> u64 {
        u64::from(self.table.valid_blocks()) * self.geometry().block_bytes()
    }

    pub fn relocations(&self) -> Relocations {
        self.relocations
    }

    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            id: self.nand.read_id()?,
            geometry: self.geometry(),
        })
    }

    /// The state of every physical block, indexed by block number
    pub fn block_map(&mut self) -> Result<Vec<BlockState>> {
        alloc::scan_states(&mut self.nand)
    }

    /// How many blocks are bad, used and free
    pub fn block_health(&mut self) -> Result<BlockHealth> {
        Ok(self.block_map()?.into_iter().collect())
    }

    /// Retire a physical block by hand.
    ///
    /// Retiring a block that holds a logical block loses that logical block, so the rebuilt
    /// table will usually report the gap.
    pub fn mark_bad(&mut self, pbn: u32) -> Result<()> {
        self.check_block(pbn)?;

        let mapped = self.table.lbn_of(pbn).is_some();
        alloc::mark_bad(&mut self.nand, pbn);
        if mapped {
            self.rebuild()?;
        }
        Ok(())
    }

    /// Reload the block table from the device
    pub fn rebuild(&mut self) -> Result<u32> {
        self.table.rebuild(&mut self.nand, self.config.min_blocks)
    }

    fn check_block(&self, pbn: u32) -> Result<()> {
        let blocks = self.geometry().blocks;
        if pbn >= blocks {
            return Err(FtlError::BlockOutOfRange { block: pbn, blocks });
        }
        Ok(())
    }
}
