//! Abstractions and code to access raw NAND flash

use std::str::FromStr;

use retry::{delay::NoDelay, retry};
use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;
pub mod sim;

pub use sim::{SimFault, SimNand, SimStats};

/// The value of every byte of an erased page
pub const ERASED: u8 = 0xFF;

/// How many times the ready status is polled before giving up on an operation
pub const DEFAULT_POLL_BUDGET: u32 = 0x10000;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// Does every byte equal `value`?
    fn is_filled_with(&self, value: u8) -> bool;

    /// Would programming `new` over this content require some bit to go from 0 back to 1?
    ///
    /// NAND programming can only clear bits, so such a write needs the block to be erased
    /// first.
    fn needs_erase(&self, new: &[u8]) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.is_filled_with(ERASED)
    }

    fn is_filled_with(&self, value: u8) -> bool {
        self.iter().all(|&x| x == value)
    }

    fn needs_erase(&self, new: &[u8]) -> bool {
        self.iter().zip(new).any(|(&old, &new)| !old & new != 0)
    }
}

/// A pub-fields struct describing the geometry of a raw NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_per_page: usize,
    pub addr_cycles: u8,
}

impl Geometry {
    /// The usual large-page 128 MiB part: 1024 blocks of 64 pages, 2048 + 64 bytes per page
    pub const HY27UF081G2A: Geometry = Geometry {
        blocks: 1024,
        pages_per_block: 64,
        bytes_per_page: 2048,
        spare_per_page: 64,
        addr_cycles: 4,
    };

    /// Bytes in the data area of one block
    pub fn block_bytes(&self) -> u64 {
        u64::from(self.pages_per_block) * self.bytes_per_page as u64
    }

    /// Bytes of one page including its spare area
    pub fn page_total(&self) -> usize {
        self.bytes_per_page + self.spare_per_page
    }

    /// Total number of pages on the device
    pub fn pages(&self) -> u32 {
        self.blocks * self.pages_per_block
    }

    /// Physical page number of page `page` inside block `block`
    pub fn page_of(&self, block: u32, page: u32) -> u32 {
        block * self.pages_per_block + page
    }

    /// The block that holds a physical page
    pub fn block_of(&self, page: u32) -> u32 {
        page / self.pages_per_block
    }

    /// The plane a block belongs to; copy-back only works inside one plane
    pub fn plane_of(&self, block: u32) -> u32 {
        block & 1
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTES+SPARE"
impl FromStr for Geometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (dims, spare) = match s.split_once('+') {
            Some((dims, spare)) => (dims, Some(spare)),
            None => (s, None),
        };

        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = dims
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#[+#]"))?;
        let blocks: u32 = blocks.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let spare_per_page = match spare {
            Some(spare) => spare.parse()?,
            None => bytes_per_page / 32,
        };

        anyhow::ensure!(blocks > 0 && pages_per_block > 0, "geometry must be nonzero");
        anyhow::ensure!(bytes_per_page > 0, "page size must be nonzero");

        // Row address bytes needed to address every page, plus two column bytes
        let pages = u64::from(blocks) * u64::from(pages_per_block);
        let row_bytes = (64 - pages.saturating_sub(1).leading_zeros()).div_ceil(8).max(1);

        Ok(Geometry {
            blocks,
            pages_per_block,
            bytes_per_page,
            spare_per_page,
            addr_cycles: 2 + row_bytes as u8,
        })
    }
}

/// What the device reports when its status is polled
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Ready,
    Busy,

    /// The last program or erase did not complete
    Failed,
}

/// Failures reported by a raw NAND device
#[derive(Error, Debug)]
pub enum NandError {
    #[error("device did not become ready after {0} polls")]
    Timeout(u32),
    #[error("program of page {page} failed")]
    ProgramFailed { page: u32 },
    #[error("erase of block {block} failed")]
    EraseFailed { block: u32 },
    #[error("copy of page {src} to page {dst} failed")]
    CopyFailed { src: u32, dst: u32 },
    #[error("pages {src} and {dst} are in different planes")]
    PlaneMismatch { src: u32, dst: u32 },
    #[error("access to page {page} at {offset}+{len} is out of bounds")]
    OutOfBounds { page: u32, offset: usize, len: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Os(#[from] nix::errno::Errno),
}

/// Represents a raw NAND flash device, addressed by physical page number.
///
/// Offsets are byte offsets within a page; offsets at or past `bytes_per_page` address the
/// spare area. Every operation waits for the device to become ready before returning.
pub trait RawNand {
    /// Get the geometry of the NAND
    fn geometry(&self) -> Geometry;

    /// Return the device to its read state
    fn reset(&mut self) -> Result<(), NandError>;

    /// Read the manufacturer/device identifier
    fn read_id(&mut self) -> Result<u32, NandError>;

    /// Sample the device status once
    fn status(&mut self) -> Status;

    /// Budget for [RawNand::poll_ready]
    fn poll_budget(&self) -> u32 {
        DEFAULT_POLL_BUDGET
    }

    /// Busy-wait until the device leaves the busy state, bounded by the poll budget.
    ///
    /// Returns `Ok(true)` if the device is ready, `Ok(false)` if it reports that the last
    /// operation failed.
    fn poll_ready(&mut self) -> Result<bool, NandError> {
        let budget = self.poll_budget();
        retry(NoDelay.take(budget as usize), || match self.status() {
            Status::Ready => Ok(true),
            Status::Failed => Ok(false),
            Status::Busy => Err(()),
        })
        .map_err(|_| NandError::Timeout(budget))
    }

    /// Read `buf.len()` bytes of a page, starting at `offset`
    fn read_page(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), NandError>;

    /// Program `data` into a page, starting at `offset`
    fn write_page(&mut self, page: u32, offset: usize, data: &[u8]) -> Result<(), NandError>;

    /// Read from the spare area of a page
    fn read_spare(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), NandError> {
        let base = self.geometry().bytes_per_page;
        self.read_page(page, base + offset, buf)
    }

    /// Program into the spare area of a page
    fn write_spare(&mut self, page: u32, offset: usize, data: &[u8]) -> Result<(), NandError> {
        let base = self.geometry().bytes_per_page;
        self.write_page(page, base + offset, data)
    }

    /// Erase a block, returning every byte of it to [ERASED]
    fn erase_block(&mut self, block: u32) -> Result<(), NandError>;

    /// Duplicate a whole page (data and spare) inside the device
    fn copy_page(&mut self, src: u32, dst: u32) -> Result<(), NandError>;

    /// Duplicate a page inside the device, replacing `patch.len()` bytes at `offset`
    fn copy_page_with_patch(
        &mut self,
        src: u32,
        dst: u32,
        offset: usize,
        patch: &[u8],
    ) -> Result<(), NandError>;
}

impl<N: RawNand + ?Sized> RawNand for &mut N {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }
    fn reset(&mut self) -> Result<(), NandError> {
        (**self).reset()
    }
    fn read_id(&mut self) -> Result<u32, NandError> {
        (**self).read_id()
    }
    fn status(&mut self) -> Status {
        (**self).status()
    }
    fn poll_budget(&self) -> u32 {
        (**self).poll_budget()
    }
    fn read_page(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), NandError> {
        (**self).read_page(page, offset, buf)
    }
    fn write_page(&mut self, page: u32, offset: usize, data: &[u8]) -> Result<(), NandError> {
        (**self).write_page(page, offset, data)
    }
    fn erase_block(&mut self, block: u32) -> Result<(), NandError> {
        (**self).erase_block(block)
    }
    fn copy_page(&mut self, src: u32, dst: u32) -> Result<(), NandError> {
        (**self).copy_page(src, dst)
    }
    fn copy_page_with_patch(
        &mut self,
        src: u32,
        dst: u32,
        offset: usize,
        patch: &[u8],
    ) -> Result<(), NandError> {
        (**self).copy_page_with_patch(src, dst, offset, patch)
    }
}

#[test]
fn test_geometry_parse() -> anyhow::Result<()> {
    let geometry: Geometry = "1024x64x2048+64".parse()?;
    assert_eq!(geometry, Geometry::HY27UF081G2A);

    let geometry: Geometry = "4096x64x2048".parse()?;
    assert_eq!(geometry.spare_per_page, 64);
    assert_eq!(geometry.addr_cycles, 5);

    assert!("64x2048".parse::<Geometry>().is_err());
    assert!("0x64x2048".parse::<Geometry>().is_err());
    Ok(())
}

#[test]
fn test_needs_erase() {
    let old = [0xFFu8, 0xF0, 0x00];
    assert!(!old.needs_erase(&[0x00, 0x00, 0x00]));
    assert!(!old.needs_erase(&[0xA5, 0x30, 0x00]));
    assert!(old.needs_erase(&[0x00, 0x08, 0x00]));
    assert!(old.needs_erase(&[0x00, 0x00, 0x01]));
    assert!(old[..1].is_erased());
    assert!(!old.is_erased());
}
