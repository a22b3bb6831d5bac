//! A simulated in-memory raw NAND flash, for testing purposes

use super::{Geometry, NandError, PageUtil, RawNand, Status, DEFAULT_POLL_BUDGET, ERASED};

use std::collections::HashSet;
use std::io::{Read, Write};

/// ID reported by the simulated chip (a Hynix HY27UF081G2A)
pub const SIM_ID: u32 = 0xADF1_801D;

/// A failure to inject into one block of a [SimNand]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SimFault {
    /// Erasing the block reports failure and leaves its content alone
    Erase,

    /// Programming any page of the block reports failure
    Program,

    /// Copy-back with this block as destination reports failure
    CopyInto,

    /// Programming the spare area of the block's first page reports failure
    FirstSpare,

    /// One bit of every page refuses to be programmed, but the device reports success
    StuckBit,
}

/// Counts of device operations, for checking what an upper layer did
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SimStats {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
    pub copies: u64,
}

impl SimStats {
    /// Total operations of any kind
    pub fn total(&self) -> u64 {
        self.reads + self.programs + self.erases + self.copies
    }
}

/// A simulated raw NAND with NAND programming rules: programming can only clear bits, erase
/// sets a whole block back to 0xFF, and copy-back only works within a plane.
#[derive(Debug, Clone)]
pub struct SimNand {
    geometry: Geometry,

    /// Data and spare bytes of every page; `None` is an erased page
    pages: Box<[Option<Box<[u8]>>]>,

    /// How many times each block has been erased
    erase_counts: Box<[u32]>,

    faults: HashSet<(u32, SimFault)>,
    stats: SimStats,

    /// Outcome of the last operation, reported once the device stops being busy
    last: Status,

    /// Polls remaining before the current operation finishes
    busy_polls: u32,

    /// Polls every operation takes to finish
    latency: u32,

    poll_budget: u32,
    stuck_busy: bool,
    id: u32,
}

impl SimNand {
    /// Create a fully-erased SimNand with the specified geometry
    pub fn new(geometry: Geometry) -> Self {
        let pages = vec![None; geometry.pages() as usize].into_boxed_slice();
        let erase_counts = vec![0; geometry.blocks as usize].into_boxed_slice();

        Self {
            geometry,
            pages,
            erase_counts,
            faults: HashSet::new(),
            stats: SimStats::default(),
            last: Status::Ready,
            busy_polls: 0,
            latency: 0,
            poll_budget: DEFAULT_POLL_BUDGET,
            stuck_busy: false,
            id: SIM_ID,
        }
    }

    /// Mark a block bad the way the manufacturer does: a non-0xFF first spare byte
    pub fn factory_bad(&mut self, block: u32) {
        let page = self.geometry.page_of(block, 0);
        let spare = self.geometry.bytes_per_page;
        self.page_mut(page)[spare] = 0x00;
    }

    /// Inject a fault into a block
    pub fn inject(&mut self, block: u32, fault: SimFault) {
        self.faults.insert((block, fault));
    }

    /// Remove a previously-injected fault
    pub fn heal(&mut self, block: u32, fault: SimFault) {
        self.faults.remove(&(block, fault));
    }

    /// Make every operation keep the device busy for `polls` status polls
    pub fn set_latency(&mut self, polls: u32) {
        self.latency = polls;
    }

    /// Limit how many polls an operation may take before it times out
    pub fn set_poll_budget(&mut self, budget: u32) {
        self.poll_budget = budget;
    }

    /// Make the ready signal stay deasserted forever
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Operation counts since creation or the last [SimNand::reset_stats]
    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SimStats::default();
    }

    /// How many times a block has been erased
    pub fn erase_count(&self, block: u32) -> u32 {
        self.erase_counts[block as usize]
    }

    /// Initialize the NAND contents (data and spare of every page) from a type implementing
    /// `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.geometry.page_total()];

        for page in self.pages.iter_mut() {
            read.read_exact(&mut buf)?;
            *page = match buf.is_erased() {
                true => None,
                false => Some(buf.clone().into_boxed_slice()),
            };
        }

        Ok(())
    }

    /// Write the contents of every page (data and spare) out to a writable stream (such as a
    /// File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let erased = vec![ERASED; self.geometry.page_total()];

        for page in self.pages.iter() {
            write.write_all(page.as_deref().unwrap_or(&erased))?;
        }

        Ok(())
    }

    fn page_mut(&mut self, page: u32) -> &mut [u8] {
        let total = self.geometry.page_total();
        self.pages[page as usize].get_or_insert_with(|| vec![ERASED; total].into_boxed_slice())
    }

    fn has_fault(&self, page: u32, fault: SimFault) -> bool {
        let block = self.geometry.block_of(page);
        self.faults.contains(&(block, fault))
    }

    fn check_page(&self, page: u32, offset: usize, len: usize) -> Result<(), NandError> {
        if page >= self.geometry.pages() || offset + len > self.geometry.page_total() {
            return Err(NandError::OutOfBounds { page, offset, len });
        }
        Ok(())
    }

    fn check_plane(&self, src: u32, dst: u32) -> Result<(), NandError> {
        let plane = |page| self.geometry.plane_of(self.geometry.block_of(page));
        if plane(src) != plane(dst) {
            return Err(NandError::PlaneMismatch { src, dst });
        }
        Ok(())
    }

    /// Start an operation that will finish with `outcome`
    fn begin(&mut self, outcome: Status) {
        self.last = outcome;
        self.busy_polls = self.latency;
    }

    /// Program bytes into a page, clearing bits only
    fn program(&mut self, page: u32, offset: usize, data: &[u8]) {
        let stuck = self.has_fault(page, SimFault::StuckBit);
        let cells = &mut self.page_mut(page)[offset..offset + data.len()];
        for (cell, &byte) in cells.iter_mut().zip(data) {
            *cell &= byte;
        }
        if stuck {
            if let Some(first) = cells.first_mut() {
                *first |= 0x01;
            }
        }
    }

    /// Snapshot a whole page
    fn page_content(&self, page: u32) -> Vec<u8> {
        match &self.pages[page as usize] {
            Some(content) => content.to_vec(),
            None => vec![ERASED; self.geometry.page_total()],
        }
    }
}

impl RawNand for SimNand {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn reset(&mut self) -> Result<(), NandError> {
        self.begin(Status::Ready);
        self.poll_ready()?;
        Ok(())
    }

    fn read_id(&mut self) -> Result<u32, NandError> {
        Ok(self.id)
    }

    fn status(&mut self) -> Status {
        if self.stuck_busy {
            return Status::Busy;
        }
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return Status::Busy;
        }
        self.last
    }

    fn poll_budget(&self) -> u32 {
        self.poll_budget
    }

    fn read_page(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), NandError> {
        self.check_page(page, offset, buf.len())?;
        self.stats.reads += 1;
        self.begin(Status::Ready);
        self.poll_ready()?;

        match &self.pages[page as usize] {
            Some(content) => buf.copy_from_slice(&content[offset..offset + buf.len()]),
            None => buf.fill(ERASED),
        }
        Ok(())
    }

    fn write_page(&mut self, page: u32, offset: usize, data: &[u8]) -> Result<(), NandError> {
        self.check_page(page, offset, data.len())?;
        self.stats.programs += 1;

        let first_spare = page % self.geometry.pages_per_block == 0
            && offset + data.len() > self.geometry.bytes_per_page;
        if self.has_fault(page, SimFault::Program)
            || (first_spare && self.has_fault(page, SimFault::FirstSpare))
        {
            self.begin(Status::Failed);
        } else {
            self.program(page, offset, data);
            self.begin(Status::Ready);
        }

        match self.poll_ready()? {
            true => Ok(()),
            false => Err(NandError::ProgramFailed { page }),
        }
    }

    fn erase_block(&mut self, block: u32) -> Result<(), NandError> {
        if block >= self.geometry.blocks {
            return Err(NandError::OutOfBounds {
                page: self.geometry.pages(),
                offset: 0,
                len: 0,
            });
        }
        self.stats.erases += 1;

        if self.faults.contains(&(block, SimFault::Erase)) {
            self.begin(Status::Failed);
        } else {
            let first = self.geometry.page_of(block, 0) as usize;
            let pages = self.geometry.pages_per_block as usize;
            self.pages[first..first + pages].fill(None);
            self.erase_counts[block as usize] += 1;
            self.begin(Status::Ready);
        }

        match self.poll_ready()? {
            true => Ok(()),
            false => Err(NandError::EraseFailed { block }),
        }
    }

    fn copy_page(&mut self, src: u32, dst: u32) -> Result<(), NandError> {
        self.copy_page_with_patch(src, dst, 0, &[])
    }

    fn copy_page_with_patch(
        &mut self,
        src: u32,
        dst: u32,
        offset: usize,
        patch: &[u8],
    ) -> Result<(), NandError> {
        self.check_page(src, offset, patch.len())?;
        self.check_page(dst, offset, patch.len())?;
        self.check_plane(src, dst)?;
        self.stats.copies += 1;

        if self.has_fault(dst, SimFault::CopyInto) || self.has_fault(dst, SimFault::Program) {
            self.begin(Status::Failed);
        } else {
            let mut content = self.page_content(src);
            content[offset..offset + patch.len()].copy_from_slice(patch);
            self.program(dst, 0, &content);
            self.begin(Status::Ready);
        }

        match self.poll_ready()? {
            true => Ok(()),
            false => Err(NandError::CopyFailed { src, dst }),
        }
    }
}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: Geometry = Geometry {
    blocks: 128,
    pages_per_block: 8,
    bytes_per_page: 256,
    spare_per_page: 16,
    addr_cycles: 4,
};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sim_erased() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let mut buf = vec![0; TEST_GEOMETRY.page_total()];
        nand.read_page(0, 0, &mut buf)?;
        assert!(buf.is_erased());

        let last = TEST_GEOMETRY.pages() - 1;
        nand.read_page(last, 0, &mut buf)?;
        assert!(buf.is_erased());
        assert!(nand.read_page(last + 1, 0, &mut buf).is_err());
        assert!(nand.read_page(0, 1, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn test_sim_program_clears_bits_only() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.write_page(3, 10, &[0xF0, 0x0F])?;
        nand.write_page(3, 10, &[0x3C, 0xFF])?;

        let mut buf = [0; 4];
        nand.read_page(3, 9, &mut buf)?;
        assert_eq!(buf, [0xFF, 0x30, 0x0F, 0xFF]);

        nand.erase_block(0)?;
        nand.read_page(3, 9, &mut buf)?;
        assert!(buf.is_erased());
        assert_eq!(nand.erase_count(0), 1);
        Ok(())
    }

    #[test]
    fn test_sim_spare() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.write_spare(8, 2, &[0x12, 0x34])?;

        let mut buf = [0; 2];
        nand.read_page(8, TEST_GEOMETRY.bytes_per_page + 2, &mut buf)?;
        assert_eq!(buf, [0x12, 0x34]);
        nand.read_spare(8, 2, &mut buf)?;
        assert_eq!(buf, [0x12, 0x34]);
        Ok(())
    }

    #[test]
    fn test_sim_copy_back() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let ppb = TEST_GEOMETRY.pages_per_block;
        nand.write_page(1, 0, &[1, 2, 3, 4])?;
        nand.write_spare(1, 0, &[0x55])?;

        // Block 0 -> block 2 is the same plane
        nand.copy_page(1, 2 * ppb + 1)?;
        nand.copy_page_with_patch(1, 2 * ppb + 2, 2, &[9, 9])?;

        let mut buf = [0; 4];
        nand.read_page(2 * ppb + 1, 0, &mut buf)?;
        assert_eq!(buf, [1, 2, 3, 4]);
        nand.read_page(2 * ppb + 2, 0, &mut buf)?;
        assert_eq!(buf, [1, 2, 9, 9]);
        nand.read_spare(2 * ppb + 1, 0, &mut buf[..1])?;
        assert_eq!(buf[0], 0x55);

        // Block 0 -> block 1 crosses planes
        assert!(matches!(
            nand.copy_page(1, ppb + 1),
            Err(NandError::PlaneMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_sim_faults() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let ppb = TEST_GEOMETRY.pages_per_block;

        nand.inject(1, SimFault::Erase);
        assert!(matches!(
            nand.erase_block(1),
            Err(NandError::EraseFailed { block: 1 })
        ));

        nand.inject(2, SimFault::Program);
        assert!(matches!(
            nand.write_page(2 * ppb, 0, &[0]),
            Err(NandError::ProgramFailed { .. })
        ));
        nand.heal(2, SimFault::Program);
        nand.write_page(2 * ppb, 0, &[0])?;

        nand.inject(4, SimFault::CopyInto);
        assert!(nand.copy_page(0, 4 * ppb).is_err());

        nand.inject(5, SimFault::FirstSpare);
        nand.write_page(5 * ppb, 0, &[0])?;
        nand.write_page(5 * ppb + 1, TEST_GEOMETRY.bytes_per_page, &[0])?;
        assert!(matches!(
            nand.write_page(5 * ppb, TEST_GEOMETRY.bytes_per_page, &[0]),
            Err(NandError::ProgramFailed { .. })
        ));

        nand.inject(6, SimFault::StuckBit);
        nand.write_page(6 * ppb, 0, &[0x00])?;
        let mut buf = [0; 1];
        nand.read_page(6 * ppb, 0, &mut buf)?;
        assert_eq!(buf, [0x01]);
        Ok(())
    }

    #[test]
    fn test_sim_busy() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.set_poll_budget(16);
        nand.set_latency(8);
        nand.write_page(0, 0, &[0])?;

        nand.set_latency(100);
        assert!(matches!(
            nand.write_page(0, 1, &[0]),
            Err(NandError::Timeout(16))
        ));

        nand.set_latency(0);
        nand.set_stuck_busy(true);
        assert!(matches!(nand.erase_block(0), Err(NandError::Timeout(_))));
        Ok(())
    }

    #[test]
    fn test_sim_save_load() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        nand.factory_bad(5);
        nand.write_page(17, 4, &[0xAB; 8])?;

        let mut image = Vec::new();
        nand.save(&mut image)?;
        assert_eq!(
            image.len(),
            TEST_GEOMETRY.pages() as usize * TEST_GEOMETRY.page_total()
        );

        let mut copy = SimNand::new(TEST_GEOMETRY);
        copy.load(&mut image.as_slice())?;

        let mut buf = [0; 8];
        copy.read_page(17, 4, &mut buf)?;
        assert_eq!(buf, [0xAB; 8]);
        copy.read_spare(5 * TEST_GEOMETRY.pages_per_block, 0, &mut buf[..1])?;
        assert_eq!(buf[0], 0x00);
        Ok(())
    }
}
