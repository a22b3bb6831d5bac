/// Tunables of the translation layer.
///
/// The defaults are the values the firmware driver has always shipped with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FtlConfig {
    /// Percentage of good blocks given logical numbers at format time; the rest is the
    /// reserve pool used for relocation
    pub data_percent: u32,

    /// Fewer logical blocks than this means the device is unformatted (or worn out)
    pub min_blocks: u32,

    /// Replacement blocks tried by one relocation before giving up
    pub relocation_attempts: u32,

    /// Erase/program rounds of the destructive block self-test
    pub scan_cycles: u32,

    /// Bytes per sector of the sector-addressed operations
    pub sector_size: usize,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            data_percent: 98,
            min_blocks: 100,
            relocation_attempts: 10,
            scan_cycles: 50,
            sector_size: 512,
        }
    }
}

impl FtlConfig {
    pub fn data_percent(mut self, percent: u32) -> Self {
        self.data_percent = percent.clamp(1, 100);
        self
    }

    pub fn min_blocks(mut self, blocks: u32) -> Self {
        self.min_blocks = blocks;
        self
    }

    pub fn relocation_attempts(mut self, attempts: u32) -> Self {
        self.relocation_attempts = attempts.max(1);
        self
    }

    pub fn scan_cycles(mut self, cycles: u32) -> Self {
        self.scan_cycles = cycles;
        self
    }

    pub fn sector_size(mut self, size: usize) -> Self {
        self.sector_size = size;
        self
    }

    /// How many of `good` blocks get a logical number
    pub fn data_blocks(&self, good: u32) -> u32 {
        (u64::from(good) * u64::from(self.data_percent) / 100) as u32
    }
}

#[test]
fn test_data_blocks() {
    let config = FtlConfig::default();
    assert_eq!(config.data_blocks(1024), 1003);
    assert_eq!(config.data_blocks(100), 98);
    assert_eq!(config.data_percent(150).data_blocks(1024), 1024);
}
