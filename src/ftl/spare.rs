//! The metadata record kept at the start of the spare area of each block's first page.
//!
//! ```text
//! +------+------+------+------+-- ... --+
//! |  BI  | USED | LBN0 | LBN1 |  (ECC)  |
//! +------+------+------+------+-- ... --+
//! ```
//!
//! - `BI`: bad block indicator. 0xFF is a good block, anything else is bad. The manufacturer
//!   may also mark a block bad in the second page when the first one cannot be programmed.
//! - `USED`: 0xFF while the block holds no written data, 0xF0 once it does.
//! - `LBN0 LBN1`: little-endian logical block number, 0xFFFF when none is assigned.
//!
//! Every field is erased to all-1s, so a record with only one field set can be programmed over
//! an existing one without disturbing the others.

use crate::nand::{RawNand, ERASED};

// The deku derives need the bare `Result` to stay std's
use super::error;

use deku::prelude::*;

/// Bytes of the spare area taken by the record
pub const META_LEN: usize = 4;

pub const BAD_FLAG: u8 = 0x00;
pub const USED_FLAG: u8 = 0xF0;
pub const NO_LBN: u16 = 0xFFFF;

#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SpareMeta {
    pub bad: u8,
    pub used: u8,
    pub lbn: u16,
}

impl SpareMeta {
    /// The record of a freshly-erased page
    pub const ERASED: SpareMeta = SpareMeta {
        bad: ERASED,
        used: ERASED,
        lbn: NO_LBN,
    };

    /// Record that only sets the bad block indicator
    pub fn bad() -> Self {
        Self {
            bad: BAD_FLAG,
            ..Self::ERASED
        }
    }

    /// Record that only sets the used flag
    pub fn used() -> Self {
        Self {
            used: USED_FLAG,
            ..Self::ERASED
        }
    }

    /// Record that only assigns a logical block number
    pub fn with_lbn(lbn: u16) -> Self {
        Self {
            lbn,
            ..Self::ERASED
        }
    }

    pub fn is_bad(&self) -> bool {
        self.bad != ERASED
    }

    pub fn is_used(&self) -> bool {
        self.used != ERASED
    }

    /// The logical block number, if the block is good and has one
    pub fn lbn(&self) -> Option<u32> {
        (!self.is_bad() && self.lbn != NO_LBN).then_some(u32::from(self.lbn))
    }

    pub fn decode(bytes: &[u8]) -> error::Result<Self> {
        let (_, meta) = Self::from_bytes((bytes, 0))?;
        Ok(meta)
    }

    pub fn encode(&self) -> error::Result<Vec<u8>> {
        Ok(self.to_bytes()?)
    }

    /// Read the record from the spare area of a physical page
    pub fn read<N: RawNand + ?Sized>(nand: &mut N, page: u32) -> error::Result<Self> {
        let mut buf = [0; META_LEN];
        nand.read_spare(page, 0, &mut buf)?;
        Self::decode(&buf)
    }

    /// Program the record into the spare area of a physical page
    pub fn write<N: RawNand + ?Sized>(&self, nand: &mut N, page: u32) -> error::Result<()> {
        let bytes = self.encode()?;
        nand.write_spare(page, 0, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout() -> anyhow::Result<()> {
        let meta = SpareMeta {
            bad: ERASED,
            used: USED_FLAG,
            lbn: 0x0102,
        };
        assert_eq!(meta.encode()?, [0xFF, 0xF0, 0x02, 0x01]);
        assert_eq!(SpareMeta::decode(&[0xFF, 0xF0, 0x02, 0x01])?, meta);
        assert_eq!(meta.lbn(), Some(0x0102));
        assert!(meta.is_used());
        Ok(())
    }

    #[test]
    fn test_erased_and_bad() -> anyhow::Result<()> {
        let erased = SpareMeta::decode(&[0xFF; META_LEN])?;
        assert_eq!(erased, SpareMeta::ERASED);
        assert!(!erased.is_bad());
        assert!(!erased.is_used());
        assert_eq!(erased.lbn(), None);

        // A bad block's LBN bytes are meaningless
        let bad = SpareMeta::decode(&[0x00, 0xFF, 0x05, 0x00])?;
        assert!(bad.is_bad());
        assert_eq!(bad.lbn(), None);
        Ok(())
    }
}
