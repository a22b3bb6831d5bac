//! Strategies for checking that a program operation stuck.
//!
//! There's no error correction on this layer; a program is trusted once the bytes read back
//! from the device match what was written.

use crate::nand::{NandError, RawNand};

use crc::{Crc, CRC_32_ISO_HDLC};

pub const VERIFY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checks a just-programmed range of a page against the data that was written to it
pub trait Verify {
    fn verify<N: RawNand + ?Sized>(
        &self,
        nand: &mut N,
        page: u32,
        offset: usize,
        expected: &[u8],
    ) -> Result<bool, NandError>;
}

/// Read the range back and compare it byte for byte
#[derive(Debug, Default, Copy, Clone)]
pub struct ReadBack;

impl Verify for ReadBack {
    fn verify<N: RawNand + ?Sized>(
        &self,
        nand: &mut N,
        page: u32,
        offset: usize,
        expected: &[u8],
    ) -> Result<bool, NandError> {
        let mut actual = vec![0; expected.len()];
        nand.read_page(page, offset, &mut actual)?;
        Ok(actual == expected)
    }
}

/// Read the range back in small pieces and compare checksums, so no page-sized buffer is
/// needed
#[derive(Debug, Default, Copy, Clone)]
pub struct Crc32;

impl Crc32 {
    /// How many bytes are read from the device at once
    const CHUNK: usize = 64;
}

impl Verify for Crc32 {
    fn verify<N: RawNand + ?Sized>(
        &self,
        nand: &mut N,
        page: u32,
        offset: usize,
        expected: &[u8],
    ) -> Result<bool, NandError> {
        let mut digest = VERIFY_CRC.digest();
        let mut buf = [0; Self::CHUNK];
        for (i, chunk) in expected.chunks(Self::CHUNK).enumerate() {
            let buf = &mut buf[..chunk.len()];
            nand.read_page(page, offset + i * Self::CHUNK, buf)?;
            digest.update(buf);
        }
        Ok(digest.finalize() == VERIFY_CRC.checksum(expected))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::sim::TEST_GEOMETRY;
    use crate::nand::{SimFault, SimNand};

    fn check<V: Verify>(verifier: V) -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_GEOMETRY);
        let data: Vec<u8> = (0..200u8).collect();

        nand.write_page(3, 10, &data)?;
        assert!(verifier.verify(&mut nand, 3, 10, &data)?);
        assert!(!verifier.verify(&mut nand, 3, 11, &data)?);

        // The stuck bit is the first programmed byte
        nand.inject(1, SimFault::StuckBit);
        let page = TEST_GEOMETRY.page_of(1, 2);
        nand.write_page(page, 0, &data)?;
        assert!(!verifier.verify(&mut nand, page, 0, &data)?);
        assert!(verifier.verify(&mut nand, page, 1, &data[1..])?);
        Ok(())
    }

    #[test]
    fn test_read_back() -> anyhow::Result<()> {
        check(ReadBack)
    }

    #[test]
    fn test_crc32() -> anyhow::Result<()> {
        check(Crc32)
    }
}
