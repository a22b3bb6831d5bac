//! Logical addressing: splitting byte and sector ranges into per-page pieces, and the read/write
//! paths built on top of that.

use super::alloc;
use super::error::{FtlError, Result};
use super::spare::SpareMeta;
use super::verify::Verify;
use super::Ftl;
use crate::nand::{Geometry, PageUtil, RawNand};

use log::debug;

/// Where a logical byte address lands, relative to its logical block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Location {
    pub lbn: u32,
    pub page: u32,
    pub offset: usize,
}

impl Location {
    pub fn of(geometry: &Geometry, address: u64) -> Self {
        let block_bytes = geometry.block_bytes();
        let page_size = geometry.bytes_per_page as u64;
        Self {
            lbn: (address / block_bytes) as u32,
            page: ((address % block_bytes) / page_size) as u32,
            offset: (address % page_size) as usize,
        }
    }

    pub fn address(&self, geometry: &Geometry) -> u64 {
        u64::from(self.lbn) * geometry.block_bytes()
            + u64::from(self.page) * geometry.bytes_per_page as u64
            + self.offset as u64
    }
}

/// A [Location] resolved all the way down to the physical page holding it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Placement {
    pub location: Location,
    pub pbn: u32,

    /// Physical page number on the device
    pub page: u32,
}

/// A part of a byte range that doesn't cross a page boundary
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Piece {
    pub location: Location,

    /// Position of this piece inside the whole range
    pub start: usize,
    pub len: usize,
}

/// Cut `len` bytes at `address` into pieces that each fit in one page
pub fn split(geometry: Geometry, address: u64, len: usize) -> impl Iterator<Item = Piece> {
    let mut start = 0;
    std::iter::from_fn(move || {
        if start >= len {
            return None;
        }

        let location = Location::of(&geometry, address + start as u64);
        let piece_len = (geometry.bytes_per_page - location.offset).min(len - start);
        let piece = Piece {
            location,
            start,
            len: piece_len,
        };
        start += piece_len;
        Some(piece)
    })
}

impl<N: RawNand, V: Verify> Ftl<N, V> {
    /// Read `len` bytes from a logical address
    pub fn read(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from a logical address
    pub fn read_into(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(address, buf.len())?;

        let geometry = self.geometry();
        for piece in split(geometry, address, buf.len()) {
            let pbn = self.table.lookup(piece.location.lbn)?;
            let page = geometry.page_of(pbn, piece.location.page);
            self.nand.read_page(
                page,
                piece.location.offset,
                &mut buf[piece.start..piece.start + piece.len],
            )?;
        }
        Ok(())
    }

    /// Write `data` to a logical address.
    ///
    /// Data that can be programmed over the current content goes in place; anything else moves
    /// the logical block to a fresh physical block.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.check_range(address, data.len())?;

        for piece in split(self.geometry(), address, data.len()) {
            self.write_in_page(piece.location, &data[piece.start..piece.start + piece.len])?;
        }
        Ok(())
    }

    /// Read whole sectors, starting at sector number `first`
    pub fn read_sectors(&mut self, first: u64, buf: &mut [u8]) -> Result<()> {
        let sector_size = self.sector_size_for(buf.len())?;
        let address = self.sector_address(first, sector_size, buf.len())?;
        self.check_range(address, buf.len())?;

        for (i, sector) in buf.chunks_mut(sector_size).enumerate() {
            self.read_into(address + (i * sector_size) as u64, sector)?;
        }
        Ok(())
    }

    /// Write whole sectors, starting at sector number `first`
    pub fn write_sectors(&mut self, first: u64, data: &[u8]) -> Result<()> {
        let sector_size = self.sector_size_for(data.len())?;
        let address = self.sector_address(first, sector_size, data.len())?;
        self.check_range(address, data.len())?;

        for (i, sector) in data.chunks(sector_size).enumerate() {
            self.write(address + (i * sector_size) as u64, sector)?;
        }
        Ok(())
    }

    /// Where a logical address currently lives on the device
    pub fn locate(&self, address: u64) -> Result<Placement> {
        self.check_range(address, 1)?;

        let geometry = self.geometry();
        let location = Location::of(&geometry, address);
        let pbn = self.table.lookup(location.lbn)?;
        Ok(Placement {
            location,
            pbn,
            page: geometry.page_of(pbn, location.page),
        })
    }

    /// Fail unless the whole range lies inside the formatted capacity
    fn check_range(&self, address: u64, len: usize) -> Result<()> {
        let valid = self.table.valid_blocks();
        if valid == 0 {
            return Err(FtlError::NotFormatted {
                mapped: 0,
                required: self.config.min_blocks,
            });
        }

        let capacity = self.capacity();
        match address.checked_add(len as u64) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(FtlError::AddressOutOfRange {
                address,
                len,
                capacity,
            }),
        }
    }

    /// Byte address of sector `first`
    fn sector_address(&self, first: u64, sector_size: usize, len: usize) -> Result<u64> {
        first
            .checked_mul(sector_size as u64)
            .ok_or(FtlError::AddressOutOfRange {
                address: first,
                len,
                capacity: self.capacity(),
            })
    }

    fn sector_size_for(&self, len: usize) -> Result<usize> {
        let sector_size = self.config.sector_size;
        if sector_size == 0 || len % sector_size != 0 {
            return Err(FtlError::BadSectorSize(sector_size));
        }
        Ok(sector_size)
    }

    /// Write data that doesn't cross a page boundary
    fn write_in_page(&mut self, location: Location, data: &[u8]) -> Result<()> {
        let geometry = self.geometry();
        let pbn = self.table.lookup(location.lbn)?;
        let page = geometry.page_of(pbn, location.page);

        let mut current = vec![0; data.len()];
        self.nand.read_page(page, location.offset, &mut current)?;

        if !current.needs_erase(data) {
            match self.program_verified(pbn, page, location.offset, data) {
                Ok(()) => return Ok(()),
                Err(FtlError::ProgramVerifyFailed { page }) => {
                    debug!("in-place program of page {page} failed, relocating");
                }
                Err(e) => return Err(e),
            }
        }

        self.relocate(pbn, location.page, location.offset, data)?;
        Ok(())
    }

    /// Program in place, check the result, and flag the block as used
    fn program_verified(&mut self, pbn: u32, page: u32, offset: usize, data: &[u8]) -> Result<()> {
        self.nand.write_page(page, offset, data)?;
        if !self.verifier.verify(&mut self.nand, page, offset, data)? {
            return Err(FtlError::ProgramVerifyFailed { page });
        }

        let first = self.geometry().page_of(pbn, 0);
        if !SpareMeta::read(&mut self.nand, first)?.is_used() {
            alloc::mark_used(&mut self.nand, pbn)?;
        }
        Ok(())
    }
}
