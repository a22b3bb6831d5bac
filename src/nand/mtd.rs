//! Raw NAND implementation over the Linux MTD subsystem
//!
//! The kernel driver does the command sequencing and waits for completion itself, so every
//! operation is already finished by the time its syscall returns. Copy-back is emulated on the
//! host, which means it has no plane restriction here.

use super::{Geometry, NandError, RawNand, Status, ERASED};

use anyhow::bail;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    geometry: Geometry,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let geometry = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Byte address of the first data byte of a page
    fn page_base(&self, page: u32) -> u64 {
        u64::from(page) * self.geometry.bytes_per_page as u64
    }

    fn check_page(&self, page: u32, offset: usize, len: usize) -> Result<(), NandError> {
        if page >= self.geometry.pages() || offset + len > self.geometry.page_total() {
            return Err(NandError::OutOfBounds { page, offset, len });
        }
        Ok(())
    }

    fn read_oob(&self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), NandError> {
        let mut oob = ioctl::mtd_oob_buf {
            start: (self.page_base(page) + offset as u64) as u32,
            length: buf.len() as u32,
            ptr: buf.as_mut_ptr(),
        };
        unsafe {
            ioctl::memreadoob(self.file.as_raw_fd(), &mut oob)?;
        }
        Ok(())
    }

    fn write_oob(&self, page: u32, offset: usize, data: &[u8]) -> Result<(), NandError> {
        // The kernel only reads through this pointer for MEMWRITEOOB
        let mut oob = ioctl::mtd_oob_buf {
            start: (self.page_base(page) + offset as u64) as u32,
            length: data.len() as u32,
            ptr: data.as_ptr() as *mut u8,
        };
        unsafe {
            ioctl::memwriteoob(self.file.as_raw_fd(), &mut oob)?;
        }
        Ok(())
    }

    /// Read a full page, data followed by spare
    fn read_full(&self, page: u32) -> Result<Vec<u8>, NandError> {
        let mut buf = vec![0; self.geometry.page_total()];
        let (data, spare) = buf.split_at_mut(self.geometry.bytes_per_page);
        self.file.read_exact_at(data, self.page_base(page))?;
        self.read_oob(page, 0, spare)?;
        Ok(buf)
    }
}

impl RawNand for MtdNand {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn reset(&mut self) -> Result<(), NandError> {
        Ok(())
    }

    /// MTD does not expose the chip's ID bytes; this reports the MTD device type instead
    fn read_id(&mut self) -> Result<u32, NandError> {
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(self.file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };
        Ok(u32::from(info.r#type))
    }

    fn status(&mut self) -> Status {
        Status::Ready
    }

    fn read_page(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<(), NandError> {
        self.check_page(page, offset, buf.len())?;

        let data_len = self.geometry.bytes_per_page.saturating_sub(offset).min(buf.len());
        let (data, spare) = buf.split_at_mut(data_len);
        if !data.is_empty() {
            self.file
                .read_exact_at(data, self.page_base(page) + offset as u64)?;
        }
        if !spare.is_empty() {
            let spare_offset = (offset + data_len) - self.geometry.bytes_per_page;
            self.read_oob(page, spare_offset, spare)?;
        }
        Ok(())
    }

    fn write_page(&mut self, page: u32, offset: usize, data: &[u8]) -> Result<(), NandError> {
        self.check_page(page, offset, data.len())?;

        let page_size = self.geometry.bytes_per_page;
        let data_len = page_size.saturating_sub(offset).min(data.len());
        let (main, spare) = data.split_at(data_len);

        if !main.is_empty() {
            // NAND writes must be page-aligned; programming 0xFF leaves the other bytes alone
            let mut buf = vec![ERASED; page_size];
            buf[offset..offset + main.len()].copy_from_slice(main);
            self.file.write_all_at(&buf, self.page_base(page))?;
        }
        if !spare.is_empty() {
            self.write_oob(page, (offset + data_len) - page_size, spare)?;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<(), NandError> {
        let size = self.geometry.block_bytes() as u32;
        let erase_info = ioctl::erase_info_user {
            start: size * block,
            length: size,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)
                .map_err(|_| NandError::EraseFailed { block })?;
        }
        Ok(())
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

        let mut content = self.read_full(src)?;
        content[offset..offset + patch.len()].copy_from_slice(patch);
        self.write_page(dst, 0, &content)
            .map_err(|_| NandError::CopyFailed { src, dst })
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::Geometry;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<Geometry> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<Geometry> {
            ensure!(self.writesize > 1, "MTD device is not page-addressed NAND");
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let pages = u64::from(blocks) * u64::from(pages_per_block);

            Ok(Geometry {
                blocks,
                pages_per_block,
                bytes_per_page: self.writesize as usize,
                spare_per_page: self.oobsize as usize,
                addr_cycles: if pages > 0x1_0000 { 5 } else { 4 },
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memwriteoob, MTD_IOC_MAGIC, 3, mtd_oob_buf);
    ioctl_readwrite!(memreadoob, MTD_IOC_MAGIC, 4, mtd_oob_buf);
}
