//! Command-line access to a NAND device through the flash translation layer.
//!
//! Works against a simulated NAND backed by an image file, or (on Linux) a real MTD device.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{warn, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nand_ftl::nand::mtd::MtdNand;
use nand_ftl::{
    ftl::{BlockHealth, Ftl, FtlConfig},
    nand::{Geometry, RawNand, SimNand},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use; a missing file is a blank device
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Geometry of the NAND to simulate, as BLOCKSxPAGESxBYTES[+SPARE]
    #[clap(long)]
    sim_layout: Option<Geometry>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                if path.exists() {
                    sim.load(&mut File::open(path)?)
                        .with_context(|| format!("loading {}", path.display()))?;
                }
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = if let Some(name) = &self.mtd_name {
                    MtdNand::open_named(name)?
                } else if let Some(dev) = &self.mtd_dev {
                    MtdNand::open(dev)?
                } else {
                    anyhow::bail!("no NAND device given");
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            anyhow::bail!("--sim-layout is required on this platform");
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

#[derive(Args, Debug)]
struct FtlOptions {
    /// Percentage of good blocks given logical numbers by `format`
    #[clap(long)]
    data_percent: Option<u32>,

    /// Fewest logical blocks a formatted device may have
    #[clap(long)]
    min_blocks: Option<u32>,

    /// Replacement blocks tried before a write gives up
    #[clap(long)]
    relocation_attempts: Option<u32>,

    /// Erase/program rounds of the block self-test
    #[clap(long)]
    scan_cycles: Option<u32>,

    /// Bytes per sector for `read-sectors` and `write-sectors`
    #[clap(long)]
    sector_size: Option<usize>,
}

impl From<&FtlOptions> for FtlConfig {
    fn from(value: &FtlOptions) -> Self {
        let mut config = FtlConfig::default();
        if let Some(percent) = value.data_percent {
            config = config.data_percent(percent);
        }
        if let Some(blocks) = value.min_blocks {
            config = config.min_blocks(blocks);
        }
        if let Some(attempts) = value.relocation_attempts {
            config = config.relocation_attempts(attempts);
        }
        if let Some(cycles) = value.scan_cycles {
            config = config.scan_cycles(cycles);
        }
        if let Some(size) = value.sector_size {
            config = config.sector_size(size);
        }
        config
    }
}

/// Accept decimal or 0x-prefixed hexadecimal numbers
fn parse_number(s: &str) -> Result<u64> {
    Ok(match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    })
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the device, its format and the health of its blocks; this is a read-only operation
    Info {
        /// Also list the state of every block
        #[clap(long)]
        blocks: bool,
    },

    /// Erase the device and write a fresh block table
    Format,

    /// Run the destructive self-test on one block, or on every block (which unformats the
    /// device)
    Scan {
        /// The block to test; all blocks when omitted
        block: Option<u32>,

        /// Mark the block bad if it fails
        #[clap(long)]
        retire: bool,
    },

    /// Read logical bytes, to a file or as a hex dump
    Read {
        #[clap(value_parser = parse_number)]
        address: u64,

        #[clap(value_parser = parse_number)]
        len: u64,

        /// Where to put the data instead of dumping it
        #[clap(long, short)]
        output: Option<PathBuf>,
    },

    /// Write a file's contents at a logical address
    Write {
        #[clap(value_parser = parse_number)]
        address: u64,

        path: PathBuf,
    },

    /// Read whole sectors, to a file or as a hex dump
    ReadSectors {
        #[clap(value_parser = parse_number)]
        first: u64,

        count: usize,

        /// Where to put the data instead of dumping it
        #[clap(long, short)]
        output: Option<PathBuf>,
    },

    /// Write a file's contents as whole sectors, starting at sector `first`
    WriteSectors {
        #[clap(value_parser = parse_number)]
        first: u64,

        path: PathBuf,
    },

    /// Retire a physical block
    MarkBad { block: u32 },

    /// Show where a logical address lives on the device
    Locate {
        #[clap(value_parser = parse_number)]
        address: u64,
    },
}

impl Command {
    fn execute<N: RawNand>(self, nand: N, config: FtlConfig) -> Result<()> {
        let mut ftl = Ftl::new(nand, config);

        match self {
            Command::Info { blocks } => {
                let info = ftl.device_info()?;
                let geometry = info.geometry;
                println!("id:        {:#010x}", info.id);
                println!(
                    "geometry:  {} blocks x {} pages x {}+{} bytes",
                    geometry.blocks,
                    geometry.pages_per_block,
                    geometry.bytes_per_page,
                    geometry.spare_per_page
                );

                match ftl.init() {
                    Ok(valid) => println!(
                        "format:    {valid} logical blocks, {} bytes",
                        ftl.capacity()
                    ),
                    Err(e) => println!("format:    unusable ({e})"),
                }

                let map = ftl.block_map()?;
                let health: BlockHealth = map.iter().copied().collect();
                println!(
                    "blocks:    {} used, {} free, {} bad",
                    health.used, health.free, health.bad
                );

                if blocks {
                    for (i, state) in map.iter().enumerate() {
                        let lbn = ftl.table().lbn_of(i as u32);
                        match lbn {
                            Some(lbn) => println!("{i:5} => {state:?} (logical {lbn})"),
                            None => println!("{i:5} => {state:?}"),
                        }
                    }
                }
            }

            Command::Format => {
                let valid = ftl.format()?;
                println!("Formatted: {valid} logical blocks, {} bytes", ftl.capacity());
            }

            Command::Scan { block, retire } => match block {
                Some(pbn) => {
                    if let Err(e) = ftl.init() {
                        warn!("continuing without a block table: {e}");
                    }

                    match ftl.scan_block(pbn) {
                        Ok(()) => println!("Block {pbn} passed"),
                        Err(e) if retire => {
                            println!("Block {pbn} failed: {e}");
                            ftl.mark_bad(pbn)?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None => {
                    let newly_bad = ftl.scan_all()?;
                    println!("New bad blocks: {newly_bad:?}");
                }
            },

            Command::Read {
                address,
                len,
                output,
            } => {
                ftl.init()?;
                let data = ftl.read(address, usize::try_from(len)?)?;

                match output {
                    Some(path) => fs::write(path, data)?,
                    None => hexdump(address, &data)?,
                }
            }

            Command::Write { address, path } => {
                ftl.init()?;
                let data = fs::read(&path)?;
                ftl.write(address, &data)?;

                let relocations = ftl.relocations();
                println!(
                    "Wrote {} bytes ({} blocks relocated, {} retired)",
                    data.len(),
                    relocations.done,
                    relocations.retired
                );
            }

            Command::ReadSectors {
                first,
                count,
                output,
            } => {
                ftl.init()?;
                let sector_size = ftl.config().sector_size;
                let len = count
                    .checked_mul(sector_size)
                    .context("sector count too large")?;
                let mut data = vec![0; len];
                ftl.read_sectors(first, &mut data)?;

                match output {
                    Some(path) => fs::write(path, data)?,
                    None => hexdump(first.saturating_mul(sector_size as u64), &data)?,
                }
            }

            Command::WriteSectors { first, path } => {
                ftl.init()?;
                let data = fs::read(&path)?;
                ftl.write_sectors(first, &data)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!(
                    "Wrote {} sectors",
                    data.len() / ftl.config().sector_size
                );
            }

            Command::MarkBad { block } => {
                if let Err(e) = ftl.init() {
                    warn!("continuing without a block table: {e}");
                }
                ftl.mark_bad(block)?;
            }

            Command::Locate { address } => {
                ftl.init()?;
                let placement = ftl.locate(address)?;
                println!(
                    "logical block {} page {} offset {} => block {} (page {})",
                    placement.location.lbn,
                    placement.location.page,
                    placement.location.offset,
                    placement.pbn,
                    placement.page
                );
            }
        };

        Ok(())
    }
}

fn hexdump(address: u64, data: &[u8]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    for (i, line) in data.chunks(16).enumerate() {
        write!(out, "{:08x}:", address + i as u64 * 16)?;
        for byte in line {
            write!(out, " {byte:02x}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    ftl: FtlOptions,

    /// More logging; repeat for more
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// The operation to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        ConfigBuilder::new().build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let config = FtlConfig::from(&args.ftl);
    let mut nand = args.nand.open()?;
    match &mut nand {
        NandImpl::Sim(nand) => args.cmd.execute(nand, config)?,

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(nand) => args.cmd.execute(nand, config)?,
    }
    args.nand.cleanup(nand)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sector_commands() -> Result<()> {
        let cli = Cli::try_parse_from([
            "nandftl",
            "--sim-layout",
            "128x8x256+16",
            "--sector-size",
            "96",
            "read-sectors",
            "0x7",
            "5",
        ])?;
        let config = FtlConfig::from(&cli.ftl);
        assert_eq!(config.sector_size, 96);
        assert!(matches!(
            cli.cmd,
            Command::ReadSectors {
                first: 7,
                count: 5,
                output: None
            }
        ));

        let mut nand = cli.nand.open()?;
        let NandImpl::Sim(sim) = &mut nand else {
            anyhow::bail!("expected a simulated NAND");
        };
        Command::Format.execute(&mut *sim, config)?;
        cli.cmd.execute(&mut *sim, config)?;
        Ok(())
    }
}
