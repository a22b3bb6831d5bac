use crate::nand::NandError;

use thiserror::Error;

/// Result type of the translation layer
pub type Result<T> = std::result::Result<T, FtlError>;

/// Everything that can go wrong between a logical address and the raw device
#[derive(Error, Debug)]
pub enum FtlError {
    #[error("device did not become ready in time")]
    Timeout,
    #[error("page {page} did not read back as written")]
    ProgramVerifyFailed { page: u32 },
    #[error("erase of block {block} failed")]
    EraseFailed { block: u32 },
    #[error("block {block} is marked bad")]
    BadBlockEncountered { block: u32 },
    #[error("no replacement for block {block} after {attempts} attempts")]
    RelocationExhausted { block: u32, attempts: u32 },
    #[error("device is not formatted ({mapped} logical blocks found, {required} required)")]
    NotFormatted { mapped: u32, required: u32 },
    #[error("block table is corrupt at logical block {lbn}: {detail}")]
    Corrupt { lbn: u32, detail: String },
    #[error("range {address:#x}+{len} is outside the {capacity:#x}-byte device")]
    AddressOutOfRange {
        address: u64,
        len: usize,
        capacity: u64,
    },
    #[error("block {block} does not exist on a {blocks}-block device")]
    BlockOutOfRange { block: u32, blocks: u32 },
    #[error("only {good} good blocks, at least {required} needed")]
    TooFewGoodBlocks { good: u32, required: u32 },
    #[error("sector size {0} is not usable")]
    BadSectorSize(usize),
    #[error("spare metadata codec: {0}")]
    Codec(#[from] deku::DekuError),
    #[error(transparent)]
    Device(NandError),
}

impl From<NandError> for FtlError {
    fn from(value: NandError) -> Self {
        match value {
            NandError::Timeout(_) => Self::Timeout,
            NandError::ProgramFailed { page } => Self::ProgramVerifyFailed { page },
            NandError::EraseFailed { block } => Self::EraseFailed { block },
            other => Self::Device(other),
        }
    }
}
