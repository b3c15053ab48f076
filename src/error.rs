//! Crate-level error type for keelfs

use thiserror::Error;

use crate::block_bitmap::BitmapError;
use crate::blockdev::BlockDeviceError;
use crate::cache::CacheError;
use crate::format::FormatError;

/// Unified error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("No free blocks")]
    NoFreeBlocks,
    #[error("No free inodes")]
    NoFreeInodes,
    #[error("Invalid inode number {0}")]
    InvalidInode(u64),
    #[error("File or directory not found")]
    NotFound,
    #[error("Entry already exists")]
    AlreadyExists,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Directory not empty")]
    DirectoryNotEmpty,
    #[error("Broken pipe: no readers remain")]
    BrokenPipe,
    #[error("Logical block {0} is beyond the addressable chain")]
    BlockOutOfChain(u64),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<BitmapError> for Error {
    fn from(err: BitmapError) -> Self {
        match err {
            BitmapError::BlockDevice(e) => Error::BlockDevice(e),
            BitmapError::Exhausted => Error::NoFreeBlocks,
            BitmapError::OutOfRange(n) => {
                Error::InvalidArgument(format!("bitmap unit {} out of range", n))
            }
            BitmapError::AlreadyFree(n) => {
                Error::InvalidArgument(format!("bitmap unit {} already free", n))
            }
        }
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
