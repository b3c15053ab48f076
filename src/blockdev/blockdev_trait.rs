//! Block device trait definitions for keelfs

use std::io;
use thiserror::Error;

/// Block size in bytes (4KB)
pub const BLOCK_SIZE: usize = 4096;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Block {0} is out of range for this device")]
    OutOfRange(u64),
    #[error("Buffer length {0} does not match block size {BLOCK_SIZE}")]
    BadBufferSize(usize),
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device has been closed")]
    Closed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device operations
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read a single block into `buf` (must be exactly `BLOCK_SIZE` long)
    async fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write a single block from `data` (must be exactly `BLOCK_SIZE` long)
    async fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;

    /// Total number of blocks on the device
    fn block_count(&self) -> u64;

    /// Block size in bytes
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Make all completed writes durable
    async fn sync(&self) -> Result<()>;

    /// Close the device; further operations fail with `Closed`
    async fn close(&mut self) -> Result<()>;

    /// Whether the device rejects writes
    fn is_read_only(&self) -> bool {
        false
    }
}
