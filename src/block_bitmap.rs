//! Allocation bitmaps for keelfs
//!
//! One bit per unit, first-fit allocation. The same structure backs both the
//! data-block bitmap (where units are absolute physical block numbers offset
//! by the start of the data area) and the inode bitmap (base 0).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};

/// Error type for bitmap operations
#[derive(Error, Debug)]
pub enum BitmapError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Unit {0} is outside this bitmap")]
    OutOfRange(u64),
    #[error("Unit {0} is already free")]
    AlreadyFree(u64),
    #[error("No free units available")]
    Exhausted,
}

/// First-fit allocation bitmap
pub struct AllocBitmap {
    bits: Vec<u8>,
    /// Value of unit 0; allocations return `base + index`
    base: u64,
    count: u64,
    free: AtomicU64,
}

impl AllocBitmap {
    /// Create an empty bitmap of `count` units starting at `base`
    pub fn new(base: u64, count: u64) -> Self {
        let bytes = ((count + 7) / 8) as usize;
        Self {
            bits: vec![0u8; bytes],
            base,
            count,
            free: AtomicU64::new(count),
        }
    }

    /// Load a bitmap from `blocks` consecutive device blocks starting at `first_block`
    pub async fn load(
        device: &Arc<dyn BlockDevice>,
        first_block: u64,
        blocks: u64,
        base: u64,
        count: u64,
    ) -> Result<Self, BitmapError> {
        let bytes = ((count + 7) / 8) as usize;
        let mut bits = vec![0u8; bytes];

        let mut copied = 0usize;
        for offset in 0..blocks {
            let mut block = vec![0u8; BLOCK_SIZE];
            device.read_block(first_block + offset, &mut block).await?;

            let chunk = BLOCK_SIZE.min(bytes - copied);
            bits[copied..copied + chunk].copy_from_slice(&block[..chunk]);
            copied += chunk;
            if copied >= bytes {
                break;
            }
        }

        let mut free = 0u64;
        for unit in 0..count {
            let byte = (unit / 8) as usize;
            let bit = unit % 8;
            if bits[byte] & (1 << bit) == 0 {
                free += 1;
            }
        }

        log::debug!("bitmap: loaded {} units, {} free", count, free);

        Ok(Self {
            bits,
            base,
            count,
            free: AtomicU64::new(free),
        })
    }

    /// Render the bitmap as device-block-sized buffers
    ///
    /// Lets a caller snapshot the bits under a short lock and do the device
    /// writes afterwards.
    pub fn to_blocks(&self, blocks: u64) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(blocks as usize);
        let mut copied = 0usize;
        for _ in 0..blocks {
            let mut block = vec![0u8; BLOCK_SIZE];
            let chunk = BLOCK_SIZE.min(self.bits.len() - copied);
            block[..chunk].copy_from_slice(&self.bits[copied..copied + chunk]);
            out.push(block);
            copied += chunk;
        }
        out
    }

    /// Save the bitmap back to its device blocks
    pub async fn save(
        &self,
        device: &Arc<dyn BlockDevice>,
        first_block: u64,
        blocks: u64,
    ) -> Result<(), BitmapError> {
        for (offset, block) in self.to_blocks(blocks).into_iter().enumerate() {
            device.write_block(first_block + offset as u64, &block).await?;
        }
        Ok(())
    }

    /// Allocate the first free unit, returning its absolute value
    pub fn allocate(&mut self) -> Result<u64, BitmapError> {
        if self.free.load(Ordering::Relaxed) == 0 {
            return Err(BitmapError::Exhausted);
        }

        for (byte_idx, byte) in self.bits.iter_mut().enumerate() {
            if *byte == 0xFF {
                continue;
            }
            for bit in 0..8 {
                if *byte & (1 << bit) == 0 {
                    let unit = byte_idx as u64 * 8 + bit;
                    if unit >= self.count {
                        return Err(BitmapError::Exhausted);
                    }
                    *byte |= 1 << bit;
                    self.free.fetch_sub(1, Ordering::Relaxed);
                    return Ok(self.base + unit);
                }
            }
        }

        Err(BitmapError::Exhausted)
    }

    /// Free a previously allocated unit; double frees are an error
    pub fn release(&mut self, value: u64) -> Result<(), BitmapError> {
        let unit = self.index_of(value)?;
        let byte = (unit / 8) as usize;
        let bit = unit % 8;

        if self.bits[byte] & (1 << bit) == 0 {
            return Err(BitmapError::AlreadyFree(value));
        }

        self.bits[byte] &= !(1 << bit);
        self.free.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Mark a specific unit allocated (used while formatting)
    pub fn reserve(&mut self, value: u64) -> Result<(), BitmapError> {
        let unit = self.index_of(value)?;
        let byte = (unit / 8) as usize;
        let bit = unit % 8;

        if self.bits[byte] & (1 << bit) == 0 {
            self.bits[byte] |= 1 << bit;
            self.free.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Whether a unit is currently allocated
    pub fn is_allocated(&self, value: u64) -> bool {
        match self.index_of(value) {
            Ok(unit) => {
                let byte = (unit / 8) as usize;
                let bit = unit % 8;
                self.bits[byte] & (1 << bit) != 0
            }
            Err(_) => false,
        }
    }

    /// Number of free units
    pub fn free_count(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    /// Total units tracked
    pub fn total(&self) -> u64 {
        self.count
    }

    fn index_of(&self, value: u64) -> Result<u64, BitmapError> {
        if value < self.base || value - self.base >= self.count {
            return Err(BitmapError::OutOfRange(value));
        }
        Ok(value - self.base)
    }
}

impl std::fmt::Debug for AllocBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocBitmap")
            .field("base", &self.base)
            .field("count", &self.count)
            .field("free", &self.free.load(Ordering::Relaxed))
            .finish()
    }
}
