//! Pinned block cache for keelfs
//!
//! Maps physical block addresses to memory-resident copies. Every lookup
//! returns a [`PinnedBlock`] guard; a block with outstanding pins is never
//! evicted, and a dirty block is flushed to the device before eviction.
//!
//! Eviction policy: least-recently-used, chosen because the recency structure
//! was already at hand and the access pattern (indirect-table walks pin the
//! hot blocks anyway) gives LRU no pathological cases here. Victims are taken
//! from the cold end; pinned entries are skipped.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, BLOCK_SIZE};

/// Error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Block {0} is out of range for the backing device")]
    InvalidBlock(u64),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

struct CachedBlock {
    data: Box<[u8; BLOCK_SIZE]>,
    dirty: bool,
    pins: u32,
}

struct CacheInner {
    device: Arc<dyn BlockDevice>,
    state: Mutex<LruCache<u64, CachedBlock>>,
    capacity: usize,
    write_through: bool,
}

/// A block cache over a [`BlockDevice`]
///
/// Cheap to clone; clones share the same cache state.
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<CacheInner>,
}

/// Pin guard over one cached block
///
/// While any guard for a block is alive the block cannot be evicted. Writes
/// through the guard mark the block dirty; the data reaches the device on
/// [`BlockCache::sync`] or at eviction time.
pub struct PinnedBlock {
    inner: Arc<CacheInner>,
    addr: u64,
}

impl BlockCache {
    /// Create a cache holding up to `capacity` blocks
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize, write_through: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Arc::new(CacheInner {
                device,
                // Unbounded: capacity is enforced manually so pinned and
                // dirty blocks can be exempted from eviction.
                state: Mutex::new(LruCache::unbounded()),
                capacity: capacity.get(),
                write_through,
            }),
        }
    }

    /// Fetch a block, loading it from the device on a miss, and pin it
    pub async fn read_block(&self, addr: u64) -> Result<PinnedBlock> {
        self.check_addr(addr)?;

        {
            let mut state = self.inner.state.lock();
            if let Some(block) = state.get_mut(&addr) {
                block.pins += 1;
                return Ok(self.guard(addr));
            }
        }

        // Miss: do the device read without holding the lock
        let mut data = Box::new([0u8; BLOCK_SIZE]);
        self.inner.device.read_block(addr, &mut data[..]).await?;

        {
            let mut state = self.inner.state.lock();
            if let Some(block) = state.get_mut(&addr) {
                // Another task loaded it while we were reading
                block.pins += 1;
            } else {
                state.put(
                    addr,
                    CachedBlock {
                        data,
                        dirty: false,
                        pins: 1,
                    },
                );
            }
        }

        self.evict_to_capacity().await?;
        Ok(self.guard(addr))
    }

    /// Replace a block's contents, marking it dirty (or writing through)
    pub async fn write_block(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_addr(addr)?;
        if data.len() != BLOCK_SIZE {
            return Err(CacheError::BlockDevice(BlockDeviceError::BadBufferSize(
                data.len(),
            )));
        }

        if self.inner.write_through {
            self.inner.device.write_block(addr, data).await?;
        }

        {
            let mut state = self.inner.state.lock();
            if let Some(block) = state.get_mut(&addr) {
                block.data.copy_from_slice(data);
                block.dirty = !self.inner.write_through;
            } else {
                let mut boxed = Box::new([0u8; BLOCK_SIZE]);
                boxed.copy_from_slice(data);
                state.put(
                    addr,
                    CachedBlock {
                        data: boxed,
                        dirty: !self.inner.write_through,
                        pins: 0,
                    },
                );
            }
        }

        self.evict_to_capacity().await
    }

    /// Pin a block without holding a guard; pairs with [`unpin_block`](Self::unpin_block)
    pub async fn pin_block(&self, addr: u64) -> Result<()> {
        // Load (and briefly guard-pin) the block, then leave one extra pin
        // behind for the caller to release with `unpin_block`.
        let guard = self.read_block(addr).await?;
        {
            let mut state = self.inner.state.lock();
            if let Some(block) = state.peek_mut(&addr) {
                block.pins += 1;
            }
        }
        drop(guard);
        Ok(())
    }

    /// Drop an explicit pin
    ///
    /// Unpinning a block with no outstanding pins is a double-release bug in
    /// the caller: it is logged and ignored rather than corrupting the count.
    pub fn unpin_block(&self, addr: u64) {
        let mut state = self.inner.state.lock();
        match state.peek_mut(&addr) {
            Some(block) if block.pins > 0 => block.pins -= 1,
            _ => {
                log::error!("cache: unpinning block {} which holds no pins", addr);
            }
        }
    }

    /// Flush dirty blocks
    ///
    /// With `addr` set only that block is flushed. A synchronous sync waits
    /// for device durability; an asynchronous one queues the flush on a
    /// background task and returns immediately.
    pub async fn sync(&self, addr: Option<u64>, async_flush: bool) -> Result<()> {
        if async_flush {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(e) = flush(&inner, addr).await {
                    log::warn!("cache: background flush failed: {}", e);
                }
            });
            return Ok(());
        }

        flush(&self.inner, addr).await?;
        self.inner.device.sync().await?;
        Ok(())
    }

    /// Number of resident blocks
    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    /// True if no blocks are resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dirty resident blocks
    pub fn dirty_count(&self) -> usize {
        self.inner.state.lock().iter().filter(|(_, b)| b.dirty).count()
    }

    /// Number of resident blocks with outstanding pins
    pub fn pinned_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .iter()
            .filter(|(_, b)| b.pins > 0)
            .count()
    }

    fn guard(&self, addr: u64) -> PinnedBlock {
        PinnedBlock {
            inner: Arc::clone(&self.inner),
            addr,
        }
    }

    fn check_addr(&self, addr: u64) -> Result<()> {
        if addr >= self.inner.device.block_count() {
            return Err(CacheError::InvalidBlock(addr));
        }
        Ok(())
    }

    /// Evict cold blocks until the cache fits its capacity
    ///
    /// Runs after every insertion. If everything over capacity is pinned the
    /// cache is allowed to stay oversized; pins are short-lived.
    async fn evict_to_capacity(&self) -> Result<()> {
        loop {
            enum Victim {
                Clean,
                Dirty(u64, Box<[u8; BLOCK_SIZE]>),
                None,
            }

            let victim = {
                let mut state = self.inner.state.lock();
                if state.len() <= self.inner.capacity {
                    return Ok(());
                }

                // Coldest unpinned entry
                let found = state
                    .iter()
                    .rev()
                    .find(|(_, b)| b.pins == 0)
                    .map(|(addr, b)| (*addr, b.dirty));

                match found {
                    None => Victim::None,
                    Some((addr, false)) => {
                        state.pop(&addr);
                        Victim::Clean
                    }
                    Some((addr, true)) => {
                        // Copy out for flushing; removal happens after the
                        // write lands so readers never see stale device data.
                        let data = state.peek(&addr).map(|b| b.data.clone());
                        match data {
                            Some(data) => Victim::Dirty(addr, data),
                            None => Victim::None,
                        }
                    }
                }
            };

            match victim {
                Victim::None => {
                    log::warn!(
                        "cache: over capacity ({} > {}) but every candidate is pinned",
                        self.len(),
                        self.inner.capacity
                    );
                    return Ok(());
                }
                Victim::Clean => continue,
                Victim::Dirty(addr, data) => {
                    self.inner.device.write_block(addr, &data[..]).await?;

                    let mut state = self.inner.state.lock();
                    if let Some(block) = state.peek_mut(&addr) {
                        // Only drop it if nothing changed while we flushed
                        if block.pins == 0 && block.data[..] == data[..] {
                            state.pop(&addr);
                        }
                    }
                }
            }
        }
    }
}

/// Write dirty blocks back to the device
async fn flush(inner: &Arc<CacheInner>, addr: Option<u64>) -> Result<()> {
    let dirty: Vec<(u64, Box<[u8; BLOCK_SIZE]>)> = {
        let state = inner.state.lock();
        state
            .iter()
            .filter(|(a, b)| b.dirty && addr.map_or(true, |want| **a == want))
            .map(|(a, b)| (*a, b.data.clone()))
            .collect()
    };

    for (block_addr, data) in dirty {
        inner.device.write_block(block_addr, &data[..]).await?;

        let mut state = inner.state.lock();
        if let Some(block) = state.peek_mut(&block_addr) {
            if block.data[..] == data[..] {
                block.dirty = false;
            }
        }
    }

    Ok(())
}

impl PinnedBlock {
    /// Physical address of the pinned block
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Copy bytes out of the block
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= BLOCK_SIZE);
        let state = self.inner.state.lock();
        let block = state.peek(&self.addr).expect("pinned block evicted");
        buf.copy_from_slice(&block.data[offset..offset + buf.len()]);
    }

    /// Copy bytes into the block, marking it dirty
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= BLOCK_SIZE);
        let mut state = self.inner.state.lock();
        let block = state.peek_mut(&self.addr).expect("pinned block evicted");
        block.data[offset..offset + data.len()].copy_from_slice(data);
        block.dirty = true;
    }

    /// Read a little-endian block pointer at `index` (for indirect tables)
    pub fn pointer_at(&self, index: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.read_at(index * 8, &mut buf);
        u64::from_le_bytes(buf)
    }

    /// Store a block pointer at `index`, marking the table dirty
    pub fn set_pointer_at(&self, index: usize, value: u64) {
        self.write_at(index * 8, &value.to_le_bytes());
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        match state.peek_mut(&self.addr) {
            Some(block) if block.pins > 0 => block.pins -= 1,
            _ => log::error!("cache: pin guard dropped for untracked block {}", self.addr),
        }
    }
}
