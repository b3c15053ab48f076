//! In-memory node over an on-disk inode
//!
//! A [`Node`] owns the block chain of one inode: 12 direct pointers plus
//! single, double, and triple indirect tables, each table holding
//! [`POINTERS_PER_BLOCK`] little-endian block numbers. All pointers are
//! absolute physical block numbers with 0 meaning unallocated; block 0 holds
//! the superblock, so the sentinel cannot collide with real data.
//!
//! Reads treat unallocated (or unreadable) regions of the chain as holes and
//! return zeroes. Writes and chain-growing operations propagate those errors
//! instead.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::block_bitmap::AllocBitmap;
use crate::blockdev::BLOCK_SIZE;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::format::{
    DiskInode, DOUBLE_INDIRECT, DIRECT_POINTERS, INODE_SIZE, POINTERS_PER_BLOCK, SINGLE_INDIRECT,
    TRIPLE_INDIRECT,
};
use crate::layout::Layout;
use crate::reaper::{ReaperHandle, Zombie};

static ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Seconds since the unix epoch, saturating at 0 on clock trouble
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Shared volume state every node operates against
pub struct FsContext {
    /// Block cache over the backing device
    pub cache: BlockCache,
    /// Data-block allocation bitmap
    pub block_alloc: Mutex<AllocBitmap>,
    /// Inode allocation bitmap
    pub inode_alloc: Mutex<AllocBitmap>,
    /// On-disk region layout
    pub layout: Layout,
    /// Queue for deferred node destruction
    pub reaper: ReaperHandle,
    /// Live nodes by inode number
    pub nodes: Mutex<HashMap<u64, Weak<Node>>>,
}

impl FsContext {
    /// Allocate one data block
    pub fn allocate_block(&self) -> Result<u64> {
        Ok(self.block_alloc.lock().allocate()?)
    }

    /// Free a data block, tolerating an already-free or out-of-range value
    ///
    /// Used on teardown paths that may walk a partially built chain; a bad
    /// pointer there is logged rather than aborting the rest of the walk.
    pub fn release_block(&self, addr: u64) {
        if let Err(e) = self.block_alloc.lock().release(addr) {
            log::warn!("block {} could not be freed: {}", addr, e);
        }
    }
}

/// Mutable inode state, guarded by the node's async lock
struct NodeState {
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    atime: u64,
    mtime: u64,
    ctime: u64,
    links: u16,
    /// Data blocks needed to cover `size`
    blocks: u64,
    flags: u32,
    pointers: [u64; 15],
    /// Metadata differs from the inode table copy
    dirty: bool,
}

impl NodeState {
    fn from_disk(inode: &DiskInode) -> Self {
        Self {
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            links: inode.links,
            blocks: inode.blocks,
            flags: inode.flags,
            pointers: inode.block,
            dirty: false,
        }
    }

    fn to_disk(&self) -> DiskInode {
        DiskInode {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            links: self.links,
            blocks: self.blocks,
            flags: self.flags,
            block: self.pointers,
        }
    }
}

/// How a logical block index maps into the pointer structure
enum BlockPath {
    Direct(usize),
    Indirect { root: usize, indices: Vec<u64> },
}

fn path_for(logical: u64) -> Result<BlockPath> {
    let n = POINTERS_PER_BLOCK as u64;

    if logical < DIRECT_POINTERS as u64 {
        return Ok(BlockPath::Direct(logical as usize));
    }
    let mut rest = logical - DIRECT_POINTERS as u64;
    if rest < n {
        return Ok(BlockPath::Indirect {
            root: SINGLE_INDIRECT,
            indices: vec![rest],
        });
    }
    rest -= n;
    if rest < n * n {
        return Ok(BlockPath::Indirect {
            root: DOUBLE_INDIRECT,
            indices: vec![rest / n, rest % n],
        });
    }
    rest -= n * n;
    if rest < n * n * n {
        return Ok(BlockPath::Indirect {
            root: TRIPLE_INDIRECT,
            indices: vec![rest / (n * n), (rest / n) % n, rest % n],
        });
    }
    Err(Error::BlockOutOfChain(logical))
}

fn blocks_for(size: u64) -> u64 {
    (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

/// One live inode
pub struct Node {
    ino: u64,
    ctx: Arc<FsContext>,
    state: tokio::sync::Mutex<NodeState>,
    open_handles: AtomicUsize,
    unlinked: AtomicBool,
    zombied: AtomicBool,
}

impl Node {
    /// Wrap an inode read from the inode table
    pub fn from_disk(ino: u64, ctx: Arc<FsContext>, inode: &DiskInode) -> Self {
        Self {
            ino,
            ctx,
            state: tokio::sync::Mutex::new(NodeState::from_disk(inode)),
            open_handles: AtomicUsize::new(0),
            unlinked: AtomicBool::new(false),
            zombied: AtomicBool::new(false),
        }
    }

    /// Inode number
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Current size in bytes
    pub async fn size(&self) -> u64 {
        self.state.lock().await.size
    }

    /// Mode and type bits
    pub async fn mode(&self) -> u32 {
        self.state.lock().await.mode
    }

    /// Hard link count
    pub async fn links(&self) -> u16 {
        self.state.lock().await.links
    }

    /// Snapshot of the on-disk representation
    pub async fn to_disk(&self) -> DiskInode {
        self.state.lock().await.to_disk()
    }

    /// Change ownership and mode bits
    pub async fn update_metadata(&self, uid: u32, gid: u32, mode: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.uid = uid;
        state.gid = gid;
        state.mode = mode;
        state.ctime = unix_now();
        state.dirty = true;
        self.write_back(&mut state).await
    }

    /// Adjust the hard link count by `delta`
    pub async fn adjust_links(&self, delta: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.links = (state.links as i32 + delta).max(0) as u16;
        state.ctime = unix_now();
        state.dirty = true;
        self.write_back(&mut state).await
    }

    /// Physical block backing logical block `logical`, if allocated
    ///
    /// `Ok(None)` for holes and for indices beyond the current chain length;
    /// an index beyond the triple-indirect tier is an error.
    pub async fn block_number(&self, logical: u64) -> Result<Option<u64>> {
        let state = self.state.lock().await;
        if logical >= state.blocks {
            path_for(logical)?;
            return Ok(None);
        }
        self.resolve(&state.pointers, logical, false).await
    }

    /// Read up to `buf.len()` bytes at `offset`
    ///
    /// Short reads happen only at end of file. Holes read as zeroes, and so
    /// does any region whose indirect table has become unreadable.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        if offset >= state.size || buf.is_empty() {
            return Ok(0);
        }

        let end = state.size.min(offset + buf.len() as u64);
        let mut pos = offset;
        let mut done = 0usize;

        while pos < end {
            let logical = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = ((BLOCK_SIZE - block_off) as u64).min(end - pos) as usize;
            let slice = &mut buf[done..done + chunk];

            match self.resolve(&state.pointers, logical, true).await? {
                None => slice.fill(0),
                Some(phys) => {
                    let block = self.ctx.cache.read_block(phys).await?;
                    block.read_at(block_off, slice);
                }
            }

            pos += chunk as u64;
            done += chunk;
        }

        state.atime = unix_now();
        state.dirty = true;
        self.write_back(&mut state).await?;
        Ok(done)
    }

    /// Write `data` at `offset`, allocating blocks as needed
    ///
    /// Writing past the end grows the file; untouched blocks in the gap stay
    /// unallocated and read back as zeroes. If allocation fails partway, the
    /// bytes already written remain and the count written so far is returned;
    /// a failure before any byte lands propagates the error.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().await;
        let end = offset + data.len() as u64;
        let mut pos = offset;
        let mut done = 0usize;

        while pos < end {
            let logical = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = ((BLOCK_SIZE - block_off) as u64).min(end - pos) as usize;

            // Anything past the tracked chain length is treated as
            // unallocated and gets a fresh block.
            let existing = if logical < state.blocks {
                self.resolve(&state.pointers, logical, false).await?
            } else {
                None
            };

            let phys = match existing {
                Some(phys) => phys,
                None => {
                    let mut tables = Vec::new();
                    let mut touched = Vec::new();
                    match self
                        .allocate_data_block(&mut state, logical, &mut tables, &mut touched)
                        .await
                    {
                        Ok(phys) => phys,
                        Err(e) if done > 0 => {
                            log::warn!("node {}: short write after {} bytes: {}", self.ino, done, e);
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            let block = self.ctx.cache.read_block(phys).await?;
            block.write_at(block_off, &data[done..done + chunk]);

            pos += chunk as u64;
            done += chunk;
            state.size = state.size.max(pos);
            state.blocks = state.blocks.max(blocks_for(state.size)).max(logical + 1);
        }

        state.mtime = unix_now();
        state.dirty = true;
        self.write_back(&mut state).await?;
        Ok(done)
    }

    /// Grow the chain so it covers `new_size` bytes
    ///
    /// A target at or below the current size is a no-op. Every block added is
    /// zero-filled before it is linked in. On allocation failure the size and
    /// the whole chain revert to their state before the call: every block
    /// allocated by the call is returned to the bitmap, and every pointer the
    /// call wrote into a surviving indirect table is cleared again.
    pub async fn extend(&self, new_size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if new_size <= state.size {
            return Ok(());
        }

        let target_blocks = blocks_for(new_size);
        let saved_pointers = state.pointers;
        let saved_size = state.size;
        let saved_blocks = state.blocks;

        let mut new_data = Vec::new();
        let mut new_tables = Vec::new();
        let mut touched = Vec::new();
        let mut failure = None;

        for logical in saved_blocks..target_blocks {
            match self
                .allocate_data_block(&mut state, logical, &mut new_tables, &mut touched)
                .await
            {
                Ok(addr) => new_data.push(addr),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            log::warn!(
                "node {}: extend to {} bytes failed, rolling back {} block(s): {}",
                self.ino,
                new_size,
                new_data.len() + new_tables.len(),
                e
            );
            // Clear pointers written into tables that predate this call, so a
            // later wipe cannot free blocks the bitmap has handed to someone
            // else. Entries in tables allocated here vanish with their table.
            for (table, idx) in touched {
                match self.ctx.cache.read_block(table).await {
                    Ok(guard) => guard.set_pointer_at(idx, 0),
                    Err(io) => log::warn!(
                        "node {}: table {} unreadable while rolling back: {}",
                        self.ino,
                        table,
                        io
                    ),
                }
            }
            state.pointers = saved_pointers;
            state.size = saved_size;
            state.blocks = saved_blocks;
            for addr in new_data.into_iter().chain(new_tables) {
                self.ctx.release_block(addr);
            }
            return Err(e);
        }

        state.size = new_size;
        state.blocks = target_blocks;
        state.mtime = unix_now();
        state.dirty = true;
        self.write_back(&mut state).await?;
        Ok(())
    }

    /// Release the whole block chain and reset the size to zero
    ///
    /// Tolerates a partially built or damaged chain: unreadable indirect
    /// tables are logged and their subtrees skipped, and blocks the bitmap
    /// does not consider allocated are skipped too.
    pub async fn wipe(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        for i in 0..DIRECT_POINTERS {
            let ptr = state.pointers[i];
            if ptr != 0 {
                self.ctx.release_block(ptr);
            }
        }
        self.free_tree(state.pointers[SINGLE_INDIRECT], 1).await;
        self.free_tree(state.pointers[DOUBLE_INDIRECT], 2).await;
        self.free_tree(state.pointers[TRIPLE_INDIRECT], 3).await;

        state.pointers = [0; 15];
        state.size = 0;
        state.blocks = 0;
        state.mtime = unix_now();
        state.dirty = true;
        self.write_back(&mut state).await?;
        Ok(())
    }

    /// Pin the cached block backing byte offset `location`
    pub async fn pin(&self, location: u64) -> Result<()> {
        let phys = self.physical_at(location).await?;
        self.ctx.cache.pin_block(phys).await?;
        Ok(())
    }

    /// Drop a pin taken with [`pin`](Self::pin)
    pub async fn unpin(&self, location: u64) -> Result<()> {
        let phys = self.physical_at(location).await?;
        self.ctx.cache.unpin_block(phys);
        Ok(())
    }

    /// Flush this node's data to the device
    ///
    /// With `offset` set, only the block covering that offset is written (a
    /// hole there is a no-op). A full sync also writes the inode back to the
    /// inode table. `async_flush` queues the work instead of awaiting it.
    pub async fn sync(&self, offset: Option<u64>, async_flush: bool) -> Result<()> {
        match offset {
            Some(off) => {
                let state = self.state.lock().await;
                let logical = off / BLOCK_SIZE as u64;
                if logical >= state.blocks {
                    return Ok(());
                }
                match self.resolve(&state.pointers, logical, false).await? {
                    Some(phys) => {
                        drop(state);
                        self.ctx.cache.sync(Some(phys), async_flush).await?;
                    }
                    None => {}
                }
            }
            None => {
                self.flush_metadata().await?;
                self.ctx.cache.sync(None, async_flush).await?;
            }
        }
        Ok(())
    }

    /// Write the inode back into the inode table if it changed
    pub async fn flush_metadata(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.write_back(&mut state).await
    }

    /// Serialize the inode into its inode-table block
    ///
    /// Every mutating operation calls this before returning, so the cached
    /// inode table is always current and dropping the last `Arc<Node>` can
    /// never lose size or chain updates. The table block reaches the device
    /// on the next cache sync.
    async fn write_back(&self, state: &mut NodeState) -> Result<()> {
        if !state.dirty {
            return Ok(());
        }

        let mut buf = [0u8; INODE_SIZE];
        state.to_disk().write_to(&mut Cursor::new(&mut buf[..]))?;

        let (block, offset) = self.ctx.layout.inode_block(self.ino);
        let guard = self.ctx.cache.read_block(block).await?;
        guard.write_at(offset, &buf);

        state.dirty = false;
        Ok(())
    }

    /// Record another open handle
    pub fn open(&self) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of handles currently open
    pub fn open_handle_count(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Mark the node as removed from its directory
    ///
    /// Destruction is deferred until the last open handle is released.
    pub fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::SeqCst);
    }

    /// Whether the node has been removed from its directory
    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::SeqCst)
    }

    /// Drop one open handle
    ///
    /// When the last handle on an unlinked node goes away the node is handed
    /// to the reaper, which frees its blocks and inode off this call stack.
    /// Releasing with no handles open is a caller bug; it is logged and the
    /// count left untouched.
    pub fn release(self: &Arc<Self>) {
        let prev = self.open_handles.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            self.open_handles.fetch_add(1, Ordering::SeqCst);
            log::error!("node {}: handle released with none open", self.ino);
            return;
        }

        if prev == 1 && self.unlinked.load(Ordering::SeqCst) {
            // Exactly one enqueue, even if a racing open/release pair lands here
            if !self.zombied.swap(true, Ordering::SeqCst) {
                self.ctx.reaper.add(Box::new(ZombieNode(Arc::clone(self))));
            }
        }
    }

    /// Hand an unlinked, idle node to the reaper
    ///
    /// Called at unlink time; if handles are still open the node is instead
    /// reclaimed by the last [`release`](Self::release).
    pub fn reclaim_if_idle(self: &Arc<Self>) {
        if self.is_unlinked()
            && self.open_handle_count() == 0
            && !self.zombied.swap(true, Ordering::SeqCst)
        {
            self.ctx.reaper.add(Box::new(ZombieNode(Arc::clone(self))));
        }
    }

    /// Shared volume context
    pub fn context(&self) -> &Arc<FsContext> {
        &self.ctx
    }

    async fn physical_at(&self, location: u64) -> Result<u64> {
        let state = self.state.lock().await;
        let logical = location / BLOCK_SIZE as u64;
        match self.resolve(&state.pointers, logical, false).await? {
            Some(phys) => Ok(phys),
            None => Err(Error::InvalidArgument(format!(
                "no block allocated at offset {}",
                location
            ))),
        }
    }

    /// Walk the pointer structure for one logical block
    ///
    /// With `tolerate_io` set, an unreadable indirect table degrades to a
    /// hole; otherwise the error propagates.
    async fn resolve(
        &self,
        pointers: &[u64; 15],
        logical: u64,
        tolerate_io: bool,
    ) -> Result<Option<u64>> {
        let (root, indices) = match path_for(logical)? {
            BlockPath::Direct(i) => {
                let ptr = pointers[i];
                return Ok(if ptr == 0 { None } else { Some(ptr) });
            }
            BlockPath::Indirect { root, indices } => (root, indices),
        };

        let mut current = pointers[root];
        for &idx in &indices {
            if current == 0 {
                return Ok(None);
            }
            let table = match self.ctx.cache.read_block(current).await {
                Ok(table) => table,
                Err(e) if tolerate_io => {
                    log::warn!(
                        "node {}: indirect table {} unreadable, treating as hole: {}",
                        self.ino,
                        current,
                        e
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            current = table.pointer_at(idx as usize);
        }

        Ok(if current == 0 { None } else { Some(current) })
    }

    /// Allocate and zero a data block, then link it at `logical`
    ///
    /// Indirect tables created along the way are recorded in `new_tables`,
    /// and every `(table, index)` pointer slot written is recorded in
    /// `touched`, so the caller can roll the whole linking step back.
    async fn allocate_data_block(
        &self,
        state: &mut NodeState,
        logical: u64,
        new_tables: &mut Vec<u64>,
        touched: &mut Vec<(u64, usize)>,
    ) -> Result<u64> {
        let addr = self.ctx.allocate_block()?;
        self.ctx.cache.write_block(addr, &ZERO_BLOCK).await?;

        if let Err(e) = self
            .set_block(state, logical, addr, new_tables, touched)
            .await
        {
            self.ctx.release_block(addr);
            return Err(e);
        }
        Ok(addr)
    }

    /// Store `phys` as the block number for `logical`, creating indirect
    /// tables on demand
    async fn set_block(
        &self,
        state: &mut NodeState,
        logical: u64,
        phys: u64,
        new_tables: &mut Vec<u64>,
        touched: &mut Vec<(u64, usize)>,
    ) -> Result<()> {
        let (root, indices) = match path_for(logical)? {
            BlockPath::Direct(i) => {
                state.pointers[i] = phys;
                state.dirty = true;
                return Ok(());
            }
            BlockPath::Indirect { root, indices } => (root, indices),
        };

        let mut current = state.pointers[root];
        if current == 0 {
            current = self.alloc_table(new_tables).await?;
            state.pointers[root] = current;
            state.dirty = true;
        }

        let last = indices.len() - 1;
        for (depth, &idx) in indices.iter().enumerate() {
            let table = self.ctx.cache.read_block(current).await?;
            if depth == last {
                touched.push((current, idx as usize));
                table.set_pointer_at(idx as usize, phys);
            } else {
                let mut next = table.pointer_at(idx as usize);
                if next == 0 {
                    next = self.alloc_table(new_tables).await?;
                    touched.push((current, idx as usize));
                    table.set_pointer_at(idx as usize, next);
                }
                current = next;
            }
        }
        Ok(())
    }

    /// Allocate a zeroed indirect table block
    async fn alloc_table(&self, new_tables: &mut Vec<u64>) -> Result<u64> {
        let addr = self.ctx.allocate_block()?;
        self.ctx.cache.write_block(addr, &ZERO_BLOCK).await?;
        new_tables.push(addr);
        Ok(addr)
    }

    /// Free an indirect subtree rooted at `root`
    ///
    /// `depth` counts table levels above the data blocks. Unreadable tables
    /// are logged; their data blocks leak rather than poisoning the rest of
    /// the teardown.
    fn free_tree(&self, root: u64, depth: u32) -> BoxFuture<'_, ()> {
        async move {
            if root == 0 {
                return;
            }
            if depth > 0 {
                match self.ctx.cache.read_block(root).await {
                    Ok(table) => {
                        for idx in 0..POINTERS_PER_BLOCK {
                            let ptr = table.pointer_at(idx);
                            if ptr != 0 {
                                self.free_tree(ptr, depth - 1).await;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "node {}: indirect table {} unreadable during teardown: {}",
                            self.ino,
                            root,
                            e
                        );
                    }
                }
            }
            self.ctx.release_block(root);
        }
        .boxed()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("ino", &self.ino)
            .field("open_handles", &self.open_handle_count())
            .field("unlinked", &self.is_unlinked())
            .finish()
    }
}

/// An unlinked node whose last handle has closed
struct ZombieNode(Arc<Node>);

#[async_trait]
impl Zombie for ZombieNode {
    fn describe(&self) -> &str {
        "unlinked node"
    }

    async fn reap(self: Box<Self>) {
        let node = self.0;
        log::debug!("reclaiming node {}", node.ino());

        if let Err(e) = node.wipe().await {
            log::warn!("node {}: wipe during reclaim failed: {}", node.ino(), e);
        }
        if let Err(e) = node.flush_metadata().await {
            log::warn!(
                "node {}: metadata flush during reclaim failed: {}",
                node.ino(),
                e
            );
        }

        node.ctx.nodes.lock().remove(&node.ino);
        let freed = node.ctx.inode_alloc.lock().release(node.ino);
        if let Err(e) = freed {
            log::warn!("node {}: inode could not be freed: {}", node.ino(), e);
        }
    }
}
