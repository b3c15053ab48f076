//! Volume assembly: format, mount, and namespace operations
//!
//! A [`Volume`] ties the layers together: superblock and layout, allocation
//! bitmaps, the block cache, the live node table, the FIFO registry, and the
//! reaper that tears down unlinked objects off their callers' stacks.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::block_bitmap::{AllocBitmap, BitmapError};
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::cache::BlockCache;
use crate::dir::Directory;
use crate::error::{Error, Result};
use crate::format::{
    file_type, DiskInode, FormatError, Superblock, INODE_SIZE, MODE_DIRECTORY, MODE_FIFO,
    ROOT_INODE,
};
use crate::layout::Layout;
use crate::node::{unix_now, FsContext, Node};
use crate::pipe::Pipe;
use crate::reaper::{ReaperHandle, ZombieQueue};

/// Cached blocks held in memory (4 MiB at the default block size)
const CACHE_CAPACITY: usize = 1024;

/// Point-in-time allocation counters
#[derive(Debug, Clone, Copy)]
pub struct VolumeStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// A mounted filesystem volume
pub struct Volume {
    device: Arc<dyn BlockDevice>,
    ctx: Arc<FsContext>,
    superblock: Mutex<Superblock>,
    queue: ZombieQueue,
    root: OnceCell<Arc<Directory>>,
    /// Live FIFO buffers by inode number
    pipes: Mutex<HashMap<u64, Arc<Pipe>>>,
}

impl Volume {
    /// Format the device and mount the fresh volume
    ///
    /// Lays down the superblock, zeroed bitmaps and inode table, and an
    /// empty root directory.
    pub async fn format(
        device: Arc<dyn BlockDevice>,
        volume_name: Option<&str>,
    ) -> Result<Self> {
        let size = device.block_count() * BLOCK_SIZE as u64;
        let mut sb = Superblock::new(size, volume_name)?;
        let layout = Layout::new(sb.block_count, sb.inode_count);
        if layout.data_count == 0 {
            return Err(FormatError::InvalidSize.into());
        }

        let zero = vec![0u8; BLOCK_SIZE];
        for block in 1..layout.data_start {
            device.write_block(block, &zero).await?;
        }

        let mut block_alloc = AllocBitmap::new(layout.data_start, layout.data_count);
        let mut inode_alloc = AllocBitmap::new(0, sb.inode_count);
        // Inode 0 stays reserved as the "no inode" sentinel
        inode_alloc.reserve(0)?;
        inode_alloc.reserve(ROOT_INODE)?;

        let root_inode = DiskInode::new(MODE_DIRECTORY | 0o755, 0, 0, unix_now());
        let (block, offset) = layout.inode_block(ROOT_INODE);
        let mut table_block = vec![0u8; BLOCK_SIZE];
        root_inode.write_to(&mut Cursor::new(&mut table_block[offset..offset + INODE_SIZE]))?;
        device.write_block(block, &table_block).await?;

        block_alloc
            .save(&device, layout.block_bitmap, layout.block_bitmap_blocks)
            .await?;
        inode_alloc
            .save(&device, layout.inode_bitmap, layout.inode_bitmap_blocks)
            .await?;

        sb.free_blocks = block_alloc.free_count();
        sb.free_inodes = inode_alloc.free_count();
        sb.last_write = unix_now();
        write_superblock(&device, &sb).await?;
        device.sync().await?;

        log::info!(
            "formatted volume: {} blocks ({} data), {} inodes",
            sb.block_count,
            layout.data_count,
            sb.inode_count
        );
        Ok(Self::assemble(device, sb, layout, block_alloc, inode_alloc))
    }

    /// Mount an existing volume
    ///
    /// Validates the superblock magic, version, and checksum, then loads the
    /// allocation bitmaps.
    pub async fn open(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut block = vec![0u8; BLOCK_SIZE];
        device.read_block(0, &mut block).await?;
        let mut sb = Superblock::read_from(&mut Cursor::new(&block[..]))?;

        if sb.block_size != BLOCK_SIZE as u32 || sb.block_count > device.block_count() {
            return Err(FormatError::InvalidSize.into());
        }

        let layout = Layout::new(sb.block_count, sb.inode_count);
        let block_alloc = AllocBitmap::load(
            &device,
            layout.block_bitmap,
            layout.block_bitmap_blocks,
            layout.data_start,
            layout.data_count,
        )
        .await?;
        let inode_alloc = AllocBitmap::load(
            &device,
            layout.inode_bitmap,
            layout.inode_bitmap_blocks,
            0,
            sb.inode_count,
        )
        .await?;

        sb.last_mount = unix_now();
        write_superblock(&device, &sb).await?;

        log::info!(
            "mounted volume '{}': {} free blocks, {} free inodes",
            label_of(&sb),
            block_alloc.free_count(),
            inode_alloc.free_count()
        );
        Ok(Self::assemble(device, sb, layout, block_alloc, inode_alloc))
    }

    fn assemble(
        device: Arc<dyn BlockDevice>,
        sb: Superblock,
        layout: Layout,
        block_alloc: AllocBitmap,
        inode_alloc: AllocBitmap,
    ) -> Self {
        let cache = BlockCache::new(Arc::clone(&device), CACHE_CAPACITY, false);
        let queue = ZombieQueue::new();

        let ctx = Arc::new(FsContext {
            cache,
            block_alloc: Mutex::new(block_alloc),
            inode_alloc: Mutex::new(inode_alloc),
            layout,
            reaper: queue.handle(),
            nodes: Mutex::new(HashMap::new()),
        });

        Self {
            device,
            ctx,
            superblock: Mutex::new(sb),
            queue,
            root: OnceCell::new(),
            pipes: Mutex::new(HashMap::new()),
        }
    }

    /// Volume label
    pub fn label(&self) -> String {
        label_of(&self.superblock.lock())
    }

    /// Allocation counters
    pub fn stats(&self) -> VolumeStats {
        let sb = self.superblock.lock();
        VolumeStats {
            total_blocks: sb.block_count,
            free_blocks: self.ctx.block_alloc.lock().free_count(),
            total_inodes: sb.inode_count,
            free_inodes: self.ctx.inode_alloc.lock().free_count(),
        }
    }

    /// Shared per-volume context
    pub fn context(&self) -> &Arc<FsContext> {
        &self.ctx
    }

    /// Handle for queueing deferred destruction
    pub fn reaper(&self) -> ReaperHandle {
        self.ctx.reaper.clone()
    }

    /// Wait for all queued reclamation to finish
    pub async fn quiesce(&self) {
        self.queue.quiesce().await;
    }

    /// The root directory
    pub async fn root(&self) -> Result<Arc<Directory>> {
        self.root
            .get_or_try_init(|| async {
                let node = self.get_node(ROOT_INODE).await?;
                Ok::<_, Error>(Arc::new(Directory::new(node)))
            })
            .await
            .cloned()
    }

    /// Fetch the live node for an inode, loading it from the table on demand
    ///
    /// All callers share one [`Node`] per inode, so handle counts and chain
    /// state stay coherent.
    pub async fn get_node(&self, ino: u64) -> Result<Arc<Node>> {
        let inode_count = self.superblock.lock().inode_count;
        if ino == 0 || ino >= inode_count || !self.ctx.inode_alloc.lock().is_allocated(ino) {
            return Err(Error::InvalidInode(ino));
        }

        if let Some(node) = self.ctx.nodes.lock().get(&ino).and_then(Weak::upgrade) {
            return Ok(node);
        }

        let (block, offset) = self.ctx.layout.inode_block(ino);
        let guard = self.ctx.cache.read_block(block).await?;
        let mut raw = [0u8; INODE_SIZE];
        guard.read_at(offset, &mut raw);
        let disk = DiskInode::read_from(&mut Cursor::new(&raw[..]))?;

        let node = Arc::new(Node::from_disk(ino, Arc::clone(&self.ctx), &disk));

        let mut nodes = self.ctx.nodes.lock();
        if let Some(existing) = nodes.get(&ino).and_then(Weak::upgrade) {
            // Lost a load race; keep the copy others already hold
            return Ok(existing);
        }
        nodes.insert(ino, Arc::downgrade(&node));
        Ok(node)
    }

    /// Allocate an inode and bring up its node
    pub async fn create_node(&self, mode: u32, uid: u32, gid: u32) -> Result<Arc<Node>> {
        let ino = self.ctx.inode_alloc.lock().allocate().map_err(|e| match e {
            BitmapError::Exhausted => Error::NoFreeInodes,
            other => other.into(),
        })?;

        let disk = DiskInode::new(mode, uid, gid, unix_now());
        let mut raw = [0u8; INODE_SIZE];
        if let Err(e) = disk.write_to(&mut Cursor::new(&mut raw[..])) {
            self.drop_inode(ino);
            return Err(e.into());
        }

        let (block, offset) = self.ctx.layout.inode_block(ino);
        match self.ctx.cache.read_block(block).await {
            Ok(guard) => guard.write_at(offset, &raw),
            Err(e) => {
                self.drop_inode(ino);
                return Err(e.into());
            }
        }

        let node = Arc::new(Node::from_disk(ino, Arc::clone(&self.ctx), &disk));
        self.ctx.nodes.lock().insert(ino, Arc::downgrade(&node));
        Ok(node)
    }

    /// Create a regular file in `dir`
    pub async fn create_file(
        &self,
        dir: &Directory,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Node>> {
        self.create_entry(dir, name, mode & !(MODE_DIRECTORY | MODE_FIFO), uid, gid)
            .await
    }

    /// Create a subdirectory in `dir`
    pub async fn mkdir(
        &self,
        dir: &Directory,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Directory>> {
        let node = self
            .create_entry(dir, name, MODE_DIRECTORY | (mode & 0o7777), uid, gid)
            .await?;
        Ok(Arc::new(Directory::new(node)))
    }

    /// Create a named pipe in `dir`
    pub async fn mkfifo(
        &self,
        dir: &Directory,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Pipe>> {
        let node = self
            .create_entry(dir, name, MODE_FIFO | (mode & 0o7777), uid, gid)
            .await?;
        Ok(self.fifo(node.ino(), name))
    }

    /// The pipe buffer behind a FIFO inode, created on first use
    ///
    /// FIFOs carry no data blocks; their bytes live only in this registry,
    /// which persists across open/close cycles until the FIFO is unlinked.
    pub fn fifo(&self, ino: u64, name: &str) -> Arc<Pipe> {
        let mut pipes = self.pipes.lock();
        Arc::clone(
            pipes
                .entry(ino)
                .or_insert_with(|| Pipe::named(name, self.ctx.reaper.clone())),
        )
    }

    /// Remove `name` from `dir`
    ///
    /// A non-empty directory is refused. The target's blocks and inode are
    /// reclaimed immediately when no handles are open, otherwise when the
    /// last handle closes.
    pub async fn unlink(&self, dir: &Directory, name: &str) -> Result<()> {
        let entry = dir.lookup(name).await?.ok_or(Error::NotFound)?;
        let node = self.get_node(entry.inode).await?;

        if node.mode().await & MODE_DIRECTORY != 0 {
            let child = Directory::new(Arc::clone(&node));
            if !child.is_empty().await? {
                return Err(Error::DirectoryNotEmpty);
            }
        }

        dir.remove_entry(name).await?;
        node.adjust_links(-1).await?;

        if node.links().await == 0 {
            self.pipes.lock().remove(&node.ino());
            node.mark_unlinked();
            node.reclaim_if_idle();
        }
        Ok(())
    }

    /// Flush every dirty structure to the device
    pub async fn sync_all(&self) -> Result<()> {
        let nodes: Vec<Arc<Node>> = self
            .ctx
            .nodes
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for node in nodes {
            node.flush_metadata().await?;
        }

        let layout = self.ctx.layout;
        let block_bits = self
            .ctx
            .block_alloc
            .lock()
            .to_blocks(layout.block_bitmap_blocks);
        for (i, block) in block_bits.into_iter().enumerate() {
            self.device
                .write_block(layout.block_bitmap + i as u64, &block)
                .await?;
        }
        let inode_bits = self
            .ctx
            .inode_alloc
            .lock()
            .to_blocks(layout.inode_bitmap_blocks);
        for (i, block) in inode_bits.into_iter().enumerate() {
            self.device
                .write_block(layout.inode_bitmap + i as u64, &block)
                .await?;
        }

        let sb = {
            let mut sb = self.superblock.lock();
            sb.free_blocks = self.ctx.block_alloc.lock().free_count();
            sb.free_inodes = self.ctx.inode_alloc.lock().free_count();
            sb.last_write = unix_now();
            sb.clone()
        };
        write_superblock(&self.device, &sb).await?;

        self.ctx.cache.sync(None, false).await?;
        log::debug!("volume '{}' synced", label_of(&sb));
        Ok(())
    }

    /// Finish pending reclamation, flush everything, and stop the reaper
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.shutdown().await;
        self.sync_all().await
    }

    fn drop_inode(&self, ino: u64) {
        if let Err(e) = self.ctx.inode_alloc.lock().release(ino) {
            log::warn!("inode {} could not be freed: {}", ino, e);
        }
    }

    async fn create_entry(
        &self,
        dir: &Directory,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Node>> {
        if dir.lookup(name).await?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let node = self.create_node(mode, uid, gid).await?;
        let tag = type_tag(mode);

        if let Err(e) = dir.add_entry(name, node.ino(), tag).await {
            // Undo the inode allocation; the node never became reachable
            self.ctx.nodes.lock().remove(&node.ino());
            self.drop_inode(node.ino());
            return Err(e);
        }

        log::debug!("created '{}' as inode {}", name, node.ino());
        Ok(node)
    }
}

fn type_tag(mode: u32) -> u8 {
    if mode & MODE_DIRECTORY != 0 {
        file_type::DIRECTORY
    } else if mode & MODE_FIFO != 0 {
        file_type::FIFO
    } else {
        file_type::REGULAR
    }
}

fn label_of(sb: &Superblock) -> String {
    let end = sb
        .volume_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(sb.volume_name.len());
    String::from_utf8_lossy(&sb.volume_name[..end]).into_owned()
}

async fn write_superblock(device: &Arc<dyn BlockDevice>, sb: &Superblock) -> Result<()> {
    let mut block = vec![0u8; BLOCK_SIZE];
    sb.write_to(&mut Cursor::new(&mut block[..]))?;
    device.write_block(0, &block).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::file::{DirectoryFile, File, FileKind, RegularFile};

    fn device(blocks: u64) -> Arc<dyn BlockDevice> {
        Arc::new(MemBlockDevice::new(blocks))
    }

    #[tokio::test]
    async fn test_format_and_reopen() {
        let dev = device(512);
        let volume = Volume::format(Arc::clone(&dev), Some("scratch")).await.unwrap();
        assert_eq!(volume.label(), "scratch");

        let root = volume.root().await.unwrap();
        let node = volume
            .create_file(&root, "greeting", 0o644, 0, 0)
            .await
            .unwrap();
        node.write(0, b"persisted across mounts").await.unwrap();
        volume.sync_all().await.unwrap();
        drop(volume);

        let volume = Volume::open(dev).await.unwrap();
        assert_eq!(volume.label(), "scratch");

        let root = volume.root().await.unwrap();
        let entry = root.lookup("greeting").await.unwrap().unwrap();
        let node = volume.get_node(entry.inode).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = node.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"persisted across mounts");
    }

    #[tokio::test]
    async fn test_closed_node_metadata_survives_remount() {
        let dev = device(512);
        {
            let volume = Volume::format(Arc::clone(&dev), None).await.unwrap();
            let root = volume.root().await.unwrap();
            let node = volume
                .create_file(&root, "fleeting", 0o644, 0, 0)
                .await
                .unwrap();
            node.write(0, b"written then closed").await.unwrap();

            // Last reference goes away before anything is flushed
            drop(node);
            volume.sync_all().await.unwrap();
        }

        let volume = Volume::open(dev).await.unwrap();
        let root = volume.root().await.unwrap();
        let entry = root.lookup("fleeting").await.unwrap().unwrap();
        let node = volume.get_node(entry.inode).await.unwrap();

        assert_eq!(node.size().await, 19);
        let mut buf = [0u8; 32];
        let n = node.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"written then closed");
    }

    #[tokio::test]
    async fn test_open_rejects_unformatted_device() {
        let dev = device(64);
        assert!(matches!(
            Volume::open(dev).await,
            Err(Error::Format(FormatError::ChecksumMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unlink_reclaims_blocks_and_inode() {
        let dev = device(512);
        let volume = Volume::format(dev, None).await.unwrap();
        let root = volume.root().await.unwrap();

        // Warm up the root directory so its data block is already allocated
        volume.create_file(&root, "warmup", 0o644, 0, 0).await.unwrap();
        volume.unlink(&root, "warmup").await.unwrap();
        volume.quiesce().await;

        let before = volume.stats();
        let node = volume.create_file(&root, "junk", 0o644, 0, 0).await.unwrap();
        node.write(0, &vec![7u8; 5 * BLOCK_SIZE]).await.unwrap();
        let ino = node.ino();
        drop(node);

        volume.unlink(&root, "junk").await.unwrap();
        volume.quiesce().await;

        let after = volume.stats();
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(after.free_inodes, before.free_inodes);
        assert!(matches!(
            volume.get_node(ino).await,
            Err(Error::InvalidInode(_))
        ));
    }

    #[tokio::test]
    async fn test_unlink_with_open_handle_defers_reclaim() {
        let dev = device(512);
        let volume = Volume::format(dev, None).await.unwrap();
        let root = volume.root().await.unwrap();

        let node = volume.create_file(&root, "busy", 0o644, 0, 0).await.unwrap();
        let handle = RegularFile::open("busy", Arc::clone(&node));
        handle.write(0, b"still readable", true).await.unwrap();
        let ino = node.ino();

        volume.unlink(&root, "busy").await.unwrap();
        assert!(root.lookup("busy").await.unwrap().is_none());

        // Open handle keeps the data alive
        let mut buf = [0u8; 32];
        let n = handle.read(0, &mut buf, true).await.unwrap();
        assert_eq!(&buf[..n], b"still readable");
        assert!(volume.context().inode_alloc.lock().is_allocated(ino));

        drop(handle);
        drop(node);
        volume.quiesce().await;
        assert!(!volume.context().inode_alloc.lock().is_allocated(ino));
    }

    #[tokio::test]
    async fn test_unlink_refuses_nonempty_directory() {
        let dev = device(512);
        let volume = Volume::format(dev, None).await.unwrap();
        let root = volume.root().await.unwrap();

        let sub = volume.mkdir(&root, "nest", 0o755, 0, 0).await.unwrap();
        volume.create_file(&sub, "egg", 0o644, 0, 0).await.unwrap();

        assert!(matches!(
            volume.unlink(&root, "nest").await,
            Err(Error::DirectoryNotEmpty)
        ));

        volume.unlink(&sub, "egg").await.unwrap();
        volume.unlink(&root, "nest").await.unwrap();
        assert!(root.lookup("nest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_registry_shares_one_pipe() {
        let dev = device(512);
        let volume = Volume::format(dev, None).await.unwrap();
        let root = volume.root().await.unwrap();

        let pipe = volume.mkfifo(&root, "queue", 0o644, 0, 0).await.unwrap();
        let entry = root.lookup("queue").await.unwrap().unwrap();
        assert_eq!(entry.file_type, file_type::FIFO);

        let again = volume.fifo(entry.inode, "queue");
        assert!(Arc::ptr_eq(&pipe, &again));
    }

    #[tokio::test]
    async fn test_directory_handle_refuses_byte_access() {
        let dev = device(512);
        let volume = Volume::format(dev, None).await.unwrap();
        let root = volume.root().await.unwrap();
        volume.create_file(&root, "inside", 0o644, 0, 0).await.unwrap();

        let handle = DirectoryFile::open("/", Arc::clone(&root));
        assert_eq!(handle.kind(), FileKind::Directory);
        assert!(matches!(
            handle.read(0, &mut [0u8; 8], true).await,
            Err(Error::IsADirectory)
        ));
        assert!(matches!(
            handle.write(0, b"raw", true).await,
            Err(Error::IsADirectory)
        ));

        // Entry access goes through the directory view instead
        assert!(handle.dir().lookup("inside").await.unwrap().unwrap().inode > 1);
    }

    #[tokio::test]
    async fn test_get_node_shares_one_instance() {
        let dev = device(512);
        let volume = Volume::format(dev, None).await.unwrap();
        let root = volume.root().await.unwrap();

        let created = volume.create_file(&root, "one", 0o644, 0, 0).await.unwrap();
        let fetched = volume.get_node(created.ino()).await.unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
    }

    #[tokio::test]
    async fn test_duplicate_create_does_not_leak_inodes() {
        let dev = device(512);
        let volume = Volume::format(dev, None).await.unwrap();
        let root = volume.root().await.unwrap();

        volume.create_file(&root, "taken", 0o644, 0, 0).await.unwrap();
        let free_before = volume.stats().free_inodes;

        assert!(matches!(
            volume.create_file(&root, "taken", 0o644, 0, 0).await,
            Err(Error::AlreadyExists)
        ));
        assert_eq!(volume.stats().free_inodes, free_before);
    }
}
