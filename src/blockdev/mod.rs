//! Block device backends for keelfs
//!
//! Two backends are provided: a file-backed device for real volumes (also
//! usable against raw block devices on unix) and a memory-backed device for
//! tests and throwaway volumes.

mod blockdev_trait;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

fn check_block(block: u64, count: u64) -> Result<()> {
    if block >= count {
        return Err(BlockDeviceError::OutOfRange(block));
    }
    Ok(())
}

fn check_len(len: usize) -> Result<()> {
    if len != BLOCK_SIZE {
        return Err(BlockDeviceError::BadBufferSize(len));
    }
    Ok(())
}

/// A block device backed by a file (or a raw block device node on unix)
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new device of `size` bytes, truncating any existing file
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(size).await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            block_count: size / BLOCK_SIZE as u64,
            read_only: false,
        })
    }

    /// Open an existing device
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::device_size(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            block_count: size / BLOCK_SIZE as u64,
            read_only,
        })
    }

    /// Path this device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes of a file or block device node
    fn device_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            Self::device_size_unix(path)
        }
        #[cfg(not(unix))]
        {
            Ok(std::fs::metadata(path)?.len())
        }
    }

    #[cfg(unix)]
    fn device_size_unix(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        // BLKGETSIZE64 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let file = std::fs::File::open(path)?;
        let mut size: u64 = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut u64) };
        if rc == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }
        Ok(size)
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block(block, self.block_count)?;
        check_len(buf.len())?;

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::Closed)?;
        file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_block(block, self.block_count)?;
        check_len(data.len())?;

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::Closed)?;
        file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::Closed)?;
        file.sync_all().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if guard.take().is_none() {
            return Err(BlockDeviceError::Closed);
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// An in-memory block device
///
/// Primarily for tests; `fail_reads_once` lets a test simulate a transient
/// storage fault on the next N reads.
pub struct MemBlockDevice {
    blocks: RwLock<Vec<u8>>,
    block_count: u64,
    read_only: bool,
    fail_reads: AtomicU32,
}

impl MemBlockDevice {
    /// Create a zero-filled device with `block_count` blocks
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: RwLock::new(vec![0u8; block_count as usize * BLOCK_SIZE]),
            block_count,
            read_only: false,
            fail_reads: AtomicU32::new(0),
        }
    }

    /// Create a zero-filled device that refuses writes
    pub fn new_read_only(block_count: u64) -> Self {
        Self {
            read_only: true,
            ..Self::new(block_count)
        }
    }

    /// Make the next `n` reads fail with an I/O error
    pub fn fail_reads_once(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    async fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block(block, self.block_count)?;
        check_len(buf.len())?;

        if self.fail_reads.load(Ordering::SeqCst) > 0 {
            self.fail_reads.fetch_sub(1, Ordering::SeqCst);
            return Err(BlockDeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected read fault",
            )));
        }

        let blocks = self.blocks.read();
        let start = block as usize * BLOCK_SIZE;
        buf.copy_from_slice(&blocks[start..start + BLOCK_SIZE]);
        Ok(())
    }

    async fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_block(block, self.block_count)?;
        check_len(data.len())?;

        let mut blocks = self.blocks.write();
        let start = block as usize * BLOCK_SIZE;
        blocks[start..start + BLOCK_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
