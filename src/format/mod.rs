//! keelfs on-disk format
//!
//! All structures are serialized little-endian with fixed sizes; nothing here
//! touches a device directly.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::blockdev::BLOCK_SIZE;

/// Magic number identifying a keelfs volume
pub const KEELFS_MAGIC: &[u8; 8] = b"KEELFS\x00\x00";
/// Current on-disk format version
pub const FS_VERSION: u32 = 1;

/// On-disk size of a serialized inode
pub const INODE_SIZE: usize = 256;
/// Number of direct block pointers in an inode
pub const DIRECT_POINTERS: usize = 12;
/// Index of the single-indirect root pointer
pub const SINGLE_INDIRECT: usize = 12;
/// Index of the double-indirect root pointer
pub const DOUBLE_INDIRECT: usize = 13;
/// Index of the triple-indirect root pointer
pub const TRIPLE_INDIRECT: usize = 14;
/// Block pointers held by one indirect table block
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 8;

/// File type tags stored in directory entries and inode modes
pub mod file_type {
    /// Regular file
    pub const REGULAR: u8 = 1;
    /// Directory
    pub const DIRECTORY: u8 = 2;
    /// Named pipe
    pub const FIFO: u8 = 3;
    /// Symbolic link
    pub const SYMLINK: u8 = 4;
}

/// Directory bit in the inode mode field
pub const MODE_DIRECTORY: u32 = 0o40000;
/// FIFO bit in the inode mode field
pub const MODE_FIFO: u32 = 0o10000;

/// Error type for on-disk format operations
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),
    #[error("Superblock checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Invalid volume size")]
    InvalidSize,
    #[error("Directory entry name too long: {0} bytes")]
    NameTooLong(usize),
}

/// On-disk inode
///
/// Block pointers hold absolute physical block numbers; 0 means unallocated
/// (block 0 is the superblock, so the sentinel can never collide with data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    /// File mode and type bits
    pub mode: u32,
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Last access time (unix seconds)
    pub atime: u64,
    /// Last modification time
    pub mtime: u64,
    /// Creation time
    pub ctime: u64,
    /// Hard link count
    pub links: u16,
    /// Number of data blocks covering `size`
    pub blocks: u64,
    /// File flags
    pub flags: u32,
    /// 12 direct pointers plus single/double/triple indirect roots
    pub block: [u64; 15],
}

impl DiskInode {
    /// A fresh inode of the given mode, timestamped `now`
    pub fn new(mode: u32, uid: u32, gid: u32, now: u64) -> Self {
        Self {
            mode,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            links: 1,
            blocks: 0,
            flags: 0,
            block: [0; 15],
        }
    }

    /// True if the directory bit is set
    pub fn is_directory(&self) -> bool {
        self.mode & MODE_DIRECTORY != 0
    }

    /// Serialize to exactly `INODE_SIZE` bytes
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buffer = [0u8; INODE_SIZE];
        let mut cursor = Cursor::new(&mut buffer[..]);

        cursor.write_u32::<LittleEndian>(self.mode)?;
        cursor.write_u32::<LittleEndian>(self.uid)?;
        cursor.write_u32::<LittleEndian>(self.gid)?;
        cursor.write_u64::<LittleEndian>(self.size)?;
        cursor.write_u64::<LittleEndian>(self.atime)?;
        cursor.write_u64::<LittleEndian>(self.mtime)?;
        cursor.write_u64::<LittleEndian>(self.ctime)?;
        cursor.write_u16::<LittleEndian>(self.links)?;
        cursor.write_u64::<LittleEndian>(self.blocks)?;
        cursor.write_u32::<LittleEndian>(self.flags)?;
        for &ptr in &self.block {
            cursor.write_u64::<LittleEndian>(ptr)?;
        }

        writer.write_all(&buffer)
    }

    /// Deserialize from an `INODE_SIZE` byte region
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buffer = [0u8; INODE_SIZE];
        reader.read_exact(&mut buffer)?;
        let mut cursor = Cursor::new(&buffer[..]);

        let mode = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let atime = cursor.read_u64::<LittleEndian>()?;
        let mtime = cursor.read_u64::<LittleEndian>()?;
        let ctime = cursor.read_u64::<LittleEndian>()?;
        let links = cursor.read_u16::<LittleEndian>()?;
        let blocks = cursor.read_u64::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let mut block = [0u64; 15];
        for ptr in block.iter_mut() {
            *ptr = cursor.read_u64::<LittleEndian>()?;
        }

        Ok(Self {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            ctime,
            links,
            blocks,
            flags,
            block,
        })
    }
}

/// On-disk directory entry
///
/// Entries are 8-byte aligned; an entry whose inode field is 0 is a hole left
/// behind by a removal and is skipped when scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryDisk {
    /// Target inode number
    pub inode: u64,
    /// Total length of this entry on disk, including padding
    pub rec_len: u16,
    /// Length of the name in bytes
    pub name_len: u8,
    /// File type tag (see [`file_type`])
    pub file_type: u8,
    /// Entry name
    pub name: String,
}

impl DirEntryDisk {
    /// Fixed header size before the name
    pub const HEADER_SIZE: usize = 12;
    /// Longest allowed name
    pub const MAX_NAME: usize = 255;

    /// Build an entry, computing its aligned record length
    pub fn new(inode: u64, name: &str, file_type: u8) -> Result<Self, FormatError> {
        let name_bytes = name.as_bytes();
        if name_bytes.len() > Self::MAX_NAME {
            return Err(FormatError::NameTooLong(name_bytes.len()));
        }

        let raw = Self::HEADER_SIZE + name_bytes.len();
        let rec_len = ((raw + 7) / 8 * 8) as u16;

        Ok(Self {
            inode,
            rec_len,
            name_len: name_bytes.len() as u8,
            file_type,
            name: name.to_string(),
        })
    }

    /// Serialize, padding to `rec_len`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.inode)?;
        writer.write_u16::<LittleEndian>(self.rec_len)?;
        writer.write_u8(self.name_len)?;
        writer.write_u8(self.file_type)?;
        writer.write_all(self.name.as_bytes())?;

        let pad = self.rec_len as usize - Self::HEADER_SIZE - self.name.len();
        if pad > 0 {
            writer.write_all(&vec![0u8; pad])?;
        }
        Ok(())
    }

    /// Deserialize one entry, consuming exactly `rec_len` bytes
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let inode = reader.read_u64::<LittleEndian>()?;
        let rec_len = reader.read_u16::<LittleEndian>()?;
        let name_len = reader.read_u8()?;
        let file_type = reader.read_u8()?;

        if (rec_len as usize) < Self::HEADER_SIZE + name_len as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "directory entry record length too small",
            ));
        }

        let mut name_buf = vec![0u8; name_len as usize];
        reader.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 entry name"))?;

        let pad = rec_len as usize - Self::HEADER_SIZE - name_len as usize;
        if pad > 0 {
            let mut skip = vec![0u8; pad];
            reader.read_exact(&mut skip)?;
        }

        Ok(Self {
            inode,
            rec_len,
            name_len,
            file_type,
            name,
        })
    }
}

/// Volume superblock, stored at block 0
#[derive(Debug, Clone)]
pub struct Superblock {
    /// Magic number (`KEELFS\0\0`)
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Volume size in bytes
    pub size: u64,
    /// Block size in bytes
    pub block_size: u32,
    /// Total blocks
    pub block_count: u64,
    /// Free data blocks
    pub free_blocks: u64,
    /// Total inodes
    pub inode_count: u64,
    /// Free inodes
    pub free_inodes: u64,
    /// Root directory inode number
    pub root_inode: u64,
    /// Last mount timestamp
    pub last_mount: u64,
    /// Last write timestamp
    pub last_write: u64,
    /// Volume UUID
    pub uuid: [u8; 16],
    /// Volume name, NUL padded
    pub volume_name: [u8; 64],
}

/// Root inode number; 0 is reserved as invalid
pub const ROOT_INODE: u64 = 1;

impl Superblock {
    /// Serialized size excluding the trailing checksum
    const BODY_SIZE: usize = 8 + 4 + 8 + 4 + 8 * 7 + 16 + 64;

    /// Create a superblock for a volume of `size` bytes
    pub fn new(size: u64, volume_name: Option<&str>) -> Result<Self, FormatError> {
        let block_count = size / BLOCK_SIZE as u64;
        if block_count < 8 {
            return Err(FormatError::InvalidSize);
        }

        // One inode per 32KB of volume
        let inode_count = (size / (32 * 1024)).max(16);

        let mut uuid = [0u8; 16];
        getrandom::getrandom(&mut uuid)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let mut sb = Self {
            magic: *KEELFS_MAGIC,
            version: FS_VERSION,
            size,
            block_size: BLOCK_SIZE as u32,
            block_count,
            free_blocks: 0,
            inode_count,
            free_inodes: inode_count - 1,
            root_inode: ROOT_INODE,
            last_mount: 0,
            last_write: 0,
            uuid,
            volume_name: [0; 64],
        };

        if let Some(name) = volume_name {
            let bytes = name.as_bytes();
            let len = bytes.len().min(63);
            sb.volume_name[..len].copy_from_slice(&bytes[..len]);
        }

        Ok(sb)
    }

    fn body_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::BODY_SIZE);
        buf.write_all(&self.magic)?;
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        buf.write_u32::<LittleEndian>(self.block_size)?;
        buf.write_u64::<LittleEndian>(self.block_count)?;
        buf.write_u64::<LittleEndian>(self.free_blocks)?;
        buf.write_u64::<LittleEndian>(self.inode_count)?;
        buf.write_u64::<LittleEndian>(self.free_inodes)?;
        buf.write_u64::<LittleEndian>(self.root_inode)?;
        buf.write_u64::<LittleEndian>(self.last_mount)?;
        buf.write_u64::<LittleEndian>(self.last_write)?;
        buf.write_all(&self.uuid)?;
        buf.write_all(&self.volume_name)?;
        Ok(buf)
    }

    /// Serialize with a trailing crc32 checksum over the body
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let body = self.body_bytes()?;
        let checksum = crc32fast::hash(&body);
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(checksum)?;
        Ok(())
    }

    /// Deserialize, validating magic, version, and checksum
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        let mut body = vec![0u8; Self::BODY_SIZE];
        reader.read_exact(&mut body)?;
        let stored = reader.read_u32::<LittleEndian>()?;

        let computed = crc32fast::hash(&body);
        if stored != computed {
            return Err(FormatError::ChecksumMismatch { stored, computed });
        }

        let mut cursor = Cursor::new(&body[..]);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != KEELFS_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FS_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let size = cursor.read_u64::<LittleEndian>()?;
        let block_size = cursor.read_u32::<LittleEndian>()?;
        let block_count = cursor.read_u64::<LittleEndian>()?;
        let free_blocks = cursor.read_u64::<LittleEndian>()?;
        let inode_count = cursor.read_u64::<LittleEndian>()?;
        let free_inodes = cursor.read_u64::<LittleEndian>()?;
        let root_inode = cursor.read_u64::<LittleEndian>()?;
        let last_mount = cursor.read_u64::<LittleEndian>()?;
        let last_write = cursor.read_u64::<LittleEndian>()?;
        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;
        let mut volume_name = [0u8; 64];
        cursor.read_exact(&mut volume_name)?;

        Ok(Self {
            magic,
            version,
            size,
            block_size,
            block_count,
            free_blocks,
            inode_count,
            free_inodes,
            root_inode,
            last_mount,
            last_write,
            uuid,
            volume_name,
        })
    }
}
