//! File handles
//!
//! Every open object — regular file, directory, pipe endpoint — is reached
//! through the [`File`] trait. Handles own a reference on the underlying
//! object and give it back on drop, which is what drives deferred destruction
//! of unlinked nodes and endpoint-less anonymous pipes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::dir::Directory;
use crate::error::{Error, Result};
use crate::format::{MODE_DIRECTORY, MODE_FIFO};
use crate::node::Node;
use crate::pipe::Pipe;

/// What kind of object a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Fifo,
}

impl FileKind {
    /// Derive the kind from inode mode bits
    pub fn from_mode(mode: u32) -> Self {
        if mode & MODE_DIRECTORY != 0 {
            FileKind::Directory
        } else if mode & MODE_FIFO != 0 {
            FileKind::Fifo
        } else {
            FileKind::Regular
        }
    }
}

/// Common surface of every open object
#[async_trait]
pub trait File: Send + Sync {
    /// Name the handle was opened with
    fn name(&self) -> &str;

    /// Object kind
    fn kind(&self) -> FileKind;

    /// Current size in bytes (0 for pipes)
    async fn size(&self) -> u64;

    /// Read at `offset`; pipes ignore the offset and may block
    async fn read(&self, offset: u64, buf: &mut [u8], can_block: bool) -> Result<usize>;

    /// Write at `offset`; pipes ignore the offset and may block
    async fn write(&self, offset: u64, data: &[u8], can_block: bool) -> Result<usize>;

    /// Wait until the object is ready in the given direction
    ///
    /// Block-backed objects are always ready; pipes are ready per their
    /// buffer state. With a timeout, `false` means it expired.
    async fn select(&self, for_writing: bool, timeout: Option<Duration>) -> bool;

    /// Flush to stable storage; a no-op for objects with no backing blocks
    async fn sync(&self, _offset: Option<u64>, _async_flush: bool) -> Result<()> {
        Ok(())
    }
}

/// Open handle on a regular file
pub struct RegularFile {
    name: String,
    node: Arc<Node>,
}

impl RegularFile {
    /// Open a handle; the node tracks it until the handle drops
    pub fn open(name: &str, node: Arc<Node>) -> Self {
        node.open();
        Self {
            name: name.to_string(),
            node,
        }
    }

    /// Underlying node
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for RegularFile {
    fn drop(&mut self) {
        self.node.release();
    }
}

#[async_trait]
impl File for RegularFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> FileKind {
        FileKind::Regular
    }

    async fn size(&self) -> u64 {
        self.node.size().await
    }

    async fn read(&self, offset: u64, buf: &mut [u8], _can_block: bool) -> Result<usize> {
        self.node.read(offset, buf).await
    }

    async fn write(&self, offset: u64, data: &[u8], _can_block: bool) -> Result<usize> {
        self.node.write(offset, data).await
    }

    async fn select(&self, _for_writing: bool, _timeout: Option<Duration>) -> bool {
        // Block-backed storage never blocks indefinitely
        true
    }

    async fn sync(&self, offset: Option<u64>, async_flush: bool) -> Result<()> {
        self.node.sync(offset, async_flush).await
    }
}

/// Open handle on a directory
///
/// Data access goes through [`DirectoryFile::dir`]; byte-level reads and
/// writes are refused.
pub struct DirectoryFile {
    name: String,
    dir: Arc<Directory>,
}

impl DirectoryFile {
    /// Open a handle on a directory
    pub fn open(name: &str, dir: Arc<Directory>) -> Self {
        dir.node().open();
        Self {
            name: name.to_string(),
            dir,
        }
    }

    /// The directory itself
    pub fn dir(&self) -> &Arc<Directory> {
        &self.dir
    }
}

impl Drop for DirectoryFile {
    fn drop(&mut self) {
        self.dir.node().release();
    }
}

#[async_trait]
impl File for DirectoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> FileKind {
        FileKind::Directory
    }

    async fn size(&self) -> u64 {
        self.dir.node().size().await
    }

    async fn read(&self, _offset: u64, _buf: &mut [u8], _can_block: bool) -> Result<usize> {
        Err(Error::IsADirectory)
    }

    async fn write(&self, _offset: u64, _data: &[u8], _can_block: bool) -> Result<usize> {
        Err(Error::IsADirectory)
    }

    async fn select(&self, _for_writing: bool, _timeout: Option<Duration>) -> bool {
        true
    }

    async fn sync(&self, offset: Option<u64>, async_flush: bool) -> Result<()> {
        self.dir.node().sync(offset, async_flush).await
    }
}

/// One endpoint of a pipe
///
/// Creating the endpoint attaches it to the pipe's reference counts;
/// dropping it detaches, which is what eventually signals EOF or broken
/// pipe to the other side.
pub struct PipeEndpoint {
    pipe: Arc<Pipe>,
    writer: bool,
}

impl PipeEndpoint {
    /// Attach a reader endpoint
    pub fn reader(pipe: Arc<Pipe>) -> Self {
        pipe.increase_ref_count(false);
        Self {
            pipe,
            writer: false,
        }
    }

    /// Attach a writer endpoint
    pub fn writer(pipe: Arc<Pipe>) -> Self {
        pipe.increase_ref_count(true);
        Self { pipe, writer: true }
    }

    /// The pipe this endpoint belongs to
    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    /// True for the writing end
    pub fn is_writer(&self) -> bool {
        self.writer
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        self.pipe.decrease_ref_count(self.writer);
    }
}

#[async_trait]
impl File for PipeEndpoint {
    fn name(&self) -> &str {
        self.pipe.name()
    }

    fn kind(&self) -> FileKind {
        FileKind::Fifo
    }

    async fn size(&self) -> u64 {
        0
    }

    async fn read(&self, _offset: u64, buf: &mut [u8], can_block: bool) -> Result<usize> {
        self.pipe.read(buf, can_block).await
    }

    async fn write(&self, _offset: u64, data: &[u8], can_block: bool) -> Result<usize> {
        self.pipe.write(data, can_block).await
    }

    async fn select(&self, for_writing: bool, timeout: Option<Duration>) -> bool {
        self.pipe.select(for_writing, timeout).await
    }
}
