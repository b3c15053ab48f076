//! keelfs: an async filesystem core
//!
//! The crate is organized in layers:
//!
//! - [`blockdev`]: the [`BlockDevice`](blockdev::BlockDevice) trait plus
//!   file- and memory-backed implementations
//! - [`cache`]: a pinning LRU block cache; dirty blocks are flushed before
//!   eviction and pinned blocks are never evicted
//! - [`format`] and [`layout`]: the on-disk structures and where they live
//! - [`node`]: inodes with direct, single, double, and triple indirect block
//!   chains; holes read as zeroes
//! - [`dir`]: packed directory records with lazy scanning and hole reuse
//! - [`pipe`]: blocking byte rings for anonymous pipes and FIFOs
//! - [`file`]: the [`File`](file::File) trait uniting files, directories,
//!   and pipe endpoints behind one handle surface
//! - [`reaper`]: deferred destruction for objects whose teardown must run
//!   off the releasing caller's stack
//! - [`volume`]: format, mount, and namespace operations
//!
//! ```no_run
//! use std::sync::Arc;
//! use keelfs::blockdev::MemBlockDevice;
//! use keelfs::volume::Volume;
//!
//! # async fn demo() -> keelfs::Result<()> {
//! let device = Arc::new(MemBlockDevice::new(1024));
//! let volume = Volume::format(device, Some("scratch")).await?;
//!
//! let root = volume.root().await?;
//! let node = volume.create_file(&root, "notes.txt", 0o644, 0, 0).await?;
//! node.write(0, b"hello").await?;
//! volume.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod block_bitmap;
pub mod blockdev;
pub mod cache;
pub mod dir;
pub mod error;
pub mod file;
pub mod format;
pub mod layout;
pub mod node;
pub mod pipe;
pub mod reaper;
pub mod volume;

pub use blockdev::{BlockDevice, BLOCK_SIZE};
pub use cache::{BlockCache, PinnedBlock};
pub use dir::Directory;
pub use error::{Error, Result};
pub use file::{DirectoryFile, File, FileKind, PipeEndpoint, RegularFile};
pub use node::Node;
pub use pipe::{Pipe, PipeBuffer, PIPE_CAPACITY};
pub use reaper::{ReaperHandle, Zombie, ZombieQueue};
pub use volume::Volume;
