//! Directory layer
//!
//! A [`Directory`] wraps a [`Node`] whose data blocks hold packed
//! [`DirEntryDisk`] records. Records are 8-byte aligned and never straddle a
//! block boundary; a record whose inode field is 0 is a hole left by a
//! removal, and a record length of 0 marks the unused tail of a block.
//!
//! The entry map is built lazily on first access and kept in step with every
//! mutation, so a directory is scanned from disk at most once per mount.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::DirEntryDisk;
use crate::node::Node;

/// One live directory entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Target inode number
    pub inode: u64,
    /// File type tag (see [`crate::format::file_type`])
    pub file_type: u8,
    /// Byte offset of the record inside the directory file
    offset: u64,
    /// Record length on disk
    rec_len: u16,
}

/// A reusable slot left behind by a removed entry
#[derive(Debug, Clone, Copy)]
struct Hole {
    offset: u64,
    rec_len: u16,
}

#[derive(Default)]
struct DirState {
    cached: bool,
    entries: HashMap<String, DirEntry>,
    holes: Vec<Hole>,
    /// Offset just past the last record on disk
    end: u64,
}

/// Directory view over a node
pub struct Directory {
    node: Arc<Node>,
    state: Mutex<DirState>,
}

impl Directory {
    /// Wrap a directory node
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            state: Mutex::new(DirState::default()),
        }
    }

    /// Underlying node
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Look up an entry by name
    pub async fn lookup(&self, name: &str) -> Result<Option<DirEntry>> {
        let mut state = self.state.lock().await;
        self.ensure_cached(&mut state).await?;
        Ok(state.entries.get(name).cloned())
    }

    /// All live entries, in name order
    pub async fn entries(&self) -> Result<Vec<DirEntry>> {
        let mut state = self.state.lock().await;
        self.ensure_cached(&mut state).await?;
        let mut out: Vec<DirEntry> = state.entries.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Number of live entries
    pub async fn len(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.ensure_cached(&mut state).await?;
        Ok(state.entries.len())
    }

    /// True if the directory holds no entries
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Add an entry
    ///
    /// A duplicate name fails with [`Error::AlreadyExists`] before anything
    /// is written. Removal holes are reused when the new record fits;
    /// otherwise the record is appended, skipping to the next block when it
    /// would straddle a boundary.
    pub async fn add_entry(&self, name: &str, inode: u64, file_type: u8) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_cached(&mut state).await?;

        if state.entries.contains_key(name) {
            return Err(Error::AlreadyExists);
        }

        let mut record = DirEntryDisk::new(inode, name, file_type)?;

        // First fit among the holes
        let reuse = state
            .holes
            .iter()
            .position(|h| h.rec_len >= record.rec_len);

        let (offset, new_end) = match reuse {
            Some(idx) => {
                let hole = state.holes[idx];
                // Keep the slot's full length so the record chain stays intact
                record.rec_len = hole.rec_len;
                (hole.offset, None)
            }
            None => {
                let mut end = state.end;
                let within = end % BLOCK_SIZE as u64;
                if within + record.rec_len as u64 > BLOCK_SIZE as u64 {
                    end += BLOCK_SIZE as u64 - within;
                }
                (end, Some(end + record.rec_len as u64))
            }
        };

        let mut bytes = Vec::with_capacity(record.rec_len as usize);
        record.write_to(&mut bytes)?;
        self.node.write(offset, &bytes).await?;

        // The cached layout changes only once the record is on disk, so a
        // failed write leaves holes and the end offset exactly as they were
        if let Some(idx) = reuse {
            state.holes.swap_remove(idx);
        }
        if let Some(end) = new_end {
            state.end = end;
        }

        state.entries.insert(
            name.to_string(),
            DirEntry {
                name: name.to_string(),
                inode,
                file_type,
                offset,
                rec_len: record.rec_len,
            },
        );

        log::trace!(
            "dir {}: added '{}' -> inode {}",
            self.node.ino(),
            name,
            inode
        );
        Ok(())
    }

    /// Remove an entry by name, returning its inode number
    ///
    /// The record's inode field is zeroed on disk, turning the slot into a
    /// hole; the record chain is untouched. What happens to the target node
    /// is the caller's business.
    pub async fn remove_entry(&self, name: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.ensure_cached(&mut state).await?;

        let entry = state.entries.remove(name).ok_or(Error::NotFound)?;

        self.node.write(entry.offset, &0u64.to_le_bytes()).await?;
        state.holes.push(Hole {
            offset: entry.offset,
            rec_len: entry.rec_len,
        });

        log::trace!(
            "dir {}: removed '{}' (inode {})",
            self.node.ino(),
            name,
            entry.inode
        );
        Ok(entry.inode)
    }

    /// Drop the cached entry map; the next access rescans the disk
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        *state = DirState::default();
    }

    /// Scan the directory file into the entry map
    async fn ensure_cached(&self, state: &mut DirState) -> Result<()> {
        if state.cached {
            return Ok(());
        }

        let size = self.node.size().await;
        let block_count = (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;

        let mut entries = HashMap::new();
        let mut holes = Vec::new();
        let mut end = 0u64;

        let mut block = vec![0u8; BLOCK_SIZE];
        for index in 0..block_count {
            let base = index * BLOCK_SIZE as u64;
            let len = self.node.read(base, &mut block).await?;

            let mut pos = 0usize;
            while pos + DirEntryDisk::HEADER_SIZE <= len {
                let rec_len =
                    u16::from_le_bytes([block[pos + 8], block[pos + 9]]) as usize;
                if rec_len == 0 {
                    // Unused tail of this block
                    break;
                }
                if rec_len % 8 != 0 || pos + rec_len > len {
                    log::warn!(
                        "dir {}: corrupt record at offset {}, skipping rest of block",
                        self.node.ino(),
                        base + pos as u64
                    );
                    break;
                }

                let record = DirEntryDisk::read_from(&mut Cursor::new(&block[pos..pos + rec_len]))?;
                let offset = base + pos as u64;

                if record.inode == 0 {
                    holes.push(Hole {
                        offset,
                        rec_len: record.rec_len,
                    });
                } else {
                    entries.insert(
                        record.name.clone(),
                        DirEntry {
                            name: record.name,
                            inode: record.inode,
                            file_type: record.file_type,
                            offset,
                            rec_len: record.rec_len,
                        },
                    );
                }

                end = offset + rec_len as u64;
                pos += rec_len;
            }
        }

        log::debug!(
            "dir {}: cached {} entries ({} holes)",
            self.node.ino(),
            entries.len(),
            holes.len()
        );

        state.entries = entries;
        state.holes = holes;
        state.end = end;
        state.cached = true;
        Ok(())
    }
}
