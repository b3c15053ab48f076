//! On-disk region layout for keelfs volumes

use crate::blockdev::BLOCK_SIZE;
use crate::format::INODE_SIZE;

/// Block numbers of the fixed filesystem regions
///
/// Everything is derived from the block and inode counts, so a `Layout`
/// computed at format time and one computed at mount time always agree.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Block number of the superblock (always 0)
    pub superblock: u64,
    /// First block of the data-block allocation bitmap
    pub block_bitmap: u64,
    /// Blocks occupied by the data-block bitmap
    pub block_bitmap_blocks: u64,
    /// First block of the inode allocation bitmap
    pub inode_bitmap: u64,
    /// Blocks occupied by the inode bitmap
    pub inode_bitmap_blocks: u64,
    /// First block of the inode table
    pub inode_table: u64,
    /// Blocks occupied by the inode table
    pub inode_table_blocks: u64,
    /// First data block
    pub data_start: u64,
    /// Number of data blocks
    pub data_count: u64,
}

impl Layout {
    /// Compute the layout for the given volume geometry
    pub fn new(block_count: u64, inode_count: u64) -> Self {
        let superblock = 0;

        let block_bitmap = 1;
        let block_bitmap_blocks = bitmap_blocks(block_count);

        let inode_bitmap = block_bitmap + block_bitmap_blocks;
        let inode_bitmap_blocks = bitmap_blocks(inode_count);

        let inode_table = inode_bitmap + inode_bitmap_blocks;
        let inodes_per_block = (BLOCK_SIZE / INODE_SIZE) as u64;
        let inode_table_blocks = (inode_count + inodes_per_block - 1) / inodes_per_block;

        let data_start = inode_table + inode_table_blocks;
        let data_count = block_count.saturating_sub(data_start);

        Self {
            superblock,
            block_bitmap,
            block_bitmap_blocks,
            inode_bitmap,
            inode_bitmap_blocks,
            inode_table,
            inode_table_blocks,
            data_start,
            data_count,
        }
    }

    /// Block number and byte offset holding the given inode
    pub fn inode_block(&self, inode_num: u64) -> (u64, usize) {
        let inodes_per_block = (BLOCK_SIZE / INODE_SIZE) as u64;
        let block = self.inode_table + inode_num / inodes_per_block;
        let offset = (inode_num % inodes_per_block) as usize * INODE_SIZE;
        (block, offset)
    }
}

fn bitmap_blocks(units: u64) -> u64 {
    let bytes = (units + 7) / 8;
    (bytes + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_regions_are_contiguous() {
        let layout = Layout::new(4096, 512);

        assert_eq!(layout.superblock, 0);
        assert_eq!(layout.block_bitmap, 1);
        assert_eq!(
            layout.inode_bitmap,
            layout.block_bitmap + layout.block_bitmap_blocks
        );
        assert_eq!(
            layout.inode_table,
            layout.inode_bitmap + layout.inode_bitmap_blocks
        );
        assert_eq!(
            layout.data_start,
            layout.inode_table + layout.inode_table_blocks
        );
        assert_eq!(layout.data_start + layout.data_count, 4096);
    }

    #[test]
    fn test_inode_block_addressing() {
        let layout = Layout::new(4096, 512);
        let per_block = (BLOCK_SIZE / INODE_SIZE) as u64;

        let (b0, o0) = layout.inode_block(0);
        assert_eq!(b0, layout.inode_table);
        assert_eq!(o0, 0);

        let (b1, o1) = layout.inode_block(per_block + 1);
        assert_eq!(b1, layout.inode_table + 1);
        assert_eq!(o1, INODE_SIZE);
    }

    #[test]
    fn test_layout_is_deterministic() {
        let a = Layout::new(8192, 1024);
        let b = Layout::new(8192, 1024);
        assert_eq!(a.data_start, b.data_start);
        assert_eq!(a.data_count, b.data_count);
    }
}
