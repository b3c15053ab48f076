//! Whole-volume integration: format, mount, block chains, reclamation

use std::sync::Arc;

use keelfs::blockdev::{BlockDevice, FileBackedBlockDevice, MemBlockDevice, BLOCK_SIZE};
use keelfs::file::{File, RegularFile};
use keelfs::format::{DIRECT_POINTERS, POINTERS_PER_BLOCK};
use keelfs::volume::Volume;
use keelfs::Error;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mem_device(blocks: u64) -> Arc<dyn BlockDevice> {
    Arc::new(MemBlockDevice::new(blocks))
}

#[tokio::test]
async fn data_crosses_every_pointer_tier() {
    init_logging();
    // Enough data blocks to fill the direct and single-indirect tiers densely
    let volume = Volume::format(mem_device(1024), None).await.unwrap();
    let root = volume.root().await.unwrap();
    let node = volume.create_file(&root, "big", 0o644, 0, 0).await.unwrap();

    let n = POINTERS_PER_BLOCK as u64;
    let single_logical = DIRECT_POINTERS as u64 + 5;
    let double_logical = DIRECT_POINTERS as u64 + n + 9;
    let triple_logical = DIRECT_POINTERS as u64 + n + n * n + 13;

    // Dense prefix through the direct tier, then sparse probes further out
    let prefix = vec![0xC3u8; DIRECT_POINTERS * BLOCK_SIZE];
    node.write(0, &prefix).await.unwrap();
    for (tag, logical) in [
        (0xD1u8, single_logical),
        (0xD2u8, double_logical),
        (0xD3u8, triple_logical),
    ] {
        node.write(logical * BLOCK_SIZE as u64, &[tag; 64]).await.unwrap();
    }

    for (tag, logical) in [
        (0xD1u8, single_logical),
        (0xD2u8, double_logical),
        (0xD3u8, triple_logical),
    ] {
        let mut buf = [0u8; 64];
        node.read(logical * BLOCK_SIZE as u64, &mut buf).await.unwrap();
        assert_eq!(buf, [tag; 64], "tier probe at logical block {}", logical);

        // The neighboring block was never written and reads as a hole
        let mut hole = [0xEEu8; 64];
        node.read((logical - 1) * BLOCK_SIZE as u64, &mut hole)
            .await
            .unwrap();
        assert!(hole.iter().all(|&b| b == 0));
    }

    let mut tail = [0u8; 64];
    node.read((DIRECT_POINTERS * BLOCK_SIZE - 64) as u64, &mut tail)
        .await
        .unwrap();
    assert_eq!(tail, [0xC3u8; 64]);
}

#[tokio::test]
async fn extend_then_wipe_leaves_no_residue() {
    init_logging();
    let volume = Volume::format(mem_device(1024), None).await.unwrap();
    let root = volume.root().await.unwrap();
    let node = volume.create_file(&root, "scratch", 0o644, 0, 0).await.unwrap();

    let free_before = volume.stats().free_blocks;

    // Deep enough to need a single-indirect table
    node.extend((DIRECT_POINTERS as u64 + 20) * BLOCK_SIZE as u64)
        .await
        .unwrap();
    assert!(volume.stats().free_blocks < free_before);

    node.wipe().await.unwrap();
    assert_eq!(node.size().await, 0);
    assert_eq!(volume.stats().free_blocks, free_before);

    // Nothing stays pinned, and a sync clears every dirty block
    volume.sync_all().await.unwrap();
    assert_eq!(volume.context().cache.pinned_count(), 0);
    assert_eq!(volume.context().cache.dirty_count(), 0);
}

#[tokio::test]
async fn extend_failure_rolls_back_completely() {
    init_logging();
    // Small volume so exhaustion is cheap to hit
    let volume = Volume::format(mem_device(64), None).await.unwrap();
    let root = volume.root().await.unwrap();
    let node = volume.create_file(&root, "hog", 0o644, 0, 0).await.unwrap();

    node.extend(4 * BLOCK_SIZE as u64).await.unwrap();
    let size_before = node.size().await;
    let free_before = volume.stats().free_blocks;

    let err = node
        .extend(10_000 * BLOCK_SIZE as u64)
        .await
        .expect_err("volume is far too small for this");
    assert!(matches!(err, Error::NoFreeBlocks));

    assert_eq!(node.size().await, size_before);
    assert_eq!(volume.stats().free_blocks, free_before);
}

#[tokio::test]
async fn directory_tree_survives_remount() {
    init_logging();
    let dev = mem_device(1024);
    {
        let volume = Volume::format(Arc::clone(&dev), Some("tree")).await.unwrap();
        let root = volume.root().await.unwrap();

        let docs = volume.mkdir(&root, "docs", 0o755, 0, 0).await.unwrap();
        for i in 0..40 {
            let node = volume
                .create_file(&docs, &format!("doc-{:02}.txt", i), 0o644, 0, 0)
                .await
                .unwrap();
            node.write(0, format!("document {}", i).as_bytes()).await.unwrap();
        }
        volume.unlink(&docs, "doc-13.txt").await.unwrap();
        volume.shutdown().await.unwrap();
    }

    let volume = Volume::open(dev).await.unwrap();
    assert_eq!(volume.label(), "tree");

    let root = volume.root().await.unwrap();
    let entry = root.lookup("docs").await.unwrap().unwrap();
    let docs = keelfs::Directory::new(volume.get_node(entry.inode).await.unwrap());

    assert_eq!(docs.len().await.unwrap(), 39);
    assert!(docs.lookup("doc-13.txt").await.unwrap().is_none());

    let entry = docs.lookup("doc-27.txt").await.unwrap().unwrap();
    let node = volume.get_node(entry.inode).await.unwrap();
    let mut buf = [0u8; 32];
    let n = node.read(0, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"document 27");
}

#[tokio::test]
async fn file_backed_device_roundtrip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.img");

    {
        let device: Arc<dyn BlockDevice> = Arc::new(
            FileBackedBlockDevice::create(&path, 256 * BLOCK_SIZE as u64)
                .await
                .unwrap(),
        );
        let volume = Volume::format(device, Some("on-disk")).await.unwrap();
        let root = volume.root().await.unwrap();
        let node = volume.create_file(&root, "payload", 0o644, 0, 0).await.unwrap();
        node.write(0, b"written through a real file").await.unwrap();
        volume.shutdown().await.unwrap();
    }

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBackedBlockDevice::open(&path, false).await.unwrap());
    let volume = Volume::open(device).await.unwrap();
    let root = volume.root().await.unwrap();
    let entry = root.lookup("payload").await.unwrap().unwrap();

    let handle = RegularFile::open("payload", volume.get_node(entry.inode).await.unwrap());
    let mut buf = [0u8; 64];
    let n = handle.read(0, &mut buf, true).await.unwrap();
    assert_eq!(&buf[..n], b"written through a real file");
}

#[tokio::test]
async fn unreadable_indirect_table_degrades_to_hole_on_read() {
    init_logging();
    let mem = Arc::new(MemBlockDevice::new(1024));
    let device: Arc<dyn BlockDevice> = Arc::clone(&mem) as Arc<dyn BlockDevice>;
    let volume = Volume::format(device, None).await.unwrap();
    let root = volume.root().await.unwrap();
    let node = volume.create_file(&root, "wounded", 0o644, 0, 0).await.unwrap();

    // Land one block in the single-indirect tier, then force its table read
    // to fail on the next cache miss
    let logical = DIRECT_POINTERS as u64 + 2;
    node.write(logical * BLOCK_SIZE as u64, &[0xABu8; 32]).await.unwrap();
    volume.sync_all().await.unwrap();

    // Drop the cached copy of the table by reopening the device fresh
    let volume = Volume::open(Arc::clone(&mem) as Arc<dyn BlockDevice>).await.unwrap();
    let root = volume.root().await.unwrap();
    let entry = root.lookup("wounded").await.unwrap().unwrap();
    let node = volume.get_node(entry.inode).await.unwrap();

    mem.fail_reads_once(1);
    let mut buf = [0xFFu8; 32];
    let n = node.read(logical * BLOCK_SIZE as u64, &mut buf).await.unwrap();
    assert_eq!(n, 32);
    assert!(buf.iter().all(|&b| b == 0), "failed table read must read as a hole");

    // With the fault cleared the data is still there
    let mut buf = [0u8; 32];
    node.read(logical * BLOCK_SIZE as u64, &mut buf).await.unwrap();
    assert_eq!(buf, [0xABu8; 32]);
}
