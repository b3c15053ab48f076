//! End-to-end pipe behavior through the public handle surface

use std::sync::Arc;
use std::time::Duration;

use keelfs::file::{File, PipeEndpoint};
use keelfs::pipe::{Pipe, PIPE_CAPACITY};
use keelfs::reaper::ZombieQueue;
use keelfs::Error;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn concurrent_reader_and_writer_preserve_byte_order() {
    init_logging();
    let queue = ZombieQueue::new();
    let pipe = Pipe::anonymous(queue.handle());

    const TOTAL: usize = 4 * PIPE_CAPACITY;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();

    let writer_pipe = Arc::clone(&pipe);
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        // Push in ragged chunks so reads and writes interleave
        let mut sent = 0;
        for chunk in expected.chunks(7919) {
            sent += writer_pipe.write(chunk, true).await.unwrap();
        }
        writer_pipe.decrease_ref_count(true);
        sent
    });

    let mut received = Vec::with_capacity(TOTAL);
    let mut buf = [0u8; 4096];
    loop {
        let n = pipe.read(&mut buf, true).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(writer.await.unwrap(), TOTAL);
    assert_eq!(received, payload);
}

#[tokio::test]
async fn writer_handle_drop_signals_eof() {
    init_logging();
    let queue = ZombieQueue::new();
    let pipe = Pipe::named("signal", queue.handle());

    let reader = PipeEndpoint::reader(Arc::clone(&pipe));
    {
        let writer = PipeEndpoint::writer(Arc::clone(&pipe));
        writer.write(0, b"last words", true).await.unwrap();
    }

    let mut buf = [0u8; 32];
    let n = reader.read(0, &mut buf, true).await.unwrap();
    assert_eq!(&buf[..n], b"last words");

    // A blocking read after drain must return EOF, not hang
    let eof = tokio::time::timeout(Duration::from_secs(1), reader.read(0, &mut buf, true))
        .await
        .expect("read must not hang at EOF")
        .unwrap();
    assert_eq!(eof, 0);
}

#[tokio::test]
async fn reader_handle_drop_breaks_the_pipe() {
    init_logging();
    let queue = ZombieQueue::new();
    let pipe = Pipe::named("broken", queue.handle());

    let writer = PipeEndpoint::writer(Arc::clone(&pipe));
    let reader = PipeEndpoint::reader(Arc::clone(&pipe));
    writer.write(0, b"fine for now", true).await.unwrap();

    // Park a second writer on a full buffer, then drop the reader: the
    // parked writer must wake with the error instead of hanging.
    let fill = vec![0u8; PIPE_CAPACITY];
    pipe.write(&fill, false).await.unwrap();
    let blocked_pipe = Arc::clone(&pipe);
    let blocked = tokio::spawn(async move { blocked_pipe.write(b"x", true).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    drop(reader);
    assert!(matches!(blocked.await.unwrap(), Err(Error::BrokenPipe)));
    assert!(matches!(
        writer.write(0, b"nobody listening", true).await,
        Err(Error::BrokenPipe)
    ));
}

#[tokio::test]
async fn anonymous_pipe_reaped_once_after_both_handles_close() {
    init_logging();
    let queue = ZombieQueue::new();
    let handle = queue.handle();
    let pipe = Pipe::anonymous(handle.clone());

    // The pipe is born with one reader and one writer reference
    pipe.decrease_ref_count(false);
    pipe.decrease_ref_count(true);

    queue.quiesce().await;
    assert_eq!(handle.enqueued_count(), 1);
    assert_eq!(handle.reaped_count(), 1);
}

#[tokio::test]
async fn select_does_not_report_phantom_readiness() {
    init_logging();
    let queue = ZombieQueue::new();
    let pipe = Pipe::anonymous(queue.handle());

    // Live writer, empty buffer: a read would block, so select must not fire
    for _ in 0..5 {
        assert!(!pipe.select(false, Some(Duration::from_millis(5))).await);
    }

    // Readiness arrives with the bytes, even from another task
    let writer_pipe = Arc::clone(&pipe);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer_pipe.write(b"!", true).await.unwrap();
    });
    assert!(pipe.select(false, Some(Duration::from_secs(2))).await);

    let mut buf = [0u8; 1];
    assert_eq!(pipe.read(&mut buf, true).await.unwrap(), 1);
    assert!(!pipe.select(false, Some(Duration::from_millis(5))).await);
}

#[tokio::test]
async fn many_writers_single_reader_drains_everything() {
    init_logging();
    let queue = ZombieQueue::new();
    let pipe = Pipe::named("fanin", queue.handle());
    let _reader_ref = PipeEndpoint::reader(Arc::clone(&pipe));

    let mut writers = Vec::new();
    for id in 0..8u8 {
        let endpoint = PipeEndpoint::writer(Arc::clone(&pipe));
        writers.push(tokio::spawn(async move {
            for _ in 0..100 {
                endpoint.write(0, &[id; 16], true).await.unwrap();
            }
        }));
    }

    let mut counts = [0usize; 8];
    let mut total = 0;
    while total < 8 * 100 * 16 {
        let mut buf = [0u8; 512];
        let n = pipe.read(&mut buf, true).await.unwrap();
        for &b in &buf[..n] {
            counts[b as usize] += 1;
        }
        total += n;
    }

    for task in writers {
        task.await.unwrap();
    }
    assert!(counts.iter().all(|&c| c == 100 * 16));
}
