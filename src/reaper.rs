//! Deferred destruction for keelfs
//!
//! An object that reaches its terminal state inside one of its own methods
//! cannot tear itself down there: the final teardown needs the object's lock,
//! which the calling task may still hold. Instead the object is handed to the
//! [`ZombieQueue`], whose drain task runs outside every caller's call stack
//! and lock scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// An object awaiting deferred destruction
///
/// By the time an object is enqueued it must be quiesced: no further
/// operations will be issued against it, though its teardown may still take
/// the object's own lock to let in-flight unwinding finish.
#[async_trait]
pub trait Zombie: Send {
    /// Short tag for log lines
    fn describe(&self) -> &str;

    /// Final teardown; consumes the object
    async fn reap(self: Box<Self>);
}

/// Cloneable handle for enqueueing zombies
#[derive(Clone)]
pub struct ReaperHandle {
    tx: mpsc::UnboundedSender<Box<dyn Zombie>>,
    enqueued: Arc<AtomicU64>,
    reaped: Arc<AtomicU64>,
}

impl ReaperHandle {
    /// Queue an object for destruction
    pub fn add(&self, zombie: Box<dyn Zombie>) {
        log::debug!("reaper: queueing {}", zombie.describe());
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(zombie).is_err() {
            // Queue already shut down; the object is dropped here, which is
            // safe only because shutdown implies no lock-holding callers
            // remain.
            log::warn!("reaper: queue is gone, dropping object inline");
        }
    }

    /// Total objects ever enqueued through this queue
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    /// Total objects fully reaped
    pub fn reaped_count(&self) -> u64 {
        self.reaped.load(Ordering::SeqCst)
    }
}

/// Background reaper of quiesced objects
pub struct ZombieQueue {
    handle: ReaperHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ZombieQueue {
    /// Create the queue and spawn its drain task
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn Zombie>>();
        let enqueued = Arc::new(AtomicU64::new(0));
        let reaped = Arc::new(AtomicU64::new(0));

        let reaped_counter = Arc::clone(&reaped);
        let task = tokio::spawn(async move {
            while let Some(zombie) = rx.recv().await {
                log::debug!("reaper: freeing {}", zombie.describe());
                zombie.reap().await;
                reaped_counter.fetch_add(1, Ordering::SeqCst);
            }
            log::debug!("reaper: drain task exiting");
        });

        Self {
            handle: ReaperHandle {
                tx,
                enqueued,
                reaped,
            },
            task: Mutex::new(Some(task)),
        }
    }

    /// Handle for producers
    pub fn handle(&self) -> ReaperHandle {
        self.handle.clone()
    }

    /// Wait until everything enqueued so far has been reaped
    pub async fn quiesce(&self) {
        loop {
            let enqueued = self.handle.enqueued_count();
            let reaped = self.handle.reaped_count();
            if reaped >= enqueued {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Drain outstanding work and stop the task
    ///
    /// Outstanding producer handles keep the channel open; this waits only
    /// for work already queued, then detaches.
    pub async fn shutdown(&self) {
        self.quiesce().await;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Default for ZombieQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestZombie {
        flag: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Zombie for TestZombie {
        fn describe(&self) -> &str {
            "test object"
        }

        async fn reap(self: Box<Self>) {
            self.flag.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_queued_objects_are_reaped() {
        let queue = ZombieQueue::new();
        let handle = queue.handle();
        let flag = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            handle.add(Box::new(TestZombie {
                flag: Arc::clone(&flag),
            }));
        }

        queue.quiesce().await;
        assert_eq!(flag.load(Ordering::SeqCst), 3);
        assert_eq!(handle.enqueued_count(), 3);
        assert_eq!(handle.reaped_count(), 3);
    }

    #[tokio::test]
    async fn test_reaping_happens_off_caller_stack() {
        let queue = ZombieQueue::new();
        let handle = queue.handle();
        let flag = Arc::new(AtomicU64::new(0));

        handle.add(Box::new(TestZombie {
            flag: Arc::clone(&flag),
        }));

        // add() itself never reaps; the drain task does
        assert_eq!(flag.load(Ordering::SeqCst), 0);
        queue.quiesce().await;
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
