//! Where fire-and-forget work goes.
//!
//! The synchronous tracker methods hand their network future to a [`Spawner`]
//! and return at once. Production code runs it on a tokio runtime; tests
//! queue it and decide when it runs.

use futures::future::BoxFuture;
use std::sync::Mutex;
use tokio::runtime::Handle;

pub trait Spawner: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Runs tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Spawner bound to the runtime of the calling task, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(self.handle.spawn(task));
    }
}

/// Holds tasks until [`ManualSpawner::run_pending`] is awaited.
#[derive(Default)]
pub struct ManualSpawner {
    queue: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run queued tasks in submission order, including any they enqueue.
    /// Returns how many ran.
    pub async fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch: Vec<_> = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *queue)
            };
            if batch.is_empty() {
                return ran;
            }
            for task in batch {
                task.await;
                ran += 1;
            }
        }
    }

    /// Drop queued tasks without polling them, like a runtime shutting down.
    pub fn discard_pending(&self) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

impl Spawner for ManualSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }
}
