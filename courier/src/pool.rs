/// Runner pool: a fixed set of runners handed out one at a time.
///
/// The pool is the backpressure point of a delivery service. `acquire` waits until a
/// runner is idle, so no more than `capacity` tasks execute at once. A checked-out
/// runner is wrapped in a `PooledRunner` guard that puts it back when dropped, on
/// every exit path including a panic in the task that holds it.
use crate::runner::{Runner, RunnerBuilder};
use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::{Mutex, mpsc};

pub struct RunnerPool {
    capacity: usize,
    idle_tx: mpsc::Sender<Box<dyn Runner>>,
    idle_rx: Mutex<mpsc::Receiver<Box<dyn Runner>>>,
    in_use: Arc<AtomicUsize>,
}

impl RunnerPool {
    /// Creates `capacity` runners up front. A capacity of 0 is raised to 1.
    pub fn build(capacity: usize, builder: &dyn RunnerBuilder) -> Self {
        let capacity = capacity.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(capacity);

        for _ in 0..capacity {
            // the channel has exactly `capacity` slots, so seeding cannot fail
            let _ = idle_tx.try_send(builder.create_runner());
        }

        Self {
            capacity,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for an idle runner.
    pub async fn acquire(&self) -> PooledRunner {
        let runner = {
            let mut idle = self.idle_rx.lock().await;
            // the pool keeps a sender alive, so the channel is never closed here
            idle.recv().await
        };
        let runner = runner.expect("runner pool channel closed while the pool is alive");
        self.in_use.fetch_add(1, Ordering::SeqCst);

        PooledRunner {
            runner: Some(runner),
            idle_tx: self.idle_tx.clone(),
            in_use: self.in_use.clone(),
        }
    }

    /// Returns a runner to the idle set. Equivalent to dropping the guard.
    pub fn release(&self, runner: PooledRunner) {
        drop(runner);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of runners currently checked out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// A runner checked out of a `RunnerPool`.
pub struct PooledRunner {
    runner: Option<Box<dyn Runner>>,
    idle_tx: mpsc::Sender<Box<dyn Runner>>,
    in_use: Arc<AtomicUsize>,
}

impl Deref for PooledRunner {
    type Target = dyn Runner;

    fn deref(&self) -> &Self::Target {
        // only taken in drop
        self.runner.as_deref().expect("pooled runner used after release")
    }
}

impl Drop for PooledRunner {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            self.in_use.fetch_sub(1, Ordering::SeqCst);
            // at most `capacity` runners exist, so there is always a free slot
            if self.idle_tx.try_send(runner).is_err() {
                tracing::warn!("runner pool is gone, dropping runner");
            }
        }
    }
}
