use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};

/// Trait for components that run in the background until shutdown
///
/// Implemented by topic listeners, failure logs and the HTTP server. Each one watches
/// its own cancellation token and returns from `run` when it fires.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&mut self);

    fn name(&self) -> &str;
}

pub struct TasksGroup {
    name: String,
    tasks: Vec<Arc<Mutex<Box<dyn Runnable>>>>,
    handles: Vec<JoinHandle<()>>,
}

impl TasksGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: vec![],
            handles: vec![],
        }
    }

    pub fn add_task(&mut self, task: Box<dyn Runnable>) {
        self.tasks.push(Arc::new(Mutex::new(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn run(&mut self) {
        for task in self.tasks.iter() {
            let task = task.clone();
            let handle = tokio::spawn(async move {
                let mut task = task.lock().await;
                task.run().await;
            });
            self.handles.push(handle);
        }
        tracing::info!("{} running {} tasks", self.name, self.handles.len());
    }

    /// Waits for every task, giving each `handle_timeout` and the group `group_timeout`.
    pub async fn wait_for_shutdown(&mut self, handle_timeout: Duration, group_timeout: Duration) {
        tracing::debug!("{} waiting for shutdown", self.name);
        match timeout(group_timeout, self.shutdown(handle_timeout)).await {
            Ok(()) => {
                tracing::info!("{} shutdown complete", self.name);
            }
            Err(_) => {
                tracing::warn!(
                    "{} shutdown timed out after {:?}, aborting remaining tasks",
                    self.name,
                    group_timeout
                );
                for handle in &self.handles {
                    handle.abort();
                }
            }
        }
    }

    pub async fn shutdown(&mut self, wait_timeout: Duration) {
        for (handle, task) in self.handles.iter_mut().zip(&self.tasks) {
            match timeout(wait_timeout, &mut *handle).await {
                Ok(Ok(())) => {
                    let task = task.lock().await;
                    tracing::debug!("{} shutdown complete", task.name());
                }
                Ok(Err(e)) => {
                    tracing::warn!("failed to wait for shutdown of a task in {}: {}", self.name, e);
                }
                Err(_) => {
                    // the task still holds its lock, so its name is not reachable here
                    tracing::warn!(
                        "task in {} did not stop within {:?}, aborting",
                        self.name,
                        wait_timeout
                    );
                    handle.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Counter {
        runs: Arc<AtomicUsize>,
        cancel: Option<CancellationToken>,
    }

    #[async_trait]
    impl Runnable for Counter {
        async fn run(&mut self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match &self.cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        }

        fn name(&self) -> &str {
            "counter"
        }
    }

    #[tokio::test]
    async fn test_group_runs_and_stops_tasks() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let mut group = TasksGroup::new("test group");
        for _ in 0..3 {
            group.add_task(Box::new(Counter {
                runs: runs.clone(),
                cancel: Some(cancel.clone()),
            }));
        }
        assert_eq!(group.len(), 3);

        group.run();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        cancel.cancel();
        timeout(
            Duration::from_secs(1),
            group.wait_for_shutdown(Duration::from_millis(200), Duration::from_millis(500)),
        )
        .await
        .unwrap();
        assert!(group.handles.iter().all(|h| h.is_finished()));
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let mut group = TasksGroup::new("stuck group");
        group.add_task(Box::new(Counter {
            runs: Arc::new(AtomicUsize::new(0)),
            cancel: None,
        }));
        group.run();

        let start = std::time::Instant::now();
        group
            .wait_for_shutdown(Duration::from_millis(20), Duration::from_secs(1))
            .await;

        assert!(start.elapsed() < Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(group.handles[0].is_finished());
    }
}
