//! FIFO task queues for session work.
//!
//! Each executor runs queued futures strictly one at a time, in submission
//! order, on a dedicated driver task. Every session is pinned to one
//! executor, so all of a session's state mutation is serialized without a
//! session-wide lock, and a pool of `W` executors means at most `W` join
//! scripts make progress concurrently, which is the intended admission
//! throttle.
//!
//! A task must never await `submit()` against its own queue; the result
//! cannot arrive until the task itself finishes. Plain `push_task` from
//! inside a task is fine; the new task runs after the current one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct Executor {
    queue: mpsc::UnboundedSender<Task>,
}

#[derive(Debug, thiserror::Error)]
#[error("executor dropped the task before completion")]
pub struct ExecutorClosed;

impl Executor {
    pub fn new() -> Arc<Self> {
        let (queue, mut tasks) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = tasks.recv().await {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    error!("executor task panicked: {}", panic_message(&*panic));
                }
            }
        });
        Arc::new(Self { queue })
    }

    /// Build a pool of `size` independent queues (at least one).
    pub fn pool(size: usize) -> Vec<Arc<Executor>> {
        (0..size.max(1)).map(|_| Executor::new()).collect()
    }

    /// Enqueue a task without waiting for its result.
    pub fn push_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.queue.send(Box::pin(task)).is_err() {
            warn!("executor is gone, dropping task");
        }
    }

    /// Enqueue a task and get a future for its result. The result is lost
    /// (`ExecutorClosed`) if the task panics or the executor shuts down.
    pub fn submit<F, R>(&self, task: F) -> impl Future<Output = Result<R, ExecutorClosed>>
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push_task(async move {
            let _ = tx.send(task.await);
        });
        async move { rx.await.map_err(|_| ExecutorClosed) }
    }

    /// Resolve once every task enqueued before this call has finished.
    pub async fn wait_for_tasks(&self) {
        let _ = self.submit(async {}).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}
