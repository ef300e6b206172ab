//! Task-group fan-out primitives.
//!
//! Two concurrency shapes exist in this crate and they are kept distinct:
//! barrier fan-out (spawn N, block until all N have reported) used by the
//! remote executor, and incremental fan-out (spawn N, consume outcomes one
//! at a time as tasks complete) used by the provisioner. Both start from the
//! same [`TaskGroup`]; the consumption method picks the shape.

use std::future::Future;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// A set of spawned tasks joined either as a barrier or as a completion
/// stream.
#[derive(Debug)]
pub struct TaskGroup<T> {
    handles: Vec<JoinHandle<T>>,
}

impl<T> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskGroup<T> {
    /// Creates an empty group.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Number of tasks spawned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` when nothing has been spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<T> TaskGroup<T>
where
    T: Send + 'static,
{
    /// Spawns `task` onto the runtime and tracks it in the group.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    /// Barrier join: resolves only after every spawned task has reported.
    ///
    /// Results are returned in spawn order. A task that aborts before
    /// reporting (a panic) is logged and omitted; tasks in this crate report
    /// failures as values, so this path is not part of normal operation.
    pub async fn join_all(self) -> Vec<T> {
        join_all(self.handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(error = %err, "fan-out task aborted before reporting");
                    None
                }
            })
            .collect()
    }

    /// Incremental join: converts the group into a stream that yields each
    /// task's outcome as it completes, in completion order.
    ///
    /// The caller may act on the first outcome while slower siblings are
    /// still in flight. Each task has its own sender; the stream ends once
    /// every task has reported.
    #[must_use]
    pub fn into_stream(self) -> CompletionStream<T> {
        let (tx, rx) = mpsc::channel(self.handles.len().max(1));
        for handle in self.handles {
            let sender = tx.clone();
            tokio::spawn(async move {
                match handle.await {
                    Ok(value) => {
                        sender.send(value).await.ok();
                    }
                    Err(err) => warn!(error = %err, "fan-out task aborted before reporting"),
                }
            });
        }
        CompletionStream { rx }
    }
}

/// Stream of task outcomes delivered in completion order.
#[derive(Debug)]
pub struct CompletionStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> CompletionStream<T> {
    /// Waits for the next task to complete; `None` once all have reported.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}
