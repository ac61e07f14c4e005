//! [`ExecutionContext`] backed by a tokio runtime.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::traits::{ExecutionContext, ScheduledTask, Task};
use crate::Result;
use crate::error::Error;

/// Serial execution context: tasks run one at a time, in the order they were posted.
///
/// Delayed tasks are timed on the runtime and join the same queue when they fire,
/// so they never run concurrently with posted tasks.
#[derive(Debug, Clone)]
pub struct TokioContext {
    handle: Handle,
    queue: mpsc::UnboundedSender<Task>,
}

impl TokioContext {
    /// Creates a context on the runtime the caller is running in.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            Error::validation(format!("TokioContext requires a tokio runtime: {e}"))
        })?;
        Ok(Self::with_handle(handle))
    }

    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Task>();

        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });

        Self { handle, queue }
    }
}

impl ExecutionContext for TokioContext {
    fn post(&self, task: Task) {
        if self.queue.send(task).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Execution context worker has stopped, dropping task");
        }
    }

    fn post_delayed(&self, delay: Duration, task: Task) -> ScheduledTask {
        let scheduled = ScheduledTask::new();
        let token = scheduled.token();
        let queue = self.queue.clone();

        self.handle.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = sleep(delay) => {
                    if !token.is_cancelled() {
                        _ = queue.send(task);
                    }
                }
            }
        });

        scheduled
    }
}
