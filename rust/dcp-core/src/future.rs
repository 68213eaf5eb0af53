// rust/dcp-core/src/future.rs

//! Completion handles for per-rank data phases.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::{CheckpointError, Result};

/// Outcome of a data phase that is running on the tokio runtime.
///
/// Returned by `write_data` and `read_data` without blocking the caller. The
/// handle resolves to the task's result, or to an error if the task was
/// dropped before it produced one.
#[must_use = "a pending data phase must be awaited to learn whether it failed"]
pub struct PendingIo<T> {
    rx: oneshot::Receiver<Result<T>>,
    label: String,
}

impl<T: Send + 'static> PendingIo<T> {
    /// Spawns `task` on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when called outside a tokio runtime.
    pub fn spawn<F>(label: impl Into<String>, task: F) -> Result<Self>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let label = label.into();
        let handle = Handle::try_current().map_err(|_| {
            CheckpointError::invalid_state(
                &label,
                "outside a tokio runtime",
                "data phases run on the tokio runtime",
            )
        })?;

        let (tx, rx) = oneshot::channel();
        handle.spawn(async move {
            // The receiver may already be gone; the result is then unobserved.
            let _ = tx.send(task.await);
        });
        Ok(Self { rx, label })
    }
}

impl<T> PendingIo<T> {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> Future for PendingIo<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CheckpointError::checkpoint(format!(
                "{} was dropped before completing",
                this.label
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Waits for every rank's data phase, then reports the first failure.
///
/// All handles are driven to completion even when one fails early, so no
/// rank is still writing when the caller decides what to do next.
pub async fn join_ranks<T, I, F>(pending: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    let results = join_all(pending).await;

    let mut values = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                tracing::warn!(rank, error = %e, "rank data phase failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}
