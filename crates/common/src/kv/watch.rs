//! Handle to a running watch subscription
//!
//! Each driver runs its long-poll loop on a spawned task. The loop selects on
//! the stop channel alongside every blocking call (network request or retry
//! sleep), so signalling stop abandons whatever is in flight.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A live subscription created by [`KvStore::watch`](super::KvStore::watch)
///
/// Dropping the handle signals the loop to stop without waiting for it;
/// [`WatchHandle::stop`] also waits for the loop to exit.
#[derive(Debug)]
pub struct WatchHandle {
    path: String,
    stop: Option<flume::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Spawn a watch loop, handing it the receiving end of the stop channel
    pub fn spawn<F, Fut>(path: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(flume::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = flume::bounded(1);
        let task = tokio::spawn(run(stop_rx));
        Self {
            path: path.into(),
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// The path this subscription watches
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the watch loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the loop to stop and wait for it to exit
    pub async fn stop(mut self) {
        tracing::debug!(path = %self.path, "stopping watch");
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(path = %self.path, "watch task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        // Disconnecting the sender wakes the loop the same way a stop message does
        self.stop.take();
    }
}

/// Sleep for `backoff` unless stop is signalled first; returns true on stop
pub(crate) async fn backoff_or_stop(stop: &flume::Receiver<()>, backoff: Duration) -> bool {
    tokio::select! {
        _ = stop.recv_async() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

/// Whether stop has been signalled, without waiting
pub(crate) fn stop_requested(stop: &flume::Receiver<()>) -> bool {
    match stop.try_recv() {
        Ok(()) | Err(flume::TryRecvError::Disconnected) => true,
        Err(flume::TryRecvError::Empty) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_waits_for_loop() {
        let (done_tx, done_rx) = flume::unbounded();
        let handle = WatchHandle::spawn("/", move |stop| async move {
            let _ = stop.recv_async().await;
            done_tx.send(()).unwrap();
        });

        assert_eq!(handle.path(), "/");
        handle.stop().await;
        assert!(done_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_drop_signals_stop() {
        let (done_tx, done_rx) = flume::unbounded();
        let handle = WatchHandle::spawn("/", move |stop| async move {
            let _ = stop.recv_async().await;
            done_tx.send(()).unwrap();
        });

        drop(handle);
        assert!(done_rx.recv_async().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_interrupted_by_stop() {
        let (tx, rx) = flume::bounded(1);
        tx.send(()).unwrap();
        assert!(backoff_or_stop(&rx, Duration::from_secs(3600)).await);

        let (_tx, rx) = flume::bounded::<()>(1);
        assert!(!backoff_or_stop(&rx, Duration::from_secs(3)).await);
        assert!(!stop_requested(&rx));
    }
}
