//! Cancellable background tasks with join-on-stop semantics.
//!
//! Every watcher, emission loop and stream consumer runs as a [`Worker`].
//! `stop()` cancels the task and awaits it, so once it returns the task's
//! callbacks can no longer fire. Stopping twice is a no-op.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A spawned task that can be cancelled and joined.
pub struct Worker<T = ()> {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn `f` on the current runtime, handing it a cancellation token.
    pub fn spawn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        debug!("worker '{name}' starting");
        let handle = tokio::spawn(f(token.clone()));
        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has been started and has not finished yet.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel and join. Returns the task's output the first time only.
    pub async fn stop(&mut self) -> Option<T> {
        self.token.cancel();
        let handle = self.handle.take()?;
        match handle.await {
            Ok(out) => {
                debug!("worker '{}' stopped", self.name);
                Some(out)
            }
            Err(e) => {
                if e.is_panic() {
                    error!("worker '{}' panicked", self.name);
                }
                None
            }
        }
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn stop_joins_and_returns_output() {
        let mut worker = Worker::spawn("counter", |token| async move {
            let mut n = 0u32;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break n,
                    _ = tokio::time::sleep(Duration::from_millis(1)) => n += 1,
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(worker.is_running());
        let out = worker.stop().await;
        assert!(out.is_some());
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut worker = Worker::spawn("noop", |token| async move { token.cancelled().await });
        assert!(worker.stop().await.is_some());
        assert!(worker.stop().await.is_none());
    }

    #[tokio::test]
    async fn no_side_effects_after_stop() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let mut worker = Worker::spawn("ticker", move |token| async move {
            while !token.is_cancelled() {
                h.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        worker.stop().await;
        let after = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), after);
    }
}
