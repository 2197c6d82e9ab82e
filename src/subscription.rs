//! Callback-style subscriptions on top of broadcast channels.

use tokio::sync::broadcast;
use tracing::warn;

/// Callback handle for unregistering callbacks.
///
/// The callback is unregistered when the handle is dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Run `callback` for every value received on `rx` until the handle drops.
///
/// Lagged receivers skip the missed values and keep going.
pub(crate) fn spawn_callback<T, F>(id: u64, mut rx: broadcast::Receiver<T>, callback: F) -> CallbackHandle
where
    T: Clone + Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(value) => callback(&value),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Callback {} lagged, skipped {} events", id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    CallbackHandle::new(id, move || {
        handle.abort();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_callback_runs_until_dropped() {
        let (tx, _) = broadcast::channel::<u32>(8);
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let handle = spawn_callback(7, tx.subscribe(), move |v| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        });
        assert_eq!(handle.id(), 7);

        tx.send(2).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        handle.unregister();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = tx.send(5);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
