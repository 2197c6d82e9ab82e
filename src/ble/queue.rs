//! Command request queue.
//!
//! The radio accepts one outstanding write at a time. Writes are queued in
//! FIFO order and a single worker dispatches them, waiting after each one for
//! the acknowledgment (or a bounded timeout) before moving to the next.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::ble::transport::{CharacteristicRef, GattLink};

/// Shared slot holding the active link, if any.
pub type LinkSlot = Arc<RwLock<Option<Arc<dyn GattLink>>>>;

/// A pending characteristic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOperation {
    /// Target characteristic.
    pub characteristic: CharacteristicRef,
    /// Bytes to write.
    pub payload: Bytes,
}

/// Single-slot signal released by the write acknowledgment.
#[derive(Debug, Default)]
struct AckGate {
    slot: Mutex<Option<oneshot::Sender<()>>>,
}

impl AckGate {
    /// Hold the gate, returning the receiver resolved on release.
    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock() = Some(tx);
        rx
    }

    /// Drop the gate without signalling.
    fn disarm(&self) {
        self.slot.lock().take();
    }

    /// Release the gate. Returns `false` if it was not held.
    fn release(&self) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    fn is_held(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<VecDeque<QueuedOperation>>,
    wake: Notify,
    gate: AckGate,
    execution: tokio::sync::Mutex<()>,
    link: LinkSlot,
    ack_timeout: Duration,
}

/// FIFO of writes paced by acknowledgments.
pub struct CommandQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Create a queue dispatching to whatever link is in `link`.
    pub fn new(link: LinkSlot, ack_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                gate: AckGate::default(),
                execution: tokio::sync::Mutex::new(()),
                link,
                ack_timeout,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker. Does nothing if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let shared = self.shared.clone();
        *worker = Some(tokio::spawn(async move {
            debug!("Command queue worker started");
            loop {
                let op = shared.next().await;
                shared.execute(op).await;
            }
        }));
    }

    /// Stop the worker. Pending operations stay queued.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
            debug!("Command queue worker stopped");
        }
    }

    /// Append a write. Never blocks.
    pub fn enqueue_write(&self, characteristic: CharacteristicRef, payload: impl Into<Bytes>) {
        let op = QueuedOperation {
            characteristic,
            payload: payload.into(),
        };
        trace!("Enqueued {} byte write to {}", op.payload.len(), op.characteristic.uuid);
        self.shared.pending.lock().push_back(op);
        self.shared.wake.notify_one();
    }

    /// Drop every pending write and release the gate if it is held.
    pub fn clear(&self) {
        let dropped = {
            let mut pending = self.shared.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };

        let released = self.shared.gate.release();
        if dropped > 0 || released {
            debug!(
                "Cleared command queue ({} pending dropped, gate released: {})",
                dropped, released
            );
        }
    }

    /// Signal that the outstanding write was acknowledged.
    ///
    /// Ignored when no write is outstanding.
    pub fn on_write_complete(&self) {
        if !self.shared.gate.release() {
            trace!("Write acknowledgment with no outstanding write, ignoring");
        }
    }

    /// Number of writes waiting for dispatch.
    pub fn len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Check if no write is waiting for dispatch.
    pub fn is_empty(&self) -> bool {
        self.shared.pending.lock().is_empty()
    }

    /// Check if a dispatched write is waiting for its acknowledgment.
    pub fn is_awaiting_ack(&self) -> bool {
        self.shared.gate.is_held()
    }
}

impl Shared {
    async fn next(&self) -> QueuedOperation {
        loop {
            if let Some(op) = self.pending.lock().pop_front() {
                return op;
            }
            self.wake.notified().await;
        }
    }

    async fn execute(&self, op: QueuedOperation) {
        let _guard = self.execution.lock().await;

        let link = self.link.read().clone();
        let Some(link) = link else {
            warn!(
                "No active link, dropping write to {}",
                op.characteristic.uuid
            );
            return;
        };

        // Armed before dispatch so an early acknowledgment is not lost
        let ack = self.gate.arm();

        // A refused write still holds the gate for the full timeout
        if let Err(e) = link.write(&op.characteristic, &op.payload).await {
            warn!("Write to {} failed: {}", op.characteristic.uuid, e);
        }

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(_) => trace!("Write to {} acknowledged", op.characteristic.uuid),
            Err(_) => {
                self.gate.disarm();
                warn!(
                    "Write to {} not acknowledged within {:?}, presumed lost",
                    op.characteristic.uuid, self.ack_timeout
                );
            }
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
