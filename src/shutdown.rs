//! Graceful shutdown coordination.
//!
//! A watch channel broadcasts the shutdown signal to every running bridge;
//! an atomic counter tracks live streams so the daemon can wait for them
//! to drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use crate::metrics;

/// Shutdown coordinator shared by the listener and all connections.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    signal: watch::Sender<bool>,
    active: AtomicU64,
    drained: Notify,
    next_id: AtomicU64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                signal,
                active: AtomicU64::new(0),
                drained: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Signal shutdown to all streams.
    pub fn shutdown(&self) {
        self.inner.signal.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.signal.borrow()
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.signal.subscribe()
    }

    pub fn active_streams(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Register a stream; the returned guard unregisters it on drop.
    pub fn register_stream(&self) -> StreamGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let count = self.inner.active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_streams(count);

        StreamGuard {
            coordinator: self.clone(),
            id,
        }
    }

    /// Wait until no streams are active.
    pub async fn wait_for_drain(&self) {
        loop {
            // Arm the notification before reading the count so a drop in
            // between is not missed.
            let notified = self.inner.drained.notified();
            if self.inner.active.load(Ordering::Relaxed) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn unregister(&self) {
        let prev = self
            .inner
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        match prev {
            Ok(prev) => {
                metrics::set_active_streams(prev - 1);
                if prev == 1 {
                    self.inner.drained.notify_waiters();
                }
            }
            Err(_) => {
                tracing::error!("Stream unregistered with active count already at 0");
                metrics::set_active_streams(0);
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration of one live stream.
pub struct StreamGuard {
    coordinator: ShutdownCoordinator,
    id: u64,
}

impl StreamGuard {
    /// Connection ID, used for log correlation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_shutdown(&self) -> bool {
        self.coordinator.is_shutdown()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.coordinator.subscribe()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.coordinator.unregister();
    }
}
