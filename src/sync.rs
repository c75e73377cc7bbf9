use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, trace};

use crate::error::{NexusError, Result};

/// One-slot blocking handoff between a producer and a waiting consumer
///
/// A producer calling [`Handoff::signal`] waits while the previous signal is
/// still unconsumed; a consumer calling [`Handoff::take`] waits until a
/// signal arrives. The radio event path uses [`Handoff::offer`] instead, which
/// never waits and drops the signal when nobody consumed the last one.
#[derive(Debug)]
pub struct Handoff<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T: Send> Handoff<T> {
    /// Create an empty handoff
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Hand a value over, waiting for the slot to free up
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::ChannelClosed`] if the handoff has been torn down.
    pub async fn signal(&self, value: T) -> Result<()> {
        self.tx
            .send(value)
            .await
            .map_err(|_| NexusError::ChannelClosed(self.name))
    }

    /// Hand a value over without waiting
    ///
    /// Returns `false` if the slot was still full and the value was dropped.
    pub fn offer(&self, value: T) -> bool {
        let accepted = self.tx.try_send(value).is_ok();
        if !accepted {
            debug!(handoff = self.name, "slot full, dropping signal");
        }
        accepted
    }

    /// Wait for the next value
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Timeout`] if `limit` elapses first, or
    /// [`NexusError::ChannelClosed`] if the handoff has been torn down.
    pub async fn take(&self, limit: Option<Duration>) -> Result<T> {
        let mut rx = self.rx.lock().await;
        let received = match limit {
            Some(limit) => timeout(limit, rx.recv())
                .await
                .map_err(|_| NexusError::Timeout {
                    operation: self.name,
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => rx.recv().await,
        };
        received.ok_or(NexusError::ChannelClosed(self.name))
    }

    /// Discard a pending value left over from an earlier session
    pub async fn clear(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {
            trace!(handoff = self.name, "discarded stale signal");
        }
    }
}

/// Keep-alive flag shared between a worker and its owner
#[derive(Debug, Clone)]
pub struct KeepAlive(Arc<AtomicBool>);

impl KeepAlive {
    /// Check if the worker should keep running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a long-lived background task
///
/// Closing (or dropping) the handle clears the keep-alive flag and aborts
/// the task, so teardown does not depend on the worker reaching a check.
#[derive(Debug)]
pub struct Worker {
    name: &'static str,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker on the current runtime
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(KeepAlive) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(body(KeepAlive(alive.clone())));
        debug!(worker = name, "worker started");
        Self { name, alive, task }
    }

    /// Check if the worker is still running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.task.is_finished()
    }

    /// Stop the worker unconditionally
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!(worker = self.name, "worker stopped");
        }
        self.task.abort();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.close();
    }
}
