//! Staged pipelines of worker threads joined by bounded queues

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{Scope, ScopedJoinHandle};
use std::time::Duration;

/// How often blocked queue operations re-check the cancel flag
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Error joined back from a topology
#[derive(Debug, thiserror::Error)]
pub enum TopologyError<E> {
    #[error(transparent)]
    Worker(E),
    #[error("worker {0} panicked")]
    Panic(String),
}

/// Shared cancellation flag, checked at queue boundaries
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Sending half of a bounded queue
pub struct QueueSender<T> {
    tx: Sender<T>,
    cancel: CancelFlag,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> QueueSender<T> {
        QueueSender {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Blocking put. Returns false when the topology was cancelled or every
    /// receiver is gone; the caller should drain and exit.
    pub fn send(&self, item: T) -> bool {
        let mut item = item;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match self.tx.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Receiving half of a bounded queue
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
    cancel: CancelFlag,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> QueueReceiver<T> {
        QueueReceiver {
            rx: self.rx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Blocking take. Returns None once the queue is drained and every
    /// sender is gone, or when the topology was cancelled.
    pub fn recv(&self) -> Option<T> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// A directed chain of worker stages
///
/// Workers run as scoped threads; stages are joined by bounded queues from
/// [`Topology::queue`], giving backpressure through blocking puts. The first
/// worker that fails (or panics) cancels the topology; peers observe the
/// flag at their next queue operation, drain, and exit cleanly.
/// [`Topology::join`] blocks until every worker has exited and returns the
/// first captured error.
pub struct Topology<'scope, 'env, E> {
    scope: &'scope Scope<'scope, 'env>,
    cancel: CancelFlag,
    handles: Vec<(String, ScopedJoinHandle<'scope, Result<(), E>>)>,
}

/// Cancels the topology when a worker unwinds instead of returning
struct PanicGuard {
    cancel: CancelFlag,
    armed: bool,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cancel.cancel();
        }
    }
}

impl<'scope, 'env, E: Send + 'scope> Topology<'scope, 'env, E> {
    pub fn new(scope: &'scope Scope<'scope, 'env>) -> Topology<'scope, 'env, E> {
        Topology {
            scope,
            cancel: CancelFlag::default(),
            handles: Vec::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// A bounded queue wired to this topology's cancel flag
    pub fn queue<T>(&self, capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
        let (tx, rx) = bounded(capacity);
        (
            QueueSender {
                tx,
                cancel: self.cancel.clone(),
            },
            QueueReceiver {
                rx,
                cancel: self.cancel.clone(),
            },
        )
    }

    /// Spawn a worker stage
    pub fn spawn<F>(&mut self, name: &str, f: F)
    where
        F: FnOnce(&CancelFlag) -> Result<(), E> + Send + 'scope,
    {
        let cancel = self.cancel.clone();
        let handle = self.scope.spawn(move || {
            let mut guard = PanicGuard {
                cancel: cancel.clone(),
                armed: true,
            };
            let result = f(&cancel);
            guard.armed = false;
            if result.is_err() {
                cancel.cancel();
            }
            result
        });
        self.handles.push((name.to_string(), handle));
    }

    /// Wait for every worker; first captured error wins
    pub fn join(self) -> Result<(), TopologyError<E>> {
        let mut first_error = None;
        for (name, handle) in self.handles {
            match handle.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(TopologyError::Worker(e));
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(TopologyError::Panic(name));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
