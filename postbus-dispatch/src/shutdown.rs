//! Cancellation for blocking queue operations.
//!
//! A [`ShutdownHandle`] owns the sending side of a channel that never carries a message. Every
//! [`ShutdownSignal`] holds a receiver of that channel. Shutting down drops the sender, which
//! disconnects the channel and wakes every thread blocked on a signal at once. Blocking queue
//! operations select over the queue and the signal, so they return as soon as either is ready.

use std::fmt;

use parking_lot::Mutex;

/// Creates a connected pair of [`ShutdownHandle`] and [`ShutdownSignal`].
pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = flume::bounded(0);
    let handle = ShutdownHandle {
        tx: Mutex::new(Some(tx)),
        rx: rx.clone(),
    };
    let signal = ShutdownSignal { rx, _keep: None };
    (handle, signal)
}

/// The triggering side of a shutdown.
pub struct ShutdownHandle {
    tx: Mutex<Option<flume::Sender<()>>>,
    rx: flume::Receiver<()>,
}

impl ShutdownHandle {
    /// Signals shutdown to all [`ShutdownSignal`]s created from this handle.
    ///
    /// Returns `true` only for the call that triggered the shutdown. Further calls have no
    /// effect and return `false`.
    pub fn shutdown(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Returns a new signal observing this handle.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.rx.clone(),
            _keep: None,
        }
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

/// The observing side of a shutdown, passed to every blocking operation that may be cancelled.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: flume::Receiver<()>,
    // Keeps the channel connected for signals that must never fire.
    _keep: Option<flume::Sender<()>>,
}

impl ShutdownSignal {
    /// Returns a signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = flume::bounded(0);
        Self { rx, _keep: Some(tx) }
    }

    /// Returns `true` if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        self.rx.is_disconnected()
    }

    pub(crate) fn receiver(&self) -> &flume::Receiver<()> {
        &self.rx
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}
