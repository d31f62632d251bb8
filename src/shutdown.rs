//! Cooperative shutdown coordination.
//!
//! A termination signal must unblock every waiter rather than hang it:
//! the manager's dispatch loop, a backend blocked on "request serviced",
//! and a spawn blocked on "worker ready" all select against a handle's
//! `wait()`. Implemented on a `tokio::sync::watch` channel so late
//! subscribers still observe an already-raised shutdown.

use tokio::sync::watch;

/// Owns the shutdown flag. Create once, hand out handles.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }

    /// Block until shutdown is requested.
    pub async fn wait(&mut self) {
        // Already raised: return immediately.
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle that can both raise and observe shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Raise the shutdown flag, waking every waiter.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block until shutdown is requested. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}
