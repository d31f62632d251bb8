//! Shared coordination region between backends and the manager loop.
//!
//! The region is a single-slot request mailbox plus three rendezvous
//! gates, the shape of the classic shared-memory-and-semaphores broker:
//! `request_pending` wakes the manager, `request_serviced` releases the
//! waiting backend, `worker_ready` releases a spawn once the new worker
//! has finished its own initialization. The region has no queuing
//! capacity; a sender gate serializes callers so at most one request is
//! in flight at a time. Every blocking wait selects against the shutdown
//! handle so a termination signal unblocks waiters instead of hanging
//! them.
//!
//! Two staleness guards keep the gates honest: outcomes are tagged with
//! the exchange's sequence number so an exchange aborted by shutdown can
//! never hand its result to the next caller, and readiness signals only
//! open the gate when they name the one spawn currently in flight.

use crate::error::{RelKvError, Result};
use crate::identity::WorkerIdentity;
use crate::protocol::WireErrorKind;
use crate::shutdown::ShutdownHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

/// Operation codes stored in the mailbox. Raw codes, not a typed enum:
/// the dispatch loop must treat an unrecognized code as a fatal protocol
/// violation rather than have the type system silently make it
/// unrepresentable.
pub const OP_OPEN: u8 = 1;
pub const OP_CLOSE: u8 = 2;

/// One in-flight request: operation code plus target identity. The
/// sequence number ties the eventual outcome back to this exchange.
#[derive(Debug, Clone, Copy)]
pub struct WorkRequest {
    pub op: u8,
    pub identity: WorkerIdentity,
    seq: u64,
}

/// Result of servicing a request, written into the region's outcome cell
/// before `request_serviced` is posted.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Opened { pid: u32 },
    Closed,
    Failed { kind: WireErrorKind, message: String },
}

impl DispatchOutcome {
    pub fn failed(err: &RelKvError) -> Self {
        let kind = match err {
            RelKvError::ResourceExhausted { limit } => WireErrorKind::ResourceExhausted {
                limit: *limit as u64,
            },
            RelKvError::WorkerStartup { .. } => WireErrorKind::WorkerStartup,
            _ => WireErrorKind::Other,
        };
        DispatchOutcome::Failed {
            kind,
            message: err.to_string(),
        }
    }
}

pub struct CoordinationRegion {
    /// External serialization of senders: the mailbox holds one request.
    sender_gate: tokio::sync::Mutex<()>,
    /// The mailbox itself.
    slot: Mutex<Option<WorkRequest>>,
    /// Outcome cell, filled by the manager before signaling serviced.
    /// Tagged with the request's sequence number so a submit aborted by
    /// shutdown can never hand its outcome to the next exchange.
    outcome: Mutex<Option<(u64, DispatchOutcome)>>,
    /// Identity of the one spawn in flight; readiness signals for any
    /// other identity are discarded.
    pending_spawn: Mutex<Option<WorkerIdentity>>,
    next_seq: AtomicU64,
    request_pending: Semaphore,
    request_serviced: Semaphore,
    worker_ready: Semaphore,
}

impl CoordinationRegion {
    pub fn new() -> Self {
        Self {
            sender_gate: tokio::sync::Mutex::new(()),
            slot: Mutex::new(None),
            outcome: Mutex::new(None),
            pending_spawn: Mutex::new(None),
            next_seq: AtomicU64::new(0),
            request_pending: Semaphore::new(0),
            request_serviced: Semaphore::new(0),
            worker_ready: Semaphore::new(0),
        }
    }

    /// Post a request and block until the manager has serviced it.
    ///
    /// Holds the sender gate for the whole handshake, so concurrent
    /// callers serialize before touching the mailbox.
    pub async fn submit(
        &self,
        op: u8,
        identity: WorkerIdentity,
        shutdown: &ShutdownHandle,
    ) -> Result<DispatchOutcome> {
        let _gate = self.sender_gate.lock().await;

        // An exchange aborted by shutdown may have left a serviced
        // permit and a stale outcome behind; discard both before
        // posting.
        while let Ok(permit) = self.request_serviced.try_acquire() {
            permit.forget();
        }
        self.outcome.lock().expect("outcome lock poisoned").take();

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        *self.slot.lock().expect("mailbox lock poisoned") = Some(WorkRequest { op, identity, seq });
        self.request_pending.add_permits(1);

        self.acquire(&self.request_serviced, shutdown).await?;

        match self.outcome.lock().expect("outcome lock poisoned").take() {
            Some((s, outcome)) if s == seq => Ok(outcome),
            _ => Err(RelKvError::Shutdown),
        }
    }

    /// Manager side: block until a request is pending, or return `None`
    /// when shutdown is raised.
    pub async fn next_request(&self, shutdown: &ShutdownHandle) -> Option<WorkRequest> {
        loop {
            if self.acquire(&self.request_pending, shutdown).await.is_err() {
                return None;
            }
            // A posted permit always pairs with a filled slot; an empty
            // slot here means a spurious wakeup and is skipped.
            let request = self.slot.lock().expect("mailbox lock poisoned").take();
            if let Some(request) = request {
                return Some(request);
            }
        }
    }

    /// Manager side: publish the outcome for `request` and release the
    /// waiting backend.
    pub fn complete(&self, request: &WorkRequest, outcome: DispatchOutcome) {
        *self.outcome.lock().expect("outcome lock poisoned") = Some((request.seq, outcome));
        self.request_serviced.add_permits(1);
    }

    /// Mark `identity` as the one spawn in flight. Any readiness permit
    /// left over from an earlier spawn (a frame that arrived after its
    /// ready-timeout expired) is discarded first.
    pub fn begin_spawn(&self, identity: WorkerIdentity) {
        while let Ok(permit) = self.worker_ready.try_acquire() {
            permit.forget();
        }
        *self.pending_spawn.lock().expect("spawn lock poisoned") = Some(identity);
    }

    /// Clear the in-flight spawn; later readiness frames for it are
    /// discarded.
    pub fn end_spawn(&self) {
        self.pending_spawn.lock().expect("spawn lock poisoned").take();
    }

    /// Posted by the connection handler when a spawned worker reports
    /// that its initialization is complete. Only a frame matching the
    /// spawn in flight opens the gate.
    pub fn signal_worker_ready(&self, identity: WorkerIdentity) {
        let pending = *self.pending_spawn.lock().expect("spawn lock poisoned");
        if pending == Some(identity) {
            self.worker_ready.add_permits(1);
        } else {
            tracing::debug!(%identity, "Discarding readiness signal with no matching spawn");
        }
    }

    /// Spawn side: block until the new worker signals readiness.
    pub async fn wait_worker_ready(&self, shutdown: &ShutdownHandle) -> Result<()> {
        self.acquire(&self.worker_ready, shutdown).await
    }

    // Biased toward the semaphore: a permit posted just before shutdown
    // still reaches its waiter.
    async fn acquire(&self, sem: &Semaphore, shutdown: &ShutdownHandle) -> Result<()> {
        tokio::select! {
            biased;
            permit = sem.acquire() => {
                permit.map_err(|_| RelKvError::Shutdown)?.forget();
                Ok(())
            }
            _ = shutdown.wait() => Err(RelKvError::Shutdown),
        }
    }
}

impl Default for CoordinationRegion {
    fn default() -> Self {
        Self::new()
    }
}
