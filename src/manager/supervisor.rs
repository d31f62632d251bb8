//! Worker spawn/terminate protocol.
//!
//! Spawn and terminate are symmetric, blocking rendezvous: spawn does
//! not return success until the new worker has signaled readiness, and
//! terminate does not return until the host has confirmed the exit.
//! The manager never services the next request while either is
//! outstanding, which is why the coordination region needs no queue.

use crate::config::ManagerConfig;
use crate::error::{RelKvError, Result};
use crate::identity::WorkerIdentity;
use crate::manager::coord::CoordinationRegion;
use crate::manager::host::{ProcessHost, Spawned};
use crate::manager::registry::{FindOrReserve, WorkerRecord, WorkerRegistry};
use crate::protocol::WorkerInfo;
use crate::shutdown::ShutdownHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct WorkerSupervisor<H: ProcessHost> {
    registry: WorkerRegistry<H::Handle>,
    host: H,
    region: Arc<CoordinationRegion>,
    shutdown: ShutdownHandle,
    stop_grace: Duration,
    ready_timeout: Duration,
}

impl<H: ProcessHost> WorkerSupervisor<H> {
    pub fn new(
        host: H,
        region: Arc<CoordinationRegion>,
        shutdown: ShutdownHandle,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            host,
            region,
            shutdown,
            stop_grace: config.stop_grace(),
            ready_timeout: config.ready_timeout(),
        }
    }

    /// Start the worker for `identity`, or return the existing one.
    ///
    /// A second open for the same identity is idempotent: it returns the
    /// live worker's pid without spawning.
    pub async fn open(&mut self, identity: WorkerIdentity) -> Result<u32> {
        if identity.is_all_relations() {
            return Err(RelKvError::Remote(
                "open requires a concrete relation id".to_string(),
            ));
        }

        match self.registry.find_or_reserve(identity) {
            FindOrReserve::Existing { pid } => {
                debug!(%identity, pid, "Worker already running, reusing");
                Ok(pid)
            }
            FindOrReserve::Reserved => match self.spawn(identity).await {
                Ok(pid) => Ok(pid),
                Err(e) => {
                    self.registry.release(&identity);
                    Err(e)
                }
            },
        }
    }

    async fn spawn(&mut self, identity: WorkerIdentity) -> Result<u32> {
        // Register the spawn before the process exists so its readiness
        // frame cannot be mistaken for anyone else's; leftover permits
        // from an abandoned spawn are discarded here.
        self.region.begin_spawn(identity);

        let Spawned { pid, mut handle } = match self.host.create(identity).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.region.end_spawn();
                return Err(e);
            }
        };

        // Synchronous readiness handshake: do not hand the worker out
        // until it has finished its own initialization. An exit before
        // readiness is a fatal startup error for this spawn.
        let ready = tokio::select! {
            r = self.region.wait_worker_ready(&self.shutdown) => r,
            _ = self.host.wait_exit(&mut handle) => {
                Err(RelKvError::WorkerStartup { identity })
            }
            _ = tokio::time::sleep(self.ready_timeout) => {
                Err(RelKvError::WorkerStartup { identity })
            }
        };
        self.region.end_spawn();

        if let Err(e) = ready {
            warn!(%identity, pid, error = %e, "Worker failed to start");
            self.host.force_kill(&mut handle).await;
            let _ = self.host.wait_exit(&mut handle).await;
            return Err(e);
        }

        self.registry.fill(identity, pid, handle);
        info!(%identity, pid, "Worker ready");
        Ok(pid)
    }

    /// Stop the worker for `identity`. With the all-relations sentinel,
    /// stop every worker in that database. Terminating a nonexistent
    /// worker is a no-op, not an error.
    pub async fn close(&mut self, identity: WorkerIdentity) {
        if identity.is_all_relations() {
            for each in self.registry.identities_in_database(identity.database_id) {
                self.terminate(each).await;
            }
        } else {
            self.terminate(identity).await;
        }
    }

    async fn terminate(&mut self, identity: WorkerIdentity) {
        let Some(record) = self.registry.remove(&identity) else {
            debug!(%identity, "No worker to terminate");
            return;
        };
        self.stop_record(record).await;
    }

    async fn stop_record(&self, record: WorkerRecord<H::Handle>) {
        let WorkerRecord {
            identity,
            pid,
            mut handle,
            ..
        } = record;

        self.host.signal_stop(&mut handle).await;

        match tokio::time::timeout(self.stop_grace, self.host.wait_exit(&mut handle)).await {
            Ok(Ok(())) => info!(%identity, pid, "Worker stopped"),
            Ok(Err(e)) => warn!(%identity, pid, error = %e, "Error waiting for worker exit"),
            Err(_) => {
                warn!(%identity, pid, "Worker did not stop in time, force killing");
                self.host.force_kill(&mut handle).await;
                let _ = self.host.wait_exit(&mut handle).await;
            }
        }
        // handle drops here: the process resource is released exactly once
    }

    /// Terminate every remaining worker (manager shutdown).
    pub async fn shutdown_sweep(&mut self) {
        let records = self.registry.drain();
        if !records.is_empty() {
            info!(count = records.len(), "Stopping all remaining workers");
        }
        for record in records {
            self.stop_record(record).await;
        }
    }

    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.registry.infos()
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub(crate) fn host(&self) -> &H {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::coord::{DispatchOutcome, OP_CLOSE, OP_OPEN};
    use crate::manager::host::mock::MockHost;
    use crate::protocol::WireErrorKind;
    use crate::shutdown::ShutdownCoordinator;

    fn ident(db: u32, rel: u32) -> WorkerIdentity {
        WorkerIdentity::new(db, rel)
    }

    fn supervisor_with_budget(
        budget: usize,
    ) -> (WorkerSupervisor<MockHost>, Arc<CoordinationRegion>) {
        let region = Arc::new(CoordinationRegion::new());
        let coord = ShutdownCoordinator::new();
        let host = MockHost::new(budget, region.clone());
        let supervisor =
            WorkerSupervisor::new(host, region.clone(), coord.handle(), &ManagerConfig::default());
        (supervisor, region)
    }

    #[tokio::test]
    async fn open_close_lifecycle() {
        let (mut supervisor, _region) = supervisor_with_budget(8);

        let pid = supervisor.open(ident(1, 10)).await.unwrap();
        assert_eq!(supervisor.worker_count(), 1);

        // Second open for the same identity reuses, no second spawn.
        let pid2 = supervisor.open(ident(1, 10)).await.unwrap();
        assert_eq!(pid, pid2);
        assert_eq!(supervisor.worker_count(), 1);

        supervisor.close(ident(1, 10)).await;
        assert_eq!(supervisor.worker_count(), 0);
        assert_eq!(supervisor.host().live_workers(), 0);

        // Closing again is a no-op, not an error.
        supervisor.close(ident(1, 10)).await;
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn budget_refusal_leaves_no_entry() {
        let (mut supervisor, _region) = supervisor_with_budget(0);

        let err = supervisor.open(ident(1, 10)).await.unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(supervisor.worker_count(), 0);

        // The failed reservation must not block a later attempt either.
        let err = supervisor.open(ident(1, 10)).await.unwrap_err();
        assert!(err.is_resource_exhausted());
    }

    #[tokio::test]
    async fn early_exit_before_readiness_fails_the_spawn() {
        let (mut supervisor, _region) = supervisor_with_budget(8);
        supervisor.host().fail_next_startup();

        let err = supervisor.open(ident(1, 10)).await.unwrap_err();
        assert!(matches!(err, RelKvError::WorkerStartup { .. }));
        assert_eq!(supervisor.worker_count(), 0);

        // The slot is free again; a healthy retry succeeds.
        supervisor.open(ident(1, 10)).await.unwrap();
        assert_eq!(supervisor.worker_count(), 1);
    }

    #[tokio::test]
    async fn stale_ready_signal_cannot_satisfy_a_later_spawn() {
        let (mut supervisor, region) = supervisor_with_budget(8);

        // A readiness signal with no spawn in flight is discarded, so a
        // worker that dies before initializing must still fail its open
        // instead of riding on the stale signal.
        region.signal_worker_ready(ident(1, 10));
        supervisor.host().fail_next_startup();

        let err = supervisor.open(ident(1, 10)).await.unwrap_err();
        assert!(matches!(err, RelKvError::WorkerStartup { .. }));
        assert_eq!(
            supervisor.worker_count(),
            0,
            "a worker that never initialized must not be registered"
        );

        // A healthy spawn afterwards still works.
        supervisor.open(ident(1, 10)).await.unwrap();
        assert_eq!(supervisor.worker_count(), 1);
    }

    #[tokio::test]
    async fn bulk_close_removes_exactly_one_database() {
        let (mut supervisor, _region) = supervisor_with_budget(8);
        for rel in [1, 2, 3] {
            supervisor.open(ident(5, rel)).await.unwrap();
        }
        supervisor.open(ident(6, 4)).await.unwrap();
        assert_eq!(supervisor.worker_count(), 4);

        supervisor.close(WorkerIdentity::all_relations(5)).await;

        assert_eq!(supervisor.worker_count(), 1);
        let infos = supervisor.infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].identity, ident(6, 4));
    }

    #[tokio::test]
    async fn shutdown_sweep_confirms_every_exit() {
        let (mut supervisor, _region) = supervisor_with_budget(8);
        supervisor.open(ident(1, 1)).await.unwrap();
        supervisor.open(ident(2, 2)).await.unwrap();
        supervisor.open(ident(3, 3)).await.unwrap();

        supervisor.shutdown_sweep().await;

        assert_eq!(supervisor.worker_count(), 0);
        assert_eq!(supervisor.host().live_workers(), 0);
    }

    #[tokio::test]
    async fn concurrent_opens_converge_on_one_worker() {
        // Simulated backends race OPEN requests for the same identity
        // through the region; the dispatch loop serializes them and the
        // registry must end with exactly one record, every caller seeing
        // the same pid.
        let region = Arc::new(CoordinationRegion::new());
        let coord = ShutdownCoordinator::new();
        let shutdown = coord.handle();
        let host = MockHost::new(8, region.clone());
        let mut supervisor = WorkerSupervisor::new(
            host,
            region.clone(),
            shutdown.clone(),
            &ManagerConfig::default(),
        );

        let loop_region = region.clone();
        let loop_shutdown = shutdown.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(req) = loop_region.next_request(&loop_shutdown).await {
                let outcome = match req.op {
                    OP_OPEN => match supervisor.open(req.identity).await {
                        Ok(pid) => DispatchOutcome::Opened { pid },
                        Err(e) => DispatchOutcome::failed(&e),
                    },
                    OP_CLOSE => {
                        supervisor.close(req.identity).await;
                        DispatchOutcome::Closed
                    }
                    _ => unreachable!(),
                };
                loop_region.complete(&req, outcome);
            }
            supervisor.worker_count()
        });

        let mut backends = Vec::new();
        for _ in 0..6 {
            let region = region.clone();
            let shutdown = shutdown.clone();
            backends.push(tokio::spawn(async move {
                match region.submit(OP_OPEN, ident(1, 10), &shutdown).await.unwrap() {
                    DispatchOutcome::Opened { pid } => pid,
                    other => panic!("expected Opened, got {other:?}"),
                }
            }));
        }

        let mut pids = Vec::new();
        for backend in backends {
            pids.push(backend.await.unwrap());
        }
        pids.dedup();
        assert_eq!(pids.len(), 1, "every caller must see the same worker");

        shutdown.shutdown();
        let remaining = dispatch.await.unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn failure_outcome_carries_the_limit() {
        let (mut supervisor, _region) = supervisor_with_budget(0);
        let err = supervisor.open(ident(9, 9)).await.unwrap_err();
        let outcome = DispatchOutcome::failed(&err);
        let DispatchOutcome::Failed { kind, .. } = outcome else {
            panic!("expected failure outcome");
        };
        assert_eq!(kind, WireErrorKind::ResourceExhausted { limit: 0 });
    }
}
