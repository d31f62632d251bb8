//! The host environment's process-creation capability, behind a seam so
//! the lifecycle protocol can be exercised without real OS processes.

use crate::error::{RelKvError, Result};
use crate::identity::WorkerIdentity;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A successfully created worker process.
pub struct Spawned<H> {
    pub pid: u32,
    pub handle: H,
}

/// Capability consumed from the host environment: create a background
/// process bound to one identity, ask it to stop, wait for its exit.
#[async_trait]
pub trait ProcessHost: Send + Sync + 'static {
    /// Opaque process handle, acquired on spawn and released exactly
    /// once, by drop, after confirmed termination. Shared references to
    /// the supervisor cross task boundaries, so the handle must be
    /// `Sync` as well as `Send`.
    type Handle: Send + Sync + 'static;

    /// Create a worker process for `identity`. Refusal (the configured
    /// worker budget is exhausted) is `ResourceExhausted`, not a crash.
    async fn create(&self, identity: WorkerIdentity) -> Result<Spawned<Self::Handle>>;

    /// Cooperative stop request (SIGTERM), never a forced kill.
    async fn signal_stop(&self, handle: &mut Self::Handle);

    /// Forced kill, used only when the grace period expires.
    async fn force_kill(&self, handle: &mut Self::Handle);

    /// Block until the process has exited. Must be safe to call again
    /// after a prior completion.
    async fn wait_exit(&self, handle: &mut Self::Handle) -> Result<()>;
}

/// Handle for a real spawned worker.
pub struct WorkerChild {
    child: Child,
    pid: u32,
    reaped: bool,
}

/// Spawns `relkv worker` child processes with a live-worker budget.
pub struct TokioProcessHost {
    max_workers: usize,
    live: AtomicUsize,
    manager_socket: PathBuf,
}

impl TokioProcessHost {
    pub fn new(max_workers: usize, manager_socket: PathBuf) -> Self {
        Self {
            max_workers,
            live: AtomicUsize::new(0),
            manager_socket,
        }
    }

    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHost for TokioProcessHost {
    type Handle = WorkerChild;

    async fn create(&self, identity: WorkerIdentity) -> Result<Spawned<WorkerChild>> {
        if self.live.load(Ordering::SeqCst) >= self.max_workers {
            return Err(RelKvError::ResourceExhausted {
                limit: self.max_workers,
            });
        }

        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .args([
                "worker",
                "--database-id",
                &identity.database_id.to_string(),
                "--relation-id",
                &identity.relation_id.to_string(),
                "--manager-socket",
                &self.manager_socket.display().to_string(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or(0);
        spawn_output_forwarders(identity, &mut child);
        self.live.fetch_add(1, Ordering::SeqCst);
        info!(%identity, pid, "Spawned worker process");

        Ok(Spawned {
            pid,
            handle: WorkerChild {
                child,
                pid,
                reaped: false,
            },
        })
    }

    async fn signal_stop(&self, handle: &mut WorkerChild) {
        debug!(pid = handle.pid, "Signaling worker to stop");
        unsafe {
            libc::kill(handle.pid as i32, libc::SIGTERM);
        }
    }

    async fn force_kill(&self, handle: &mut WorkerChild) {
        warn!(pid = handle.pid, "Force killing worker");
        if let Err(e) = handle.child.kill().await {
            debug!(pid = handle.pid, error = %e, "Kill failed (already exited?)");
        }
    }

    async fn wait_exit(&self, handle: &mut WorkerChild) -> Result<()> {
        let status = handle.child.wait().await?;
        if !handle.reaped {
            handle.reaped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!(pid = handle.pid, ?status, "Worker exited");
        }
        Ok(())
    }
}

/// Forward a worker's stdout/stderr lines into our own log stream.
fn spawn_output_forwarders(identity: WorkerIdentity, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(worker = %identity, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(worker = %identity, "{line}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The supervisor is moved into a spawned task while borrowing its
    // handles across awaits; every host's handle type must be shareable.
    #[test]
    fn process_handles_are_shareable_across_tasks() {
        fn assert_handle<H: ProcessHost>() {
            fn is_shareable<T: Send + Sync>() {}
            is_shareable::<H::Handle>();
        }
        assert_handle::<TokioProcessHost>();
        assert_handle::<mock::MockHost>();
    }
}
