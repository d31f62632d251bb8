//! Client for the manager's Unix socket. One connection per request.

use crate::error::{RelKvError, Result};
use crate::identity::WorkerIdentity;
use crate::protocol::{
    error_from_wire, ManagerRequest, ManagerResponse, MessageFrame, WorkerInfo,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct ManagerClient {
    socket_path: PathBuf,
}

impl ManagerClient {
    pub fn new() -> Self {
        Self::with_socket(crate::env::manager_socket_path())
    }

    pub fn with_socket(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    async fn send_request(&self, request: ManagerRequest) -> Result<ManagerResponse> {
        trace!(path = %self.socket_path.display(), "Connecting to manager");

        let mut stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|_| RelKvError::ManagerUnavailable {
                    path: self.socket_path.clone(),
                })?;

        let request_bytes = MessageFrame::encode(&request)?;
        stream.write_all(&request_bytes).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = MessageFrame::read_length(&len_buf);

        let mut response_buf = vec![0u8; len];
        stream.read_exact(&mut response_buf).await?;

        let archived = rkyv::access::<
            crate::protocol::ArchivedManagerResponse,
            rkyv::rancor::Error,
        >(&response_buf)
        .map_err(|e| RelKvError::Frame(e.to_string()))?;
        let response: ManagerResponse = rkyv::deserialize::<_, rkyv::rancor::Error>(archived)
            .map_err(|e| RelKvError::Frame(e.to_string()))?;

        Ok(response)
    }

    pub async fn ping(&self) -> Result<(u64, String)> {
        match self.send_request(ManagerRequest::Ping).await? {
            ManagerResponse::Pong {
                uptime_secs,
                version,
            } => Ok((uptime_secs, version)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Start (or reuse) the worker for `identity`; returns its pid.
    pub async fn open(&self, identity: WorkerIdentity) -> Result<u32> {
        match self.send_request(ManagerRequest::Open { identity }).await? {
            ManagerResponse::Opened { pid } => Ok(pid),
            ManagerResponse::Error { kind, message } => Err(error_from_wire(&kind, &message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Stop the worker for `identity`. The all-relations sentinel stops
    /// every worker in the database.
    pub async fn close(&self, identity: WorkerIdentity) -> Result<()> {
        match self.send_request(ManagerRequest::Close { identity }).await? {
            ManagerResponse::Ok => Ok(()),
            ManagerResponse::Error { kind, message } => Err(error_from_wire(&kind, &message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Sent by a freshly spawned worker once its socket is accepting.
    pub async fn worker_ready(&self, identity: WorkerIdentity, pid: u32) -> Result<()> {
        match self
            .send_request(ManagerRequest::WorkerReady { identity, pid })
            .await?
        {
            ManagerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        match self.send_request(ManagerRequest::ListWorkers).await? {
            ManagerResponse::Workers { list } => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self.send_request(ManagerRequest::Shutdown).await? {
            ManagerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Make sure a manager is reachable, launching one detached if the
    /// socket is dead. Returns true if a new manager was started.
    pub async fn ensure_running(&self) -> Result<bool> {
        if self.is_running().await {
            return Ok(false);
        }

        debug!("Manager not running, starting one");
        let exe = std::env::current_exe()?;
        std::process::Command::new(exe)
            .args(["manager", "run"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.is_running().await {
                return Ok(true);
            }
        }

        Err(RelKvError::ManagerUnavailable {
            path: self.socket_path.clone(),
        })
    }
}

impl Default for ManagerClient {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected(response: &ManagerResponse) -> RelKvError {
    RelKvError::Remote(format!("unexpected manager response: {response:?}"))
}
