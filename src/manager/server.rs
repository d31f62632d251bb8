//! The manager process: owns the worker registry for its entire
//! lifetime, services OPEN/CLOSE requests one at a time through the
//! coordination region, and tears every worker down on shutdown.

use crate::config::ManagerConfig;
use crate::error::RelKvError;
use crate::manager::coord::{CoordinationRegion, DispatchOutcome, OP_CLOSE, OP_OPEN};
use crate::manager::host::{ProcessHost, TokioProcessHost};
use crate::manager::supervisor::WorkerSupervisor;
use crate::pidfile::PidFile;
use crate::protocol::{
    ArchivedManagerRequest, ManagerRequest, ManagerResponse, MessageFrame, WorkerInfo,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownHandle};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

pub struct ManagerServer {
    config: ManagerConfig,
}

/// State a connection handler needs; the registry itself stays behind
/// the dispatch loop.
struct ServerShared {
    region: Arc<CoordinationRegion>,
    shutdown: ShutdownHandle,
    status: Arc<RwLock<Vec<WorkerInfo>>>,
    started_at: Instant,
    version: String,
}

impl ManagerServer {
    pub fn new(config: ManagerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let socket_path = self.config.socket_path();
        let max_workers = self.config.max_workers();
        run_with_host(self.config, |_region| {
            TokioProcessHost::new(max_workers, socket_path)
        })
        .await
    }
}

/// Run the manager with a caller-supplied host capability. The host
/// constructor receives the coordination region so test hosts can post
/// the readiness gate themselves.
pub(crate) async fn run_with_host<H, F>(config: ManagerConfig, make_host: F) -> Result<()>
where
    H: ProcessHost,
    F: FnOnce(&Arc<CoordinationRegion>) -> H,
{
    info!("relkv manager starting...");

    let mut pid_file = PidFile::new(config.pid_path());
    if let Some(pid) = pid_file.is_running()? {
        anyhow::bail!("Manager already running with PID {}", pid);
    }
    pid_file.write()?;
    info!("PID file written: {}", config.pid_path().display());

    let socket_path = config.socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&socket_path, perms)?;
    }
    info!("IPC server listening on: {}", socket_path.display());

    let shutdown_coord = ShutdownCoordinator::new();
    let shutdown = shutdown_coord.handle();

    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let handle = shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    handle.shutdown();
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    handle.shutdown();
                }
            }
        });
    }

    let region = Arc::new(CoordinationRegion::new());
    let host = make_host(&region);
    let supervisor = WorkerSupervisor::new(host, region.clone(), shutdown.clone(), &config);
    let status: Arc<RwLock<Vec<WorkerInfo>>> = Arc::new(RwLock::new(Vec::new()));

    let dispatch = tokio::spawn(dispatch_loop(
        region.clone(),
        supervisor,
        shutdown.clone(),
        status.clone(),
    ));

    let shared = Arc::new(ServerShared {
        region,
        shutdown: shutdown.clone(),
        status,
        started_at: Instant::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    info!("relkv manager ready");

    loop {
        tokio::select! {
            conn = listener.accept() => {
                match conn {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(&shared, stream).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.wait() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // The dispatch loop finishes its in-flight operation, then sweeps
    // the registry terminating every worker.
    match dispatch.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Dispatch loop aborted: {}", e),
        Err(e) => error!("Dispatch loop panicked: {}", e),
    }

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    info!("relkv manager stopped");
    Ok(())
}

/// The manager's main loop: block until a request is pending, dispatch
/// it, publish the outcome, repeat. An unrecognized operation code is a
/// protocol violation and aborts the loop; the shutdown sweep runs only
/// on a clean termination signal.
async fn dispatch_loop<H: ProcessHost>(
    region: Arc<CoordinationRegion>,
    mut supervisor: WorkerSupervisor<H>,
    shutdown: ShutdownHandle,
    status: Arc<RwLock<Vec<WorkerInfo>>>,
) -> crate::error::Result<()> {
    while let Some(request) = region.next_request(&shutdown).await {
        trace!(op = request.op, identity = %request.identity, "Dispatching request");

        let outcome = match request.op {
            OP_OPEN => match supervisor.open(request.identity).await {
                Ok(pid) => DispatchOutcome::Opened { pid },
                Err(e) => {
                    warn!(identity = %request.identity, error = %e, "Open failed");
                    DispatchOutcome::failed(&e)
                }
            },
            OP_CLOSE => {
                supervisor.close(request.identity).await;
                DispatchOutcome::Closed
            }
            code => {
                let err = RelKvError::ProtocolViolation { code };
                error!("{err}");
                region.complete(&request, DispatchOutcome::failed(&err));
                shutdown.shutdown();
                return Err(err);
            }
        };

        region.complete(&request, outcome);
        *status.write().await = supervisor.infos();
    }

    supervisor.shutdown_sweep().await;
    status.write().await.clear();
    Ok(())
}

async fn handle_connection(shared: &ServerShared, mut stream: UnixStream) -> Result<()> {
    trace!("New connection accepted");

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf);

    let mut request_buf = vec![0u8; len];
    stream.read_exact(&mut request_buf).await?;

    let archived = rkyv::access::<ArchivedManagerRequest, rkyv::rancor::Error>(&request_buf)
        .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;
    let request: ManagerRequest = rkyv::deserialize::<_, rkyv::rancor::Error>(archived)
        .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

    let response = handle_request(shared, request).await;

    let response_bytes = MessageFrame::encode(&response)?;
    stream.write_all(&response_bytes).await?;
    stream.flush().await?;

    trace!("Response sent");
    Ok(())
}

async fn handle_request(shared: &ServerShared, request: ManagerRequest) -> ManagerResponse {
    match request {
        ManagerRequest::Ping => {
            debug!("Handling: Ping");
            ManagerResponse::Pong {
                uptime_secs: shared.started_at.elapsed().as_secs(),
                version: shared.version.clone(),
            }
        }

        ManagerRequest::Shutdown => {
            info!("Handling: Shutdown");
            shared.shutdown.shutdown();
            ManagerResponse::Ok
        }

        ManagerRequest::Open { identity } => {
            debug!(%identity, "Handling: Open");
            match shared
                .region
                .submit(OP_OPEN, identity, &shared.shutdown)
                .await
            {
                Ok(DispatchOutcome::Opened { pid }) => ManagerResponse::Opened { pid },
                Ok(DispatchOutcome::Failed { kind, message }) => {
                    ManagerResponse::Error { kind, message }
                }
                Ok(DispatchOutcome::Closed) => ManagerResponse::from_error(&RelKvError::Remote(
                    "unexpected outcome for open".to_string(),
                )),
                Err(e) => ManagerResponse::from_error(&e),
            }
        }

        ManagerRequest::Close { identity } => {
            debug!(%identity, "Handling: Close");
            match shared
                .region
                .submit(OP_CLOSE, identity, &shared.shutdown)
                .await
            {
                Ok(DispatchOutcome::Failed { kind, message }) => {
                    ManagerResponse::Error { kind, message }
                }
                Ok(_) => ManagerResponse::Ok,
                Err(e) => ManagerResponse::from_error(&e),
            }
        }

        ManagerRequest::WorkerReady { identity, pid } => {
            debug!(%identity, pid, "Handling: WorkerReady");
            shared.region.signal_worker_ready(identity);
            ManagerResponse::Ok
        }

        ManagerRequest::ListWorkers => {
            debug!("Handling: ListWorkers");
            let list = shared.status.read().await.clone();
            ManagerResponse::Workers { list }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ManagerClient;
    use crate::identity::WorkerIdentity;
    use crate::manager::host::mock::MockHost;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config(name: &str) -> ManagerConfig {
        let dir = std::env::temp_dir().join(format!("relkv-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        ManagerConfig {
            socket_path: Some(dir.join("mgr.sock")),
            pid_path: Some(dir.join("mgr.pid")),
            ..Default::default()
        }
    }

    async fn wait_until_running(client: &ManagerClient) {
        for _ in 0..100 {
            if client.is_running().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("manager did not come up");
    }

    #[tokio::test]
    async fn end_to_end_over_the_socket() {
        let config = test_config("e2e");
        let socket: PathBuf = config.socket_path();

        let server = tokio::spawn(run_with_host(config, |region| {
            MockHost::new(8, region.clone())
        }));

        let client = ManagerClient::with_socket(socket);
        wait_until_running(&client).await;

        let pid = client.open(WorkerIdentity::new(1, 10)).await.unwrap();
        assert!(pid >= 1000);

        // Reopen returns the same worker.
        let pid2 = client.open(WorkerIdentity::new(1, 10)).await.unwrap();
        assert_eq!(pid, pid2);

        let workers = client.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].identity, WorkerIdentity::new(1, 10));

        client.close(WorkerIdentity::new(1, 10)).await.unwrap();
        let workers = client.list_workers().await.unwrap();
        assert!(workers.is_empty());

        // Double close is a no-op.
        client.close(WorkerIdentity::new(1, 10)).await.unwrap();

        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server must stop after shutdown request")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_op_code_aborts_the_dispatch_loop() {
        use crate::manager::supervisor::WorkerSupervisor;
        use crate::shutdown::ShutdownCoordinator;

        let region = Arc::new(CoordinationRegion::new());
        let coord = ShutdownCoordinator::new();
        let shutdown = coord.handle();
        let host = MockHost::new(8, region.clone());
        let supervisor = WorkerSupervisor::new(
            host,
            region.clone(),
            shutdown.clone(),
            &ManagerConfig::default(),
        );
        let status = Arc::new(RwLock::new(Vec::new()));

        let dispatch = tokio::spawn(dispatch_loop(
            region.clone(),
            supervisor,
            shutdown.clone(),
            status,
        ));

        let outcome = region
            .submit(99, WorkerIdentity::new(1, 10), &shutdown)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));

        let result = tokio::time::timeout(Duration::from_secs(5), dispatch)
            .await
            .expect("loop must abort on a protocol violation")
            .unwrap();
        assert!(matches!(
            result,
            Err(RelKvError::ProtocolViolation { code: 99 })
        ));
        assert!(shutdown.is_shutdown(), "a fatal dispatch takes the manager down");
    }

    #[tokio::test]
    async fn budget_exhaustion_reaches_the_client() {
        let config = test_config("budget");
        let socket: PathBuf = config.socket_path();

        let server = tokio::spawn(run_with_host(config, |region| {
            MockHost::new(0, region.clone())
        }));

        let client = ManagerClient::with_socket(socket);
        wait_until_running(&client).await;

        let err = client.open(WorkerIdentity::new(1, 10)).await.unwrap_err();
        assert!(err.is_resource_exhausted());

        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server must stop")
            .unwrap()
            .unwrap();
    }
}
