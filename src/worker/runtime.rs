//! The worker process: one relation, one socket, one store.
//!
//! Startup order matters: bind the socket first, then report readiness
//! to the manager. The manager does not hand this worker out to any
//! backend until the readiness frame arrives, so a backend can never
//! race the bind.

use crate::client::ManagerClient;
use crate::error::RelKvError;
use crate::identity::WorkerIdentity;
use crate::protocol::{ArchivedWorkerRequest, MessageFrame, WorkerRequest, WorkerResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::worker::store::RelationStore;
use anyhow::Result;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, trace};

pub async fn run(identity: WorkerIdentity, manager_socket: PathBuf) -> Result<()> {
    info!(%identity, "relkv worker starting...");

    let socket_path = crate::env::worker_socket_path(identity);
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
    info!(%identity, path = %socket_path.display(), "Worker listening");

    let shutdown_coord = ShutdownCoordinator::new();
    let shutdown = shutdown_coord.handle();

    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let handle = shutdown.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            info!("Received SIGTERM");
            handle.shutdown();
        });
    }

    // Release the manager's spawn handshake.
    let manager = ManagerClient::with_socket(manager_socket);
    manager
        .worker_ready(identity, std::process::id())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to report readiness: {e}"))?;

    serve(&listener, shutdown.clone()).await;

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    info!(%identity, "relkv worker stopped");
    Ok(())
}

/// Accept loop. Connections are served one at a time: the store is a
/// single-owner structure and backends expect operations on one worker
/// to be ordered.
async fn serve(listener: &UnixListener, shutdown: crate::shutdown::ShutdownHandle) {
    let mut store = RelationStore::new();

    loop {
        tokio::select! {
            conn = listener.accept() => {
                match conn {
                    Ok((stream, _)) => {
                        if let Err(e) = handle_connection(&mut store, stream).await {
                            error!("Connection handler error: {}", e);
                        }
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
}

async fn handle_connection(store: &mut RelationStore, mut stream: UnixStream) -> Result<()> {
    trace!("New connection accepted");

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf);

    let mut request_buf = vec![0u8; len];
    stream.read_exact(&mut request_buf).await?;

    let archived = rkyv::access::<ArchivedWorkerRequest, rkyv::rancor::Error>(&request_buf)
        .map_err(|e| RelKvError::Frame(e.to_string()))?;
    let request: WorkerRequest = rkyv::deserialize::<_, rkyv::rancor::Error>(archived)
        .map_err(|e| RelKvError::Frame(e.to_string()))?;

    debug!(?request, "Handling worker request");
    let response = store.apply(request);

    write_response(&mut stream, &response).await?;
    Ok(())
}

async fn write_response(stream: &mut UnixStream, response: &WorkerResponse) -> Result<()> {
    let bytes = MessageFrame::encode(response)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WorkerHandle;
    use std::time::Duration;

    // Spin a worker loop on a private socket and exercise it through the
    // typed client.
    #[tokio::test]
    async fn serve_loop_end_to_end() {
        let identity = WorkerIdentity::new(777_001, 777_002);
        let socket_path = crate::env::worker_socket_path(identity);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).unwrap();

        let coord = ShutdownCoordinator::new();
        let shutdown = coord.handle();
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            serve(&listener, server_shutdown).await;
        });

        let handle = WorkerHandle::new(identity, std::process::id());
        handle.put(b"k1".to_vec(), b"v1".to_vec()).await.unwrap();
        handle.put(b"k2".to_vec(), b"v2".to_vec()).await.unwrap();

        assert_eq!(handle.count().await.unwrap(), 2);
        assert_eq!(handle.get(b"k1".to_vec()).await.unwrap(), Some(b"v1".to_vec()));
        assert!(handle.delete(b"k1".to_vec()).await.unwrap());
        assert_eq!(handle.get(b"k1".to_vec()).await.unwrap(), None);

        let (pairs, done) = handle.read_batch(1, 10).await.unwrap();
        assert_eq!(pairs, vec![(b"k2".to_vec(), b"v2".to_vec())]);
        assert!(done);

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("worker loop must stop on shutdown")
            .unwrap();
        let _ = std::fs::remove_file(&socket_path);
    }
}
