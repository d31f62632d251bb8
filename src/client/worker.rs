//! Client for one worker's Unix socket: the storage-engine operation
//! surface, typed over the wire protocol. One connection per request,
//! like the manager client.

use crate::error::{RelKvError, Result};
use crate::identity::WorkerIdentity;
use crate::protocol::{MessageFrame, OpenArgs, WorkerRequest, WorkerResponse};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::trace;

/// Handle to one live worker, cached per backend.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub identity: WorkerIdentity,
    pub pid: u32,
    socket_path: PathBuf,
}

impl WorkerHandle {
    pub fn new(identity: WorkerIdentity, pid: u32) -> Self {
        Self {
            identity,
            pid,
            socket_path: crate::env::worker_socket_path(identity),
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        trace!(identity = %self.identity, path = %self.socket_path.display(), "Calling worker");

        let connect = UnixStream::connect(&self.socket_path).await;
        let mut stream = connect.map_err(|e| RelKvError::WorkerUnavailable {
            identity: self.identity,
            source: e,
        })?;

        let request_bytes = MessageFrame::encode(&request)?;
        let io = async {
            stream.write_all(&request_bytes).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = MessageFrame::read_length(&len_buf);

            let mut response_buf = vec![0u8; len];
            stream.read_exact(&mut response_buf).await?;
            Ok::<_, std::io::Error>(response_buf)
        };
        let response_buf = io.await.map_err(|e| RelKvError::WorkerUnavailable {
            identity: self.identity,
            source: e,
        })?;

        let archived = rkyv::access::<crate::protocol::ArchivedWorkerResponse, rkyv::rancor::Error>(
            &response_buf,
        )
        .map_err(|e| RelKvError::Frame(e.to_string()))?;
        let response: WorkerResponse = rkyv::deserialize::<_, rkyv::rancor::Error>(archived)
            .map_err(|e| RelKvError::Frame(e.to_string()))?;

        match response {
            WorkerResponse::Error { message } => Err(RelKvError::Remote(message)),
            other => Ok(other),
        }
    }

    pub async fn open(&self, args: OpenArgs) -> Result<()> {
        match self.call(WorkerRequest::Open { args }).await? {
            WorkerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self.call(WorkerRequest::Close).await? {
            WorkerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn count(&self) -> Result<u64> {
        match self.call(WorkerRequest::Count).await? {
            WorkerResponse::Count(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        match self.call(WorkerRequest::Put { key, value }).await? {
            WorkerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Returns `None` when the key is absent.
    pub async fn get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>> {
        match self.call(WorkerRequest::Get { key }).await? {
            WorkerResponse::Value(v) => Ok(v),
            other => Err(unexpected(&other)),
        }
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: Vec<u8>) -> Result<bool> {
        match self.call(WorkerRequest::Delete { key }).await? {
            WorkerResponse::Bool(existed) => Ok(existed),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn load(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        match self.call(WorkerRequest::Load { pairs }).await? {
            WorkerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Pull the next batch for a full-scan cursor. `done` marks the end
    /// of the scan; the worker drops the cursor state on its own then.
    pub async fn read_batch(&self, cursor: u64, limit: u32) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
        match self.call(WorkerRequest::ReadBatch { cursor, limit }).await? {
            WorkerResponse::Batch { pairs, done } => Ok((pairs, done)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close_cursor(&self, cursor: u64) -> Result<()> {
        match self.call(WorkerRequest::CloseCursor { cursor }).await? {
            WorkerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Pull the next batch for a bounded range cursor.
    pub async fn range_query(
        &self,
        cursor: u64,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        limit: u32,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
        match self
            .call(WorkerRequest::RangeQuery {
                cursor,
                start,
                end,
                limit,
            })
            .await?
        {
            WorkerResponse::Batch { pairs, done } => Ok((pairs, done)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn clear_range_query(&self, cursor: u64) -> Result<()> {
        match self.call(WorkerRequest::ClearRangeQuery { cursor }).await? {
            WorkerResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &WorkerResponse) -> RelKvError {
    RelKvError::Remote(format!("unexpected worker response: {response:?}"))
}
