//! IPC protocol types using rkyv for zero-copy serialization.
//!
//! Two surfaces share the same framing: the manager socket (worker
//! lifecycle requests from backends, plus the readiness signal from
//! freshly spawned workers) and each worker's own socket (storage-engine
//! operations forwarded by backends).
//!
//! Wire format: `[4-byte length (little-endian)][rkyv bytes]`.

use crate::error::RelKvError;
use crate::identity::WorkerIdentity;
use rkyv::{Archive, Deserialize, Serialize};

/// Request to the manager socket.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum ManagerRequest {
    /// Check if the manager is alive
    Ping,
    /// Shut the manager down (terminates every live worker first)
    Shutdown,
    /// Start (or reuse) the worker for an identity
    Open { identity: WorkerIdentity },
    /// Stop the worker for an identity; the all-relations sentinel stops
    /// every worker in the database
    Close { identity: WorkerIdentity },
    /// Sent by a freshly spawned worker once its own initialization is
    /// complete; releases the spawn handshake
    WorkerReady { identity: WorkerIdentity, pid: u32 },
    /// List live workers
    ListWorkers,
}

/// Response from the manager socket.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum ManagerResponse {
    Pong { uptime_secs: u64, version: String },
    Ok,
    /// Open succeeded; pid of the (possibly pre-existing) worker
    Opened { pid: u32 },
    Workers { list: Vec<WorkerInfo> },
    Error { kind: WireErrorKind, message: String },
}

/// Failure classification carried through the handshake so backends can
/// surface the right error without parsing messages.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum WireErrorKind {
    /// Worker-process budget exhausted
    ResourceExhausted { limit: u64 },
    /// Worker exited before signaling readiness
    WorkerStartup,
    Other,
}

impl ManagerResponse {
    pub fn from_error(err: &RelKvError) -> Self {
        let kind = match err {
            RelKvError::ResourceExhausted { limit } => WireErrorKind::ResourceExhausted {
                limit: *limit as u64,
            },
            RelKvError::WorkerStartup { .. } => WireErrorKind::WorkerStartup,
            _ => WireErrorKind::Other,
        };
        ManagerResponse::Error {
            kind,
            message: err.to_string(),
        }
    }
}

/// Rebuild a typed error from a wire error on the client side.
pub fn error_from_wire(kind: &WireErrorKind, message: &str) -> RelKvError {
    match kind {
        WireErrorKind::ResourceExhausted { limit } => RelKvError::ResourceExhausted {
            limit: *limit as usize,
        },
        _ => RelKvError::Remote(message.to_string()),
    }
}

/// Per-worker status entry for `ListWorkers`.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct WorkerInfo {
    pub identity: WorkerIdentity,
    pub pid: u32,
    pub uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Worker socket surface
// ---------------------------------------------------------------------------

/// Arguments for opening a relation inside a worker.
///
/// The storage engine interprets these; the core only routes them.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Default)]
#[rkyv(derive(Debug))]
pub struct OpenArgs {
    /// Engine-specific open options, opaque to the routing core
    pub options: Vec<u8>,
}

/// Storage-engine operation forwarded to one worker.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum WorkerRequest {
    Open {
        args: OpenArgs,
    },
    Close,
    Count,
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Get {
        key: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
    Load {
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    },
    ReadBatch {
        cursor: u64,
        limit: u32,
    },
    CloseCursor {
        cursor: u64,
    },
    RangeQuery {
        cursor: u64,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        limit: u32,
    },
    ClearRangeQuery {
        cursor: u64,
    },
}

/// Result of a storage-engine operation.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum WorkerResponse {
    Ok,
    Bool(bool),
    Count(u64),
    Value(Option<Vec<u8>>),
    Batch {
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
        done: bool,
    },
    Error {
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Message frame for the wire protocol.
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode any rkyv-serializable message with a length prefix.
    pub fn encode<T>(message: &T) -> Result<Vec<u8>, RelKvError>
    where
        T: for<'a> rkyv::Serialize<
            rkyv::api::high::HighSerializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::rancor::Error,
            >,
        >,
    {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
            .map_err(|e| RelKvError::Frame(e.to_string()))?;
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&bytes);
        Ok(result)
    }

    /// Read length prefix from buffer.
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }
}
