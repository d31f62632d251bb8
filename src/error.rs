use crate::identity::WorkerIdentity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelKvError {
    /// The host refused to create another worker process.
    ///
    /// Recoverable by the caller: reduce concurrency or raise the
    /// `max_workers` limit in the manager configuration.
    #[error(
        "too many worker processes (limit {limit}); \
         consider raising `max_workers` in the relkv configuration"
    )]
    ResourceExhausted { limit: usize },

    /// A spawned worker exited before signaling readiness.
    #[error("worker {identity} exited before completing initialization")]
    WorkerStartup { identity: WorkerIdentity },

    /// An unrecognized operation code reached the manager's dispatch.
    /// This is a corrupted handshake or a programming defect and is fatal
    /// to the manager loop.
    #[error("unrecognized operation code {code} in manager mailbox")]
    ProtocolViolation { code: u8 },

    /// The manager socket is not reachable.
    #[error("manager is not running (socket {})", path.display())]
    ManagerUnavailable { path: std::path::PathBuf },

    /// A worker socket is not reachable (worker gone or never started).
    #[error("worker {identity} is not reachable: {source}")]
    WorkerUnavailable {
        identity: WorkerIdentity,
        source: std::io::Error,
    },

    /// The remote side reported a failure through the handshake.
    #[error("{0}")]
    Remote(String),

    /// A blocking wait was released by the shutdown coordinator.
    #[error("operation interrupted by shutdown")]
    Shutdown,

    #[error("wire frame error: {0}")]
    Frame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelKvError {
    /// True for the recoverable resource-limit case that backends surface
    /// to end users with the configuration hint.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, RelKvError>;
