//! Environment-variable resolved paths and limits.
//!
//! Everything the manager, workers, and backends must agree on without
//! talking to each other first lives here: the runtime directory, the
//! manager socket, the pid file, and per-identity worker sockets.

use crate::identity::WorkerIdentity;
use std::path::PathBuf;

pub const ENV_RUNTIME_DIR: &str = "RELKV_RUNTIME_DIR";
pub const ENV_MANAGER_SOCKET: &str = "RELKV_MANAGER_SOCKET";
pub const ENV_MANAGER_PID: &str = "RELKV_MANAGER_PID";
pub const ENV_MAX_WORKERS: &str = "RELKV_MAX_WORKERS";

const RELKV_SUBDIR: &str = "relkv";

/// Default worker-process budget when neither env nor config sets one.
pub const DEFAULT_MAX_WORKERS: usize = 8;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Runtime directory ($RELKV_RUNTIME_DIR, $XDG_RUNTIME_DIR/relkv, or
/// a relkv subdirectory of the system temp dir).
pub fn runtime_dir() -> PathBuf {
    let dir = env_opt(ENV_RUNTIME_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(RELKV_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved runtime directory");
    dir
}

/// Manager socket path ($RELKV_MANAGER_SOCKET or <runtime>/manager.sock)
pub fn manager_socket_path() -> PathBuf {
    env_opt(ENV_MANAGER_SOCKET)
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir().join("manager.sock"))
}

/// Manager pid file path ($RELKV_MANAGER_PID or <runtime>/manager.pid)
pub fn manager_pid_path() -> PathBuf {
    env_opt(ENV_MANAGER_PID)
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir().join("manager.pid"))
}

/// Socket a worker binds for its storage-engine requests.
pub fn worker_socket_path(identity: WorkerIdentity) -> PathBuf {
    runtime_dir().join(format!(
        "worker-{}-{}.sock",
        identity.database_id, identity.relation_id
    ))
}

/// Config directory (~/.config/relkv)
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join(RELKV_SUBDIR)
}
