//! relkv: process lifecycle and request routing for an embedded KV
//! storage engine.
//!
//! A single manager process owns one worker process per
//! (database, relation) pair. Backends ask the manager to open or close
//! workers through a single-slot coordination handshake, then talk to
//! workers directly over per-worker Unix sockets, caching the routes
//! they have resolved.

#[cfg(not(unix))]
compile_error!("relkv requires Unix domain sockets and POSIX signals");

pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod identity;
pub mod manager;
pub mod pidfile;
pub mod protocol;
pub mod shutdown;
pub mod worker;

pub use error::{RelKvError, Result};
pub use identity::WorkerIdentity;
