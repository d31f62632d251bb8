//! Backend side: the manager client, per-worker clients, the dispatch
//! cache that routes operations, and the storage API built on top.

pub mod api;
pub mod cache;
pub mod manager;
pub mod worker;

pub use api::KvBackend;
pub use cache::DispatchCache;
pub use manager::ManagerClient;
pub use worker::WorkerHandle;
