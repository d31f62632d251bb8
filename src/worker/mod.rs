//! Worker side: the per-relation store and the process runtime that
//! serves it over a Unix socket.

pub mod runtime;
pub mod store;

pub use store::RelationStore;
