//! Manager-side process lifecycle: the coordination region that brokers
//! backend requests, the worker registry, the process-host seam, the
//! spawn/terminate supervisor, and the socket server that ties them
//! together.

pub mod coord;
pub mod host;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use coord::{CoordinationRegion, DispatchOutcome, WorkRequest, OP_CLOSE, OP_OPEN};
pub use host::{ProcessHost, Spawned, TokioProcessHost};
pub use registry::{FindOrReserve, WorkerRecord, WorkerRegistry};
pub use server::ManagerServer;
pub use supervisor::WorkerSupervisor;
