//! Background jobs — worker pools, registries, cleanup, and the scheduler
//! that drives them.

pub mod cleanup;
pub mod pool;
pub mod registry;
pub mod scheduler;

pub use cleanup::{CleanupReport, run_cleanup};
pub use pool::{QueueHandler, WorkerPool};
pub use registry::{ProcessRegistry, WorkerGuard, WorkerRegistry};
pub use scheduler::{JobScheduler, SchedulerConfig};
