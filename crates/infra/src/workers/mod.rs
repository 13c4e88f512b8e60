//! Background worker threads.

pub mod endpoint_worker;
pub mod scheduler_pump;

pub use endpoint_worker::{EndpointWorker, WorkerHandle};
pub use scheduler_pump::SchedulerPump;
