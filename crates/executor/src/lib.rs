//! Job execution: the document-model registry, the per-job executor and
//! the worker-pool manager.
//!
//! Executors consume "job available" events from the bus, pull jobs from
//! the shared queue (strict FIFO per partition) and turn proposed actions
//! into committed, signed, hash-chained operations. Job errors are
//! captured into the job outcome rather than thrown across the pool
//! boundary, so one failing job cannot crash the pool.

pub mod executor;
pub mod manager;
pub mod registry;

pub use executor::{ExecutorError, JobExecutor, JobOutcome};
pub use manager::{ExecutorManager, ExecutorStats, ManagerConfig};
pub use registry::{
    DocumentModel, DocumentModelRegistry, ModuleLoader, Reducer, ReducerOutcome, RegistryError,
};
