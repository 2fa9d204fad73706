//! bus_arbiter_driver
//!
//! Batch driver for `bus_arbiter_core`.
//!
//! Responsibilities:
//! - expand a workload (task counts per direction and priority) into tasks
//! - run every task on its own thread against one shared arbiter
//! - watch occupancy from outside the arbiter and report what happened
//!
//! Non-goals:
//! - no admission policy (lives in core)
//! - no async

pub mod error;
pub mod scheduler;
pub mod workload;

pub use error::DriverError;

pub use scheduler::{
    BatchScheduler,
    Observed,
    OccupancyMonitor,
    RunReport,
    TraceEvent,
    TraceKind,
};

pub use workload::{
    FixedDuration,
    RandomTicks,
    Task,
    TransferModel,
    WorkloadCfg,
    DEFAULT_SEED,
};
