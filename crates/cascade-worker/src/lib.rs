//! Cascade Worker
//!
//! The per-module execution wrapper. A `Worker` owns the per-event state
//! machine for one module instance: at-most-once execution with fan-out to
//! every path waiting on the module, classification of module errors
//! against the action table, and the serial queue that keeps shared module
//! instances single-flight across streams.

mod error;
mod worker;

pub use error::ExecutionError;
pub use worker::{Worker, WorkerCounts, WorkerState};
