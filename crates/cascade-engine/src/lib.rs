//! Cascade Engine
//!
//! The per-stream execution engine: `TriggerPathRunner` fans trigger paths
//! out over the task pool and fans their answers back in, `EndPathRunner`
//! runs the end path and owns output-file lifecycle, and `Schedule` ties
//! one stream's registry and runners together.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PipelineRunner                         │
//! │  - owns mpsc channel for incoming principals                │
//! │  - sequences run/subrun boundaries and file switches        │
//! │  - dispatches events across schedules                       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Schedule (xN)                        │
//! │  - TriggerPathRunner: fan-out, fan-in, trigger results      │
//! │  - EndPathRunner: end path, output writes, file switching   │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Path / Worker                          │
//! │  - ordered worker steps, dedup across sibling paths         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod end_runner;
mod error;
mod runner;
mod schedule;
mod setup;
mod trigger_runner;

pub use end_runner::{EndPathRunner, FileStatus};
pub use error::EngineError;
pub use runner::{JobSummary, PathSummary, PipelineRunner};
pub use schedule::Schedule;
pub use setup::{ModuleBinding, ModuleSet, ScheduleBuilder};
pub use trigger_runner::TriggerPathRunner;
