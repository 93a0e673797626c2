//! Cascade Path
//!
//! Ordered worker execution for one stream: the `Path` protocols
//! (synchronous for transitions and the end path, task-chained for
//! trigger paths), the trigger-bit vector recording each path's per-event
//! answer, and the `PathRegistry` owning the shared worker map so a
//! module on several paths resolves to one worker instance.

mod bits;
mod path;
mod registry;

pub use bits::{PathStatus, TriggerBits};
pub use path::{Path, PathCounts, PathState, WorkerInPath};
pub use registry::PathRegistry;
