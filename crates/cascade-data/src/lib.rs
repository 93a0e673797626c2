//! Cascade Data
//!
//! Event identity, the `Principal` data-container boundary type, and the
//! incremental range-set bookkeeping used by output-file management.
//!
//! The `Principal` here is only the surface the execution engine needs:
//! an id plus a label-keyed product store handed to every module
//! invocation. Persistence and binary serialization live outside this
//! workspace.

mod error;
mod event;
mod principal;
mod ranges;

pub use error::DataError;
pub use event::{EventId, Transition};
pub use principal::Principal;
pub use ranges::{EventRange, RangeSet, RangeSetTracker};
