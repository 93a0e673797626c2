//! Cascade Module
//!
//! The boundary between the execution engine and processing modules.
//! Modules arrive fully constructed - this crate defines the traits they
//! implement, the capability handle the engine stores them behind, the
//! error type they raise, and the observer surface execution progress is
//! reported through.
//!
//! Whether a module is output-capable is decided once at construction by
//! choosing the [`ModuleHandle`] variant; the engine never type-checks a
//! module at call time.

mod error;
mod handle;
mod observer;

pub use error::ModuleError;
pub use handle::{
  EventModule, FileBlock, ModuleHandle, ModuleThreading, OutputModule, StreamIndex, WriteContext,
};
pub use observer::{ChannelObserver, ExecutionEvent, ExecutionObserver, NoopObserver};
