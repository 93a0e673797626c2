use std::sync::Arc;

use cascade_config::Granularity;
use cascade_data::{Principal, RangeSet, Transition};
use serde::{Deserialize, Serialize};

use crate::error::ModuleError;

/// Index of the processing stream a module invocation belongs to.
pub type StreamIndex = usize;

/// How module instances are shared across streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleThreading {
  /// One instance per stream.
  #[default]
  Replicated,
  /// One instance referenced by every stream, executions serialized.
  Shared,
}

/// Provenance tag handed to output writes: which path and module produced
/// the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteContext {
  pub path: String,
  pub label: String,
}

impl WriteContext {
  pub fn new(path: impl Into<String>, label: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      label: label.into(),
    }
  }
}

/// Identity of the file generation an output module writes into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
  /// Monotonic sequence number, bumped on every switch.
  pub sequence: u32,
}

impl FileBlock {
  pub fn first() -> Self {
    Self { sequence: 0 }
  }

  pub fn next(&self) -> Self {
    Self {
      sequence: self.sequence + 1,
    }
  }
}

/// A processing module.
///
/// `process_event` returns the filter answer: `true` accepts, `false`
/// rejects. Producers and observers always accept. Bodies are synchronous;
/// the engine owns all task scheduling around them.
pub trait EventModule: Send + Sync {
  fn process_event(&self, principal: &Principal, stream: StreamIndex)
  -> Result<bool, ModuleError>;

  /// Run/subrun boundary processing. Most modules have nothing to do.
  fn process_transition(
    &self,
    _transition: Transition,
    _principal: &Principal,
  ) -> Result<(), ModuleError> {
    Ok(())
  }
}

/// An output-capable module: everything an [`EventModule`] does, plus file
/// lifecycle and record writing.
pub trait OutputModule: EventModule {
  /// Open the file for a new generation. Called once before the first
  /// event and after every switch.
  fn open_file(&self, block: &FileBlock) -> Result<(), ModuleError>;

  /// Close the current file. The engine guarantees it will not call this
  /// on an already-closed file.
  fn close_file(&self) -> Result<(), ModuleError>;

  fn is_file_open(&self) -> bool;

  fn write_event(&self, principal: &Principal, ctx: &WriteContext) -> Result<(), ModuleError>;

  /// Write the run-scoped record covering `ranges`.
  fn write_run(&self, run: u32, ranges: &RangeSet) -> Result<(), ModuleError>;

  /// Write the subrun-scoped record covering `ranges`.
  fn write_subrun(&self, run: u32, subrun: u32, ranges: &RangeSet) -> Result<(), ModuleError>;

  /// Whether this module wants its file closed at the next opportunity.
  fn requests_to_close(&self) -> bool;

  /// Whether this module's configured output limit has been reached.
  fn limit_reached(&self) -> bool;

  /// Finest boundary at which this module's file may be switched.
  fn granularity(&self) -> Granularity {
    Granularity::Event
  }
}

/// Capability handle for a constructed module instance.
///
/// The variant is fixed at construction; output workers are found by
/// matching on it, never by downcasting at call time.
#[derive(Clone)]
pub enum ModuleHandle {
  Plain(Arc<dyn EventModule>),
  Output(Arc<dyn OutputModule>),
}

impl ModuleHandle {
  /// View the module through its event-processing surface.
  pub fn event_module(&self) -> &dyn EventModule {
    match self {
      ModuleHandle::Plain(m) => m.as_ref(),
      ModuleHandle::Output(m) => m.as_ref(),
    }
  }

  pub fn as_output(&self) -> Option<&Arc<dyn OutputModule>> {
    match self {
      ModuleHandle::Plain(_) => None,
      ModuleHandle::Output(m) => Some(m),
    }
  }

  pub fn is_output(&self) -> bool {
    matches!(self, ModuleHandle::Output(_))
  }
}

impl std::fmt::Debug for ModuleHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ModuleHandle::Plain(_) => f.write_str("ModuleHandle::Plain"),
      ModuleHandle::Output(_) => f.write_str("ModuleHandle::Output"),
    }
  }
}
