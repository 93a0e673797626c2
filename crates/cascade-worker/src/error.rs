use std::sync::Arc;

use cascade_data::EventId;
use cascade_module::{ModuleError, StreamIndex};
use thiserror::Error;

/// Errors escaping the execution engine.
///
/// Each hop wraps the inner error with its own identity, so what reaches
/// the driver names the module, the path, and the schedule that failed.
/// Clone is required because one worker failure is delivered to every
/// path waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
  /// A module raised an error no action absorbed.
  #[error("module '{label}' failed while processing {id}")]
  Module {
    label: String,
    id: EventId,
    #[source]
    source: Arc<ModuleError>,
  },

  /// A module was entered synchronously while already running.
  #[error("module '{label}' re-entered while working on {id}: module dependency cycle")]
  DependencyCycle { label: String, id: EventId },

  /// A worker completed without resolving a registered waiter.
  #[error("module '{label}' dropped a waiter without resolving it")]
  WaiterDropped { label: String },

  /// A path-level wrapper around a failing worker.
  #[error("path '{path}' failed while processing {id}")]
  Path {
    path: String,
    id: EventId,
    #[source]
    source: Box<ExecutionError>,
  },

  /// The schedule-execution-failure marker crossing the engine boundary.
  #[error("schedule {stream} failed while processing {id}")]
  Schedule {
    stream: StreamIndex,
    id: EventId,
    #[source]
    source: Box<ExecutionError>,
  },
}

impl ExecutionError {
  /// The root module error, when one exists under the wrapping.
  pub fn module_error(&self) -> Option<&ModuleError> {
    match self {
      ExecutionError::Module { source, .. } => Some(source),
      ExecutionError::Path { source, .. } | ExecutionError::Schedule { source, .. } => {
        source.module_error()
      }
      ExecutionError::DependencyCycle { .. } | ExecutionError::WaiterDropped { .. } => None,
    }
  }

  /// Category of the root module error, for action-table lookups.
  pub fn category(&self) -> Option<&str> {
    self.module_error().map(|e| e.category())
  }

  /// Wrap with path identity.
  pub fn in_path(self, path: impl Into<String>, id: EventId) -> Self {
    ExecutionError::Path {
      path: path.into(),
      id,
      source: Box::new(self),
    }
  }

  /// Wrap with the schedule-execution-failure marker.
  pub fn in_schedule(self, stream: StreamIndex, id: EventId) -> Self {
    ExecutionError::Schedule {
      stream,
      id,
      source: Box::new(self),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn category_walks_through_wrapping() {
    let err = ExecutionError::Module {
      label: "tracker".into(),
      id: EventId::new(1, 1, 1),
      source: Arc::new(ModuleError::new("bad_input", "no hits")),
    }
    .in_path("p1", EventId::new(1, 1, 1))
    .in_schedule(0, EventId::new(1, 1, 1));

    assert_eq!(err.category(), Some("bad_input"));
  }

  #[test]
  fn cycle_has_no_category() {
    let err = ExecutionError::DependencyCycle {
      label: "tracker".into(),
      id: EventId::new(1, 1, 1),
    };
    assert_eq!(err.category(), None);
  }
}
