//! Engine errors.

use cascade_data::DataError;
use cascade_module::ModuleError;
use cascade_worker::ExecutionError;
use thiserror::Error;

/// Errors that can occur while building or driving schedules.
#[derive(Debug, Error)]
pub enum EngineError {
  /// A path references a module label nobody registered.
  #[error("module '{label}' referenced by path '{path}' is not registered")]
  UnknownModule { label: String, path: String },

  /// Two paths share a name.
  #[error("duplicate path name '{name}'")]
  DuplicatePath { name: String },

  /// An output-capable module was placed on a trigger path.
  #[error("output module '{label}' must sit on the end path, not trigger path '{path}'")]
  OutputOnTriggerPath { label: String, path: String },

  /// The pipeline defines no paths at all.
  #[error("pipeline '{name}' has no paths")]
  EmptyPipeline { name: String },

  /// An event or transition failed inside the path graph.
  #[error(transparent)]
  Execution(#[from] ExecutionError),

  /// An output module failed a file-lifecycle or write operation.
  #[error("output module '{label}' failed during {operation}")]
  Output {
    label: String,
    operation: &'static str,
    #[source]
    source: ModuleError,
  },

  /// Range-set bookkeeping rejected an update.
  #[error("output range bookkeeping failed")]
  Bookkeeping(#[from] DataError),

  /// An event task could not be joined.
  #[error("event task failed: {message}")]
  EventTask { message: String },

  /// The event channel closed while feeding.
  #[error("pipeline runner channel closed")]
  ChannelClosed,
}
