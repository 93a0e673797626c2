use serde::{Deserialize, Serialize};

use crate::action::ActionTable;
use crate::path::PathDef;

fn default_streams() -> usize {
  1
}

/// A complete pipeline definition: the path graph for one processing job.
///
/// This is configuration only - module labels are bound to constructed
/// module instances at setup time by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
  pub name: String,
  /// Number of parallel processing streams (schedules).
  #[serde(default = "default_streams")]
  pub streams: usize,
  /// Trigger paths, in bit order.
  #[serde(default)]
  pub trigger_paths: Vec<PathDef>,
  /// The end path (observers and outputs), at most one.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_path: Option<PathDef>,
  /// Label of the trigger-results summary module, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub results_module: Option<String>,
  /// Category to recovery-action mapping shared by all schedules.
  #[serde(default)]
  pub actions: ActionTable,
}

impl PipelineDef {
  /// Labels referenced anywhere in the pipeline, with duplicates.
  pub fn referenced_labels(&self) -> impl Iterator<Item = &str> {
    self
      .trigger_paths
      .iter()
      .chain(self.end_path.iter())
      .flat_map(|p| p.modules.iter())
      .map(|m| m.label.as_str())
      .chain(self.results_module.as_deref())
  }
}
