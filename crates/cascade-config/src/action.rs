use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Recovery action taken when a module raises an error of a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleAction {
  /// Treat the error as success; the module reports accept.
  IgnoreCompletely,
  /// Treat the error as a module failure; the path keeps going.
  FailModule,
  /// Stop the remaining workers on the path; the path completes as failed.
  FailPath,
  /// Skip the rest of the event. Only honored by the trigger-results
  /// summary stage; everywhere else this escalates.
  SkipEvent,
  /// Propagate the error to the caller.
  Rethrow,
}

/// Maps error categories to recovery actions.
///
/// Categories are free-form strings chosen by modules. Anything not listed
/// resolves to [`ModuleAction::Rethrow`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionTable {
  actions: HashMap<String, ModuleAction>,
}

impl ActionTable {
  /// Create an empty table (every category rethrows).
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a table from explicit category/action pairs.
  pub fn from_actions<I>(actions: I) -> Self
  where
    I: IntoIterator<Item = (String, ModuleAction)>,
  {
    Self {
      actions: actions.into_iter().collect(),
    }
  }

  /// Register an action for a category, replacing any previous entry.
  pub fn insert(&mut self, category: impl Into<String>, action: ModuleAction) {
    self.actions.insert(category.into(), action);
  }

  /// Resolve the action for a category. Unknown categories rethrow.
  pub fn action_for(&self, category: &str) -> ModuleAction {
    self
      .actions
      .get(category)
      .copied()
      .unwrap_or(ModuleAction::Rethrow)
  }
}
