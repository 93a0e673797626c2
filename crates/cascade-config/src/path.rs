use serde::{Deserialize, Serialize};

/// How a filter module's answer is folded into its path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDisposition {
  /// The module's accept/reject answer is used as-is.
  #[default]
  Normal,
  /// The module's answer is inverted (run the path only when it rejects).
  Veto,
}

/// One module position on a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleUse {
  /// Label of a registered module.
  pub label: String,
  #[serde(default, skip_serializing_if = "is_normal")]
  pub disposition: FilterDisposition,
}

fn is_normal(d: &FilterDisposition) -> bool {
  *d == FilterDisposition::Normal
}

impl ModuleUse {
  /// A module used with the normal disposition.
  pub fn normal(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      disposition: FilterDisposition::Normal,
    }
  }

  /// A module used as a veto.
  pub fn veto(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      disposition: FilterDisposition::Veto,
    }
  }
}

/// An ordered list of module uses executed together.
///
/// Order is semantically significant: workers run in the order listed and
/// a rejecting filter stops everything after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathDef {
  pub name: String,
  pub modules: Vec<ModuleUse>,
}

impl PathDef {
  pub fn new(name: impl Into<String>, modules: Vec<ModuleUse>) -> Self {
    Self {
      name: name.into(),
      modules,
    }
  }
}
