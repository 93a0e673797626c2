use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one unit of input data.
///
/// Run and subrun boundaries are represented with `event == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
  pub run: u32,
  pub subrun: u32,
  pub event: u64,
}

impl EventId {
  pub fn new(run: u32, subrun: u32, event: u64) -> Self {
    Self { run, subrun, event }
  }

  /// Identity for a run boundary.
  pub fn run_boundary(run: u32) -> Self {
    Self {
      run,
      subrun: 0,
      event: 0,
    }
  }

  /// Identity for a subrun boundary.
  pub fn subrun_boundary(run: u32, subrun: u32) -> Self {
    Self {
      run,
      subrun,
      event: 0,
    }
  }

  /// True for a run or subrun boundary id.
  pub fn is_boundary(&self) -> bool {
    self.event == 0
  }
}

impl fmt::Display for EventId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.run, self.subrun, self.event)
  }
}

/// Non-event transitions a worker can process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
  BeginRun,
  EndRun,
  BeginSubRun,
  EndSubRun,
}

impl Transition {
  pub fn name(&self) -> &'static str {
    match self {
      Transition::BeginRun => "begin_run",
      Transition::EndRun => "end_run",
      Transition::BeginSubRun => "begin_sub_run",
      Transition::EndSubRun => "end_sub_run",
    }
  }
}

impl fmt::Display for Transition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn displays_colon_separated() {
    let id = EventId::new(7, 2, 1093);
    assert_eq!(id.to_string(), "7:2:1093");
  }

  #[test]
  fn boundary_ids_have_zero_event() {
    assert!(EventId::run_boundary(3).is_boundary());
    assert!(EventId::subrun_boundary(3, 1).is_boundary());
    assert!(!EventId::new(3, 1, 1).is_boundary());
  }
}
