use serde::{Deserialize, Serialize};

/// Boundary granularity at which an output file may be switched.
///
/// Ordering runs coarse to fine: `Run < SubRun < Event`. A worker
/// configured for a coarser granularity than the boundary being crossed is
/// not polled for closure at that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
  Run,
  SubRun,
  Event,
}

impl Granularity {
  /// True when `self` is at least as fine as `boundary`.
  pub fn at_least_as_fine_as(self, boundary: Granularity) -> bool {
    self >= boundary
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ordering_runs_coarse_to_fine() {
    assert!(Granularity::Run < Granularity::SubRun);
    assert!(Granularity::SubRun < Granularity::Event);
    assert!(Granularity::Event.at_least_as_fine_as(Granularity::SubRun));
    assert!(!Granularity::Run.at_least_as_fine_as(Granularity::SubRun));
  }
}
