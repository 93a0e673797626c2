use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::event::EventId;

/// A half-open span of events within one subrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRange {
  pub subrun: u32,
  pub begin: u64,
  pub end: u64,
}

impl EventRange {
  pub fn new(subrun: u32, begin: u64, end: u64) -> Self {
    Self { subrun, begin, end }
  }

  /// A single-event range.
  pub fn for_event(subrun: u32, event: u64) -> Self {
    Self {
      subrun,
      begin: event,
      end: event + 1,
    }
  }

  pub fn contains(&self, subrun: u32, event: u64) -> bool {
    self.subrun == subrun && (self.begin..self.end).contains(&event)
  }

  fn abuts(&self, other: &EventRange) -> bool {
    self.subrun == other.subrun && self.end == other.begin
  }
}

/// The set of event ranges from one run that have flowed into an output.
///
/// Ranges grow in event-arrival order; `collapse` merges adjacent spans so
/// the recorded provenance stays compact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeSet {
  run: u32,
  ranges: Vec<EventRange>,
}

impl RangeSet {
  pub fn for_run(run: u32) -> Self {
    Self {
      run,
      ranges: Vec::new(),
    }
  }

  pub fn run(&self) -> u32 {
    self.run
  }

  pub fn ranges(&self) -> &[EventRange] {
    &self.ranges
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  /// Absorb one event id, extending the trailing range when contiguous.
  pub fn insert(&mut self, id: EventId) -> Result<(), DataError> {
    if id.run != self.run {
      return Err(DataError::RunMismatch {
        expected: self.run,
        got: id.run,
      });
    }
    match self.ranges.last_mut() {
      Some(last) if last.subrun == id.subrun && last.end == id.event => {
        last.end = id.event + 1;
      }
      _ => self.ranges.push(EventRange::for_event(id.subrun, id.event)),
    }
    Ok(())
  }

  /// Merge abutting ranges in place.
  pub fn collapse(&mut self) {
    let mut collapsed: Vec<EventRange> = Vec::with_capacity(self.ranges.len());
    for range in self.ranges.drain(..) {
      match collapsed.last_mut() {
        Some(last) if last.abuts(&range) => last.end = range.end,
        _ => collapsed.push(range),
      }
    }
    self.ranges = collapsed;
  }

  /// Append every range from `other`, then collapse.
  pub fn merge(&mut self, other: &RangeSet) -> Result<(), DataError> {
    if other.run != self.run {
      return Err(DataError::RunMismatch {
        expected: self.run,
        got: other.run,
      });
    }
    self.ranges.extend_from_slice(&other.ranges);
    self.collapse();
    Ok(())
  }

  pub fn contains(&self, id: EventId) -> bool {
    id.run == self.run && self.ranges.iter().any(|r| r.contains(id.subrun, id.event))
  }
}

/// Incremental tracker feeding run- or subrun-scoped output records.
///
/// `update` absorbs each written event; `take_accumulated` hands the
/// tracked ranges to the record being written; `rebase` restarts tracking
/// for the next file. Entry totals are never rebased away, so forced
/// extra records written while a file is closing still count there.
#[derive(Debug, Clone)]
pub struct RangeSetTracker {
  accumulated: RangeSet,
  entries: u64,
  subrun_sealed: bool,
}

impl RangeSetTracker {
  pub fn for_run(run: u32) -> Self {
    Self {
      accumulated: RangeSet::for_run(run),
      entries: 0,
      subrun_sealed: false,
    }
  }

  pub fn run(&self) -> u32 {
    self.accumulated.run()
  }

  /// Absorb one written event.
  ///
  /// `last_in_subrun` seals the trailing range so the next event opens a
  /// fresh one even if it would otherwise be contiguous.
  pub fn update(&mut self, id: EventId, last_in_subrun: bool) -> Result<(), DataError> {
    if id.run != self.accumulated.run {
      return Err(DataError::RunMismatch {
        expected: self.accumulated.run,
        got: id.run,
      });
    }
    if self.subrun_sealed {
      // The sealed range must not grow; open a fresh one.
      self
        .accumulated
        .ranges
        .push(EventRange::for_event(id.subrun, id.event));
      self.subrun_sealed = false;
    } else {
      self.accumulated.insert(id)?;
    }
    self.entries += 1;
    if last_in_subrun {
      self.subrun_sealed = true;
    }
    Ok(())
  }

  /// Ranges tracked since the last rebase.
  pub fn accumulated(&self) -> &RangeSet {
    &self.accumulated
  }

  /// Total events ever absorbed, across rebases.
  pub fn entries(&self) -> u64 {
    self.entries
  }

  /// Hand out the tracked ranges and restart tracking for the next file.
  pub fn rebase(&mut self) -> RangeSet {
    self.subrun_sealed = false;
    let run = self.accumulated.run();
    std::mem::replace(&mut self.accumulated, RangeSet::for_run(run))
  }

  /// Restart tracking under a new run.
  pub fn reset_for_run(&mut self, run: u32) {
    self.accumulated = RangeSet::for_run(run);
    self.subrun_sealed = false;
  }
}
