use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cascade_worker::Worker;

use crate::bits::TriggerBits;
use crate::path::Path;

/// Per-schedule ownership of the path graph.
///
/// The worker map is keyed by label: a label appearing on several paths
/// resolves to one worker instance, which is what makes the at-most-once
/// execution guarantee hold across paths. Built once at setup, mutated
/// every event through reset/record, never resized.
pub struct PathRegistry {
  workers: HashMap<String, Arc<Worker>>,
  trigger_workers: Vec<Arc<Worker>>,
  trigger_paths: Vec<Arc<Path>>,
  end_path: Option<Arc<Path>>,
  bits: Arc<TriggerBits>,
  total_events: AtomicU64,
  passed_events: AtomicU64,
}

impl PathRegistry {
  pub fn new(
    workers: HashMap<String, Arc<Worker>>,
    trigger_paths: Vec<Arc<Path>>,
    end_path: Option<Arc<Path>>,
    bits: Arc<TriggerBits>,
  ) -> Self {
    // Unique workers referenced by the trigger paths, reset once per event
    // even when a label sits on several paths.
    let mut seen = HashSet::new();
    let mut trigger_workers = Vec::new();
    for path in &trigger_paths {
      for wip in path.workers() {
        if seen.insert(wip.worker().label().to_string()) {
          trigger_workers.push(wip.worker().clone());
        }
      }
    }

    Self {
      workers,
      trigger_workers,
      trigger_paths,
      end_path,
      bits,
      total_events: AtomicU64::new(0),
      passed_events: AtomicU64::new(0),
    }
  }

  /// Reset every unique trigger-path worker exactly once, then every
  /// path's transient state and the trigger bits. Must complete before
  /// any path begins the event.
  pub fn reset_for_event(&self) {
    for worker in &self.trigger_workers {
      worker.reset();
    }
    for path in &self.trigger_paths {
      path.reset();
    }
    self.bits.reset();
  }

  /// Record one finished event in the per-schedule totals.
  pub fn record_event(&self, passed: bool) {
    self.total_events.fetch_add(1, Ordering::Relaxed);
    if passed {
      self.passed_events.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn trigger_paths(&self) -> &[Arc<Path>] {
    &self.trigger_paths
  }

  pub fn end_path(&self) -> Option<&Arc<Path>> {
    self.end_path.as_ref()
  }

  pub fn bits(&self) -> &Arc<TriggerBits> {
    &self.bits
  }

  pub fn worker(&self, label: &str) -> Option<&Arc<Worker>> {
    self.workers.get(label)
  }

  pub fn workers(&self) -> &HashMap<String, Arc<Worker>> {
    &self.workers
  }

  /// (total, passed) event counts for this schedule.
  pub fn event_counts(&self) -> (u64, u64) {
    (
      self.total_events.load(Ordering::Relaxed),
      self.passed_events.load(Ordering::Relaxed),
    )
  }
}

impl std::fmt::Debug for PathRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PathRegistry")
      .field("workers", &self.workers.len())
      .field("trigger_paths", &self.trigger_paths.len())
      .field("has_end_path", &self.end_path.is_some())
      .finish()
  }
}
