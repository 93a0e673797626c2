use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cascade_config::{ActionTable, FilterDisposition, ModuleAction};
use cascade_data::{Principal, Transition};
use cascade_module::{ExecutionEvent, ExecutionObserver, StreamIndex};
use cascade_worker::{ExecutionError, Worker, WorkerState};
use tracing::warn;

use crate::bits::TriggerBits;

/// Per-event state of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
  Ready,
  Pass,
  Fail,
  Exception,
}

impl PathState {
  pub fn name(&self) -> &'static str {
    match self {
      PathState::Ready => "ready",
      PathState::Pass => "pass",
      PathState::Fail => "fail",
      PathState::Exception => "exception",
    }
  }
}

/// Snapshot of a path's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathCounts {
  pub run: u64,
  pub passed: u64,
  pub failed: u64,
  pub excepted: u64,
}

/// A worker bound to one position on one path.
///
/// Does not own the worker - the same worker may sit on several paths of
/// the schedule. The cached return code is valid only after the worker
/// has run for the current event.
pub struct WorkerInPath {
  worker: Arc<Worker>,
  disposition: FilterDisposition,
  position: usize,
  return_code: Mutex<Option<bool>>,
}

impl WorkerInPath {
  pub fn new(worker: Arc<Worker>, disposition: FilterDisposition, position: usize) -> Self {
    Self {
      worker,
      disposition,
      position,
      return_code: Mutex::new(None),
    }
  }

  pub fn worker(&self) -> &Arc<Worker> {
    &self.worker
  }

  pub fn disposition(&self) -> FilterDisposition {
    self.disposition
  }

  pub fn position(&self) -> usize {
    self.position
  }

  /// The accept/reject answer recorded for the current event, if any.
  pub fn return_code(&self) -> Option<bool> {
    *self.return_code.lock().expect("return code poisoned")
  }

  /// Fold the worker's raw answer through this position's disposition.
  fn accept(&self, raw: bool) -> bool {
    match self.disposition {
      FilterDisposition::Normal => raw,
      FilterDisposition::Veto => !raw,
    }
  }

  fn record(&self, accepted: bool) {
    *self.return_code.lock().expect("return code poisoned") = Some(accepted);
  }

  fn clear(&self) {
    *self.return_code.lock().expect("return code poisoned") = None;
  }
}

/// An ordered list of workers executed together for one stream.
///
/// Trigger paths carry a bit position into the shared trigger-bit vector;
/// the end path carries neither bit nor filter semantics - its workers
/// are observers.
pub struct Path {
  name: String,
  bit: Option<usize>,
  end_path: bool,
  stream: StreamIndex,
  workers: Vec<WorkerInPath>,
  actions: Arc<ActionTable>,
  trigger_bits: Option<Arc<TriggerBits>>,
  observer: Arc<dyn ExecutionObserver>,
  state: Mutex<PathState>,
  run: AtomicU64,
  passed: AtomicU64,
  failed: AtomicU64,
  excepted: AtomicU64,
}

impl Path {
  /// A trigger path recording into `bits` at `bit`.
  pub fn trigger(
    name: impl Into<String>,
    bit: usize,
    stream: StreamIndex,
    workers: Vec<WorkerInPath>,
    actions: Arc<ActionTable>,
    bits: Arc<TriggerBits>,
    observer: Arc<dyn ExecutionObserver>,
  ) -> Self {
    Self::build(name, Some(bit), false, stream, workers, actions, Some(bits), observer)
  }

  /// The end path: observer-only, no trigger bit.
  pub fn end(
    name: impl Into<String>,
    stream: StreamIndex,
    workers: Vec<WorkerInPath>,
    actions: Arc<ActionTable>,
    observer: Arc<dyn ExecutionObserver>,
  ) -> Self {
    Self::build(name, None, true, stream, workers, actions, None, observer)
  }

  #[allow(clippy::too_many_arguments)]
  fn build(
    name: impl Into<String>,
    bit: Option<usize>,
    end_path: bool,
    stream: StreamIndex,
    workers: Vec<WorkerInPath>,
    actions: Arc<ActionTable>,
    trigger_bits: Option<Arc<TriggerBits>>,
    observer: Arc<dyn ExecutionObserver>,
  ) -> Self {
    Self {
      name: name.into(),
      bit,
      end_path,
      stream,
      workers,
      actions,
      trigger_bits,
      observer,
      state: Mutex::new(PathState::Ready),
      run: AtomicU64::new(0),
      passed: AtomicU64::new(0),
      failed: AtomicU64::new(0),
      excepted: AtomicU64::new(0),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn bit(&self) -> Option<usize> {
    self.bit
  }

  pub fn is_end_path(&self) -> bool {
    self.end_path
  }

  pub fn stream(&self) -> StreamIndex {
    self.stream
  }

  pub fn workers(&self) -> &[WorkerInPath] {
    &self.workers
  }

  pub fn state(&self) -> PathState {
    *self.state.lock().expect("path state poisoned")
  }

  pub fn counts(&self) -> PathCounts {
    PathCounts {
      run: self.run.load(Ordering::Relaxed),
      passed: self.passed.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      excepted: self.excepted.load(Ordering::Relaxed),
    }
  }

  /// Clear per-event transient state. Worker reset is the registry's job.
  pub fn reset(&self) {
    *self.state.lock().expect("path state poisoned") = PathState::Ready;
    for wip in &self.workers {
      wip.clear();
    }
  }

  /// Synchronous loop for run/subrun boundaries.
  ///
  /// The first unabsorbed exception aborts the whole path and propagates.
  pub async fn process_transition(
    &self,
    transition: Transition,
    principal: &Principal,
  ) -> Result<(), ExecutionError> {
    let mut all_accepted = true;
    for wip in &self.workers {
      if let Err(err) = wip.worker().run_transition(transition, principal).await {
        self.set_state(PathState::Exception);
        self.excepted.fetch_add(1, Ordering::Relaxed);
        return Err(err.in_path(self.name.clone(), principal.id()));
      }
      if wip.worker().state() == WorkerState::Fail {
        all_accepted = false;
      }
    }
    self.set_state(if all_accepted {
      PathState::Pass
    } else {
      PathState::Fail
    });
    Ok(())
  }

  /// Synchronous per-event loop for the end path.
  ///
  /// Worker rejection is recorded but never stops iteration - end-path
  /// workers are observers, not filters. The path is Pass unless a worker
  /// threw.
  pub async fn process_end_path_event(
    &self,
    principal: &Principal,
    stream: StreamIndex,
  ) -> Result<(), ExecutionError> {
    self.run.fetch_add(1, Ordering::Relaxed);
    self.observer.notify(ExecutionEvent::PathStarted {
      stream,
      path: self.name.clone(),
    });

    let mut result = Ok(());
    for wip in &self.workers {
      match wip.worker().run_event_serial(principal, stream, true).await {
        Ok(raw) => wip.record(wip.accept(raw)),
        Err(err) => {
          self.excepted.fetch_add(1, Ordering::Relaxed);
          result = Err(err.in_path(self.name.clone(), principal.id()));
          break;
        }
      }
    }

    let state = if result.is_ok() {
      self.passed.fetch_add(1, Ordering::Relaxed);
      PathState::Pass
    } else {
      PathState::Exception
    };
    self.set_state(state);
    self.observer.notify(ExecutionEvent::PathFinished {
      stream,
      path: self.name.clone(),
      status: state.name().to_string(),
      index: self.workers.len(),
    });
    result
  }

  /// The task-chained per-event protocol for trigger paths.
  ///
  /// Each step awaits the worker's outcome before the next is scheduled;
  /// rejection or a path-failing exception stops the walk early. Path
  /// completion records counters, state, and the trigger bit with the
  /// index reached, then resolves the caller.
  pub async fn process_trigger_path_event(
    &self,
    principal: &Principal,
    stream: StreamIndex,
  ) -> Result<(), ExecutionError> {
    self.run.fetch_add(1, Ordering::Relaxed);
    self.observer.notify(ExecutionEvent::PathStarted {
      stream,
      path: self.name.clone(),
    });

    let mut should_continue = true;
    let mut index = 0;
    let mut captured: Option<ExecutionError> = None;

    for wip in &self.workers {
      match wip.worker().run_event(principal, stream).await {
        Ok(raw) => {
          index = wip.position() + 1;
          let accepted = wip.accept(raw);
          wip.record(accepted);
          if !accepted {
            should_continue = false;
          }
        }
        Err(err) => {
          index = wip.position() + 1;
          if err.category().map(|c| self.actions.action_for(c))
            == Some(ModuleAction::FailPath)
          {
            warn!(
              path = %self.name,
              label = %wip.worker().label(),
              id = %principal.id(),
              "path failing due to module exception"
            );
            wip.record(false);
            should_continue = false;
          } else {
            captured = Some(err);
          }
        }
      }
      if !should_continue || captured.is_some() {
        break;
      }
    }

    self.complete_trigger_path(principal, stream, should_continue, index, captured)
  }

  /// Path completion: counters, state, trigger bit, waiter resolution.
  fn complete_trigger_path(
    &self,
    principal: &Principal,
    stream: StreamIndex,
    should_continue: bool,
    index: usize,
    captured: Option<ExecutionError>,
  ) -> Result<(), ExecutionError> {
    let (state, result) = match captured {
      Some(err) => {
        self.excepted.fetch_add(1, Ordering::Relaxed);
        (
          PathState::Exception,
          Err(err.in_path(self.name.clone(), principal.id())),
        )
      }
      None if should_continue => {
        self.passed.fetch_add(1, Ordering::Relaxed);
        (PathState::Pass, Ok(()))
      }
      None => {
        self.failed.fetch_add(1, Ordering::Relaxed);
        (PathState::Fail, Ok(()))
      }
    };

    self.set_state(state);
    if let (Some(bits), Some(bit)) = (&self.trigger_bits, self.bit) {
      bits.record(bit, state, index);
    }
    self.observer.notify(ExecutionEvent::PathFinished {
      stream,
      path: self.name.clone(),
      status: state.name().to_string(),
      index,
    });
    result
  }

  fn set_state(&self, state: PathState) {
    *self.state.lock().expect("path state poisoned") = state;
  }
}

impl std::fmt::Debug for Path {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Path")
      .field("name", &self.name)
      .field("bit", &self.bit)
      .field("end_path", &self.end_path)
      .field("workers", &self.workers.len())
      .finish()
  }
}
