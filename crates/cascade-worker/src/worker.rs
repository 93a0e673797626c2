use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cascade_config::{ActionTable, ModuleAction};
use cascade_data::{Principal, Transition};
use cascade_module::{
  ExecutionEvent, ExecutionObserver, ModuleError, ModuleHandle, ModuleThreading, StreamIndex,
};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::ExecutionError;

/// Per-event execution state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Ready,
  Working,
  Pass,
  Fail,
  ExceptionThrown,
}

/// Snapshot of a worker's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounts {
  pub visited: u64,
  pub run: u64,
  pub passed: u64,
  pub failed: u64,
  pub thrown: u64,
}

type Outcome = Result<bool, ExecutionError>;

/// Fields valid for the current event only; cleared by `reset`.
struct Inner {
  state: WorkerState,
  return_code: bool,
  cached_error: Option<ExecutionError>,
  waiters: Vec<oneshot::Sender<Outcome>>,
}

/// What classification decided about one body run.
struct Resolution {
  state: WorkerState,
  return_code: bool,
  error: Option<ExecutionError>,
}

/// Execution wrapper around one module instance.
///
/// A worker may sit on several paths of one schedule; whichever path
/// reaches it first runs the module body, and every other path observes
/// the identical outcome. Modules declared shared additionally serialize
/// through a queue owned by the module binding, so at most one execution
/// of that instance is in flight across schedules.
pub struct Worker {
  label: String,
  module: ModuleHandle,
  actions: Arc<ActionTable>,
  threading: ModuleThreading,
  serializer: Option<Arc<tokio::sync::Mutex<()>>>,
  observer: Arc<dyn ExecutionObserver>,
  work_started: AtomicBool,
  inner: Mutex<Inner>,
  visited: AtomicU64,
  run: AtomicU64,
  passed: AtomicU64,
  failed: AtomicU64,
  thrown: AtomicU64,
}

impl Worker {
  pub fn new(
    label: impl Into<String>,
    module: ModuleHandle,
    actions: Arc<ActionTable>,
    threading: ModuleThreading,
    serializer: Option<Arc<tokio::sync::Mutex<()>>>,
    observer: Arc<dyn ExecutionObserver>,
  ) -> Self {
    Self {
      label: label.into(),
      module,
      actions,
      threading,
      serializer,
      observer,
      work_started: AtomicBool::new(false),
      inner: Mutex::new(Inner {
        state: WorkerState::Ready,
        return_code: false,
        cached_error: None,
        waiters: Vec::new(),
      }),
      visited: AtomicU64::new(0),
      run: AtomicU64::new(0),
      passed: AtomicU64::new(0),
      failed: AtomicU64::new(0),
      thrown: AtomicU64::new(0),
    }
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn module(&self) -> &ModuleHandle {
    &self.module
  }

  pub fn threading(&self) -> ModuleThreading {
    self.threading
  }

  pub fn state(&self) -> WorkerState {
    self.inner.lock().expect("worker state poisoned").state
  }

  pub fn counts(&self) -> WorkerCounts {
    WorkerCounts {
      visited: self.visited.load(Ordering::Relaxed),
      run: self.run.load(Ordering::Relaxed),
      passed: self.passed.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      thrown: self.thrown.load(Ordering::Relaxed),
    }
  }

  /// Clear all per-event transient state. Must run between events.
  pub fn reset(&self) {
    let mut inner = self.inner.lock().expect("worker state poisoned");
    inner.state = WorkerState::Ready;
    inner.return_code = false;
    inner.cached_error = None;
    inner.waiters.clear();
    self.work_started.store(false, Ordering::Release);
  }

  /// Run the module body for a run/subrun boundary.
  ///
  /// Entering a worker that is already working is a module-dependency
  /// cycle; entering one that already completed this transition is a
  /// no-op with the recorded outcome.
  pub async fn run_transition(
    &self,
    transition: Transition,
    principal: &Principal,
  ) -> Result<(), ExecutionError> {
    self.visited.fetch_add(1, Ordering::Relaxed);
    if !self.try_claim_sync(principal)? {
      return Ok(());
    }

    let result = self.run_transition_body(transition, principal).await;
    let resolution = self.resolve_transition(transition, result, principal);
    self.finish(resolution).map(|_| ())
  }

  /// Per-event variant for callers that iterate workers in-line: the end
  /// path and the trigger-results summary stage.
  ///
  /// On the end path, SkipEvent and FailPath demote to FailModule - there
  /// is no further path step or event left to skip.
  pub async fn run_event_serial(
    &self,
    principal: &Principal,
    stream: StreamIndex,
    on_end_path: bool,
  ) -> Result<bool, ExecutionError> {
    self.visited.fetch_add(1, Ordering::Relaxed);
    if !self.try_claim_sync(principal)? {
      let inner = self.inner.lock().expect("worker state poisoned");
      return Ok(inner.return_code);
    }

    let result = self.run_event_body(principal, stream).await;
    let resolution = self.resolve_event(result, principal, on_end_path);
    self.finish(resolution)
  }

  /// The dedup/fan-out protocol used by trigger paths.
  ///
  /// The first arrival for the current event claims execution with a
  /// compare-and-swap on the work-started flag and runs the module body;
  /// everyone else waits and observes the identical outcome. Arrivals
  /// after completion read the cached outcome, including the cached
  /// exception of a worker that threw.
  pub async fn run_event(
    &self,
    principal: &Principal,
    stream: StreamIndex,
  ) -> Result<bool, ExecutionError> {
    self.visited.fetch_add(1, Ordering::Relaxed);

    if self
      .work_started
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      {
        let mut inner = self.inner.lock().expect("worker state poisoned");
        inner.state = WorkerState::Working;
      }
      let result = self.run_event_body(principal, stream).await;
      let resolution = self.resolve_event(result, principal, false);
      return self.finish(resolution);
    }

    let pending = {
      let mut inner = self.inner.lock().expect("worker state poisoned");
      match inner.state {
        WorkerState::Pass | WorkerState::Fail => return Ok(inner.return_code),
        WorkerState::ExceptionThrown => {
          return Err(inner.cached_error.clone().unwrap_or_else(|| {
            ExecutionError::WaiterDropped {
              label: self.label.clone(),
            }
          }));
        }
        WorkerState::Ready | WorkerState::Working => {
          let (tx, rx) = oneshot::channel();
          inner.waiters.push(tx);
          rx
        }
      }
    };

    pending.await.unwrap_or_else(|_| {
      Err(ExecutionError::WaiterDropped {
        label: self.label.clone(),
      })
    })
  }

  /// Claim execution for an in-line caller.
  ///
  /// Returns `Ok(true)` when the caller should run the body, `Ok(false)`
  /// when the outcome is already recorded, and the cached error when the
  /// worker previously threw.
  fn try_claim_sync(&self, principal: &Principal) -> Result<bool, ExecutionError> {
    if self
      .work_started
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      let mut inner = self.inner.lock().expect("worker state poisoned");
      inner.state = WorkerState::Working;
      return Ok(true);
    }

    let inner = self.inner.lock().expect("worker state poisoned");
    match inner.state {
      WorkerState::Working | WorkerState::Ready => Err(ExecutionError::DependencyCycle {
        label: self.label.clone(),
        id: principal.id(),
      }),
      WorkerState::Pass | WorkerState::Fail => Ok(false),
      WorkerState::ExceptionThrown => Err(inner.cached_error.clone().unwrap_or_else(|| {
        ExecutionError::WaiterDropped {
          label: self.label.clone(),
        }
      })),
    }
  }

  /// Run the event body, through the serial queue when the module is shared.
  async fn run_event_body(
    &self,
    principal: &Principal,
    stream: StreamIndex,
  ) -> Result<bool, ModuleError> {
    self.observer.notify(ExecutionEvent::ModuleStarted {
      stream,
      label: self.label.clone(),
    });
    self.run.fetch_add(1, Ordering::Relaxed);

    let result = match &self.serializer {
      Some(queue) => {
        let _serial = queue.lock().await;
        self.module.event_module().process_event(principal, stream)
      }
      None => self.module.event_module().process_event(principal, stream),
    };

    self.observer.notify(ExecutionEvent::ModuleFinished {
      stream,
      label: self.label.clone(),
      ok: result.is_ok(),
    });
    result
  }

  async fn run_transition_body(
    &self,
    transition: Transition,
    principal: &Principal,
  ) -> Result<(), ModuleError> {
    self.run.fetch_add(1, Ordering::Relaxed);
    match &self.serializer {
      Some(queue) => {
        let _serial = queue.lock().await;
        self
          .module
          .event_module()
          .process_transition(transition, principal)
      }
      None => self
        .module
        .event_module()
        .process_transition(transition, principal),
    }
  }

  /// Classify an event-body result against the action table.
  fn resolve_event(
    &self,
    result: Result<bool, ModuleError>,
    principal: &Principal,
    on_end_path: bool,
  ) -> Resolution {
    match result {
      Ok(accepted) => {
        if accepted {
          self.passed.fetch_add(1, Ordering::Relaxed);
        } else {
          self.failed.fetch_add(1, Ordering::Relaxed);
        }
        Resolution {
          state: if accepted {
            WorkerState::Pass
          } else {
            WorkerState::Fail
          },
          return_code: accepted,
          error: None,
        }
      }
      Err(err) => {
        let mut action = self.actions.action_for(err.category());
        if on_end_path
          && matches!(action, ModuleAction::SkipEvent | ModuleAction::FailPath)
        {
          action = ModuleAction::FailModule;
        }
        match action {
          ModuleAction::IgnoreCompletely => {
            warn!(
              label = %self.label,
              id = %principal.id(),
              error = %err,
              "module exception ignored"
            );
            self.passed.fetch_add(1, Ordering::Relaxed);
            Resolution {
              state: WorkerState::Pass,
              return_code: true,
              error: None,
            }
          }
          ModuleAction::FailModule => {
            warn!(
              label = %self.label,
              id = %principal.id(),
              error = %err,
              "module failed, continuing"
            );
            self.failed.fetch_add(1, Ordering::Relaxed);
            Resolution {
              state: WorkerState::Fail,
              return_code: true,
              error: None,
            }
          }
          _ => {
            self.thrown.fetch_add(1, Ordering::Relaxed);
            Resolution {
              state: WorkerState::ExceptionThrown,
              return_code: false,
              error: Some(ExecutionError::Module {
                label: self.label.clone(),
                id: principal.id(),
                source: Arc::new(err),
              }),
            }
          }
        }
      }
    }
  }

  fn resolve_transition(
    &self,
    transition: Transition,
    result: Result<(), ModuleError>,
    principal: &Principal,
  ) -> Resolution {
    match result {
      Ok(()) => {
        self.passed.fetch_add(1, Ordering::Relaxed);
        Resolution {
          state: WorkerState::Pass,
          return_code: true,
          error: None,
        }
      }
      Err(err) => match self.actions.action_for(err.category()) {
        ModuleAction::IgnoreCompletely => {
          warn!(
            label = %self.label,
            transition = %transition,
            id = %principal.id(),
            error = %err,
            "module exception ignored"
          );
          self.passed.fetch_add(1, Ordering::Relaxed);
          Resolution {
            state: WorkerState::Pass,
            return_code: true,
            error: None,
          }
        }
        ModuleAction::FailModule => {
          warn!(
            label = %self.label,
            transition = %transition,
            id = %principal.id(),
            error = %err,
            "module failed, continuing"
          );
          self.failed.fetch_add(1, Ordering::Relaxed);
          Resolution {
            state: WorkerState::Fail,
            return_code: true,
            error: None,
          }
        }
        _ => {
          self.thrown.fetch_add(1, Ordering::Relaxed);
          Resolution {
            state: WorkerState::ExceptionThrown,
            return_code: false,
            error: Some(ExecutionError::Module {
              label: self.label.clone(),
              id: principal.id(),
              source: Arc::new(err),
            }),
          }
        }
      },
    }
  }

  /// Record the resolution and resolve every registered waiter with the
  /// identical outcome, exactly once each.
  fn finish(&self, resolution: Resolution) -> Outcome {
    let outcome: Outcome = match &resolution.error {
      Some(e) => Err(e.clone()),
      None => Ok(resolution.return_code),
    };
    let waiters = {
      let mut inner = self.inner.lock().expect("worker state poisoned");
      inner.state = resolution.state;
      inner.return_code = resolution.return_code;
      inner.cached_error = resolution.error;
      std::mem::take(&mut inner.waiters)
    };
    for waiter in waiters {
      let _ = waiter.send(outcome.clone());
    }
    outcome
  }
}

impl std::fmt::Debug for Worker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Worker")
      .field("label", &self.label)
      .field("state", &self.state())
      .finish()
  }
}
