//! One independent processing stream.

use std::sync::Arc;

use cascade_data::{EventId, Principal, Transition};
use cascade_module::StreamIndex;
use cascade_path::PathRegistry;

use crate::end_runner::EndPathRunner;
use crate::error::EngineError;
use crate::trigger_runner::TriggerPathRunner;

/// An independent replica of the whole path graph, processing its own
/// sequence of events.
pub struct Schedule {
  stream: StreamIndex,
  registry: Arc<PathRegistry>,
  trigger_runner: TriggerPathRunner,
  end_runner: EndPathRunner,
}

impl std::fmt::Debug for Schedule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Schedule")
      .field("stream", &self.stream)
      .finish_non_exhaustive()
  }
}

impl Schedule {
  pub fn new(
    stream: StreamIndex,
    registry: Arc<PathRegistry>,
    trigger_runner: TriggerPathRunner,
    end_runner: EndPathRunner,
  ) -> Self {
    Self {
      stream,
      registry,
      trigger_runner,
      end_runner,
    }
  }

  pub fn stream(&self) -> StreamIndex {
    self.stream
  }

  pub fn registry(&self) -> &Arc<PathRegistry> {
    &self.registry
  }

  pub fn end_runner(&self) -> &EndPathRunner {
    &self.end_runner
  }

  /// Process one event: trigger paths, then the end path, then the
  /// output writes.
  pub async fn process_event(
    &self,
    principal: Arc<Principal>,
    last_in_subrun: bool,
  ) -> Result<bool, EngineError> {
    let id = principal.id();
    let passed = self
      .trigger_runner
      .process_event(&principal)
      .await
      .map_err(|e| self.wrap(e, id))?;
    self
      .end_runner
      .process_event(&principal)
      .await
      .map_err(|e| self.wrap(e, id))?;
    self
      .end_runner
      .write_event(&principal, last_in_subrun)
      .map_err(|e| self.wrap(e, id))?;
    Ok(passed)
  }

  pub async fn begin_run(&self, run: u32) -> Result<(), EngineError> {
    self.end_runner.reset_range_trackers(run);
    self
      .process_transition(Transition::BeginRun, EventId::run_boundary(run))
      .await
  }

  pub async fn end_run(&self, run: u32) -> Result<(), EngineError> {
    self
      .process_transition(Transition::EndRun, EventId::run_boundary(run))
      .await
  }

  pub async fn begin_subrun(&self, run: u32, subrun: u32) -> Result<(), EngineError> {
    self
      .process_transition(Transition::BeginSubRun, EventId::subrun_boundary(run, subrun))
      .await
  }

  pub async fn end_subrun(&self, run: u32, subrun: u32) -> Result<(), EngineError> {
    self
      .process_transition(Transition::EndSubRun, EventId::subrun_boundary(run, subrun))
      .await
  }

  /// Run a boundary transition through every path, trigger paths first.
  async fn process_transition(
    &self,
    transition: Transition,
    id: EventId,
  ) -> Result<(), EngineError> {
    let principal = Principal::new(id);
    self.registry.reset_for_event();
    self.end_runner.reset_workers();
    for path in self.registry.trigger_paths() {
      path
        .process_transition(transition, &principal)
        .await
        .map_err(|e| self.wrap(e.into(), id))?;
    }
    if let Some(end_path) = self.end_runner.end_path() {
      end_path
        .process_transition(transition, &principal)
        .await
        .map_err(|e| self.wrap(e.into(), id))?;
    }
    Ok(())
  }

  /// Attach the schedule-execution-failure marker to escaping errors.
  fn wrap(&self, err: EngineError, id: EventId) -> EngineError {
    match err {
      EngineError::Execution(e) => EngineError::Execution(e.in_schedule(self.stream, id)),
      other => other,
    }
  }
}
