//! Trigger-path execution for one stream.

use std::sync::Arc;

use cascade_config::{ActionTable, ModuleAction};
use cascade_data::Principal;
use cascade_module::{ExecutionEvent, ExecutionObserver, StreamIndex};
use cascade_path::PathRegistry;
use cascade_worker::Worker;
use tracing::warn;

use crate::error::EngineError;

/// Drives concurrent execution of every trigger path for one event.
///
/// Each path runs as its own task; completion fans back in through
/// `join_all`, whose required count is the trigger-path count. Once every
/// path has answered, the event tally is recorded and the optional
/// trigger-results summary worker runs in-line.
pub struct TriggerPathRunner {
  stream: StreamIndex,
  registry: Arc<PathRegistry>,
  results_worker: Option<Arc<Worker>>,
  actions: Arc<ActionTable>,
  observer: Arc<dyn ExecutionObserver>,
}

impl TriggerPathRunner {
  pub fn new(
    stream: StreamIndex,
    registry: Arc<PathRegistry>,
    results_worker: Option<Arc<Worker>>,
    actions: Arc<ActionTable>,
    observer: Arc<dyn ExecutionObserver>,
  ) -> Self {
    Self {
      stream,
      registry,
      results_worker,
      actions,
      observer,
    }
  }

  pub fn registry(&self) -> &Arc<PathRegistry> {
    &self.registry
  }

  /// Process one event through every trigger path.
  ///
  /// Returns whether the event passed (at least one trigger path
  /// accepted; an event with no trigger paths always passes). The first
  /// exception captured at the fan-in is the one propagated.
  pub async fn process_event(&self, principal: &Arc<Principal>) -> Result<bool, EngineError> {
    self.observer.notify(ExecutionEvent::EventStarted {
      stream: self.stream,
      id: principal.id(),
    });

    self.registry.reset_for_event();
    if let Some(worker) = &self.results_worker {
      worker.reset();
    }

    let paths = self.registry.trigger_paths();
    if !paths.is_empty() {
      let handles: Vec<_> = paths
        .iter()
        .map(|path| {
          let path = path.clone();
          let principal = principal.clone();
          let stream = self.stream;
          tokio::spawn(async move { path.process_trigger_path_event(&principal, stream).await })
        })
        .collect();

      // The fan-in: every path must have answered before we move on.
      let results = futures::future::join_all(handles).await;
      for result in results {
        let completion = result.map_err(|e| EngineError::EventTask {
          message: e.to_string(),
        })?;
        completion?;
      }
    }

    let passed = paths.is_empty() || self.registry.bits().accepted();
    self.registry.record_event(passed);

    self.run_results_stage(principal).await?;

    self.observer.notify(ExecutionEvent::EventFinished {
      stream: self.stream,
      id: principal.id(),
      passed,
    });
    Ok(passed)
  }

  /// Run the trigger-results summary worker, when configured.
  ///
  /// Only SkipEvent is absorbed here; any other escaped action escalates.
  async fn run_results_stage(&self, principal: &Arc<Principal>) -> Result<(), EngineError> {
    let Some(worker) = &self.results_worker else {
      return Ok(());
    };
    match worker.run_event_serial(principal, self.stream, false).await {
      Ok(_) => Ok(()),
      Err(err) => {
        if err.category().map(|c| self.actions.action_for(c)) == Some(ModuleAction::SkipEvent) {
          warn!(
            stream = self.stream,
            label = %worker.label(),
            id = %principal.id(),
            error = %err,
            "trigger results stage skipping event"
          );
          Ok(())
        } else {
          Err(err.into())
        }
      }
    }
  }
}
