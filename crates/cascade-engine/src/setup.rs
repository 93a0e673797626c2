//! Schedule construction from configuration plus constructed modules.
//!
//! Module construction itself happens outside the engine: callers
//! register either a per-stream factory (replicated modules) or a single
//! instance (shared modules). The builder binds labels to workers, lays
//! the paths out per stream, and hands back ready-to-run schedules.

use std::collections::HashMap;
use std::sync::Arc;

use cascade_config::PipelineDef;
use cascade_module::{ExecutionObserver, ModuleHandle, ModuleThreading, NoopObserver, StreamIndex};
use cascade_path::{Path, PathRegistry, TriggerBits, WorkerInPath};
use cascade_worker::Worker;

use crate::end_runner::EndPathRunner;
use crate::error::EngineError;
use crate::schedule::Schedule;
use crate::trigger_runner::TriggerPathRunner;

type SerialQueue = Arc<tokio::sync::Mutex<()>>;

/// How one module label is instantiated across streams.
pub enum ModuleBinding {
  /// One instance per stream, built by the factory.
  Replicated(Box<dyn Fn(StreamIndex) -> ModuleHandle + Send + Sync>),
  /// One instance referenced by every stream; the engine serializes its
  /// executions through a per-module queue.
  Shared(ModuleHandle),
}

/// The constructed modules a pipeline's labels resolve against.
#[derive(Default)]
pub struct ModuleSet {
  bindings: HashMap<String, ModuleBinding>,
}

impl ModuleSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, label: impl Into<String>, binding: ModuleBinding) {
    self.bindings.insert(label.into(), binding);
  }

  pub fn register_replicated<F>(&mut self, label: impl Into<String>, factory: F)
  where
    F: Fn(StreamIndex) -> ModuleHandle + Send + Sync + 'static,
  {
    self.register(label, ModuleBinding::Replicated(Box::new(factory)));
  }

  pub fn register_shared(&mut self, label: impl Into<String>, handle: ModuleHandle) {
    self.register(label, ModuleBinding::Shared(handle));
  }

  pub fn contains(&self, label: &str) -> bool {
    self.bindings.contains_key(label)
  }

  fn get(&self, label: &str) -> Option<&ModuleBinding> {
    self.bindings.get(label)
  }
}

/// Builds one [`Schedule`] per stream from a pipeline definition.
pub struct ScheduleBuilder {
  def: PipelineDef,
  modules: ModuleSet,
  observer: Arc<dyn ExecutionObserver>,
}

impl ScheduleBuilder {
  pub fn new(def: PipelineDef, modules: ModuleSet) -> Self {
    Self {
      def,
      modules,
      observer: Arc::new(NoopObserver),
    }
  }

  pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
    self.observer = observer;
    self
  }

  pub fn build(self) -> Result<Vec<Schedule>, EngineError> {
    self.validate()?;

    let actions = Arc::new(self.def.actions.clone());
    let streams = self.def.streams.max(1);

    // One serial queue per shared label, shared by every stream's worker.
    let mut queues: HashMap<String, SerialQueue> = HashMap::new();
    for (label, binding) in &self.modules.bindings {
      if matches!(binding, ModuleBinding::Shared(_)) {
        queues.insert(label.clone(), Arc::new(tokio::sync::Mutex::new(())));
      }
    }

    let mut schedules = Vec::with_capacity(streams);
    for stream in 0..streams {
      let mut workers: HashMap<String, Arc<Worker>> = HashMap::new();

      let bits = Arc::new(TriggerBits::new(self.def.trigger_paths.len()));
      let mut trigger_paths = Vec::with_capacity(self.def.trigger_paths.len());
      for (bit, path_def) in self.def.trigger_paths.iter().enumerate() {
        let mut in_path = Vec::with_capacity(path_def.modules.len());
        for (position, module_use) in path_def.modules.iter().enumerate() {
          let worker = self.worker_for(
            stream,
            &module_use.label,
            &path_def.name,
            &queues,
            &actions,
            &mut workers,
          )?;
          if worker.module().is_output() {
            return Err(EngineError::OutputOnTriggerPath {
              label: module_use.label.clone(),
              path: path_def.name.clone(),
            });
          }
          in_path.push(WorkerInPath::new(worker, module_use.disposition, position));
        }
        trigger_paths.push(Arc::new(Path::trigger(
          path_def.name.clone(),
          bit,
          stream,
          in_path,
          actions.clone(),
          bits.clone(),
          self.observer.clone(),
        )));
      }

      let end_path = match &self.def.end_path {
        Some(path_def) => {
          let mut in_path = Vec::with_capacity(path_def.modules.len());
          for (position, module_use) in path_def.modules.iter().enumerate() {
            let worker = self.worker_for(
              stream,
              &module_use.label,
              &path_def.name,
              &queues,
              &actions,
              &mut workers,
            )?;
            in_path.push(WorkerInPath::new(worker, module_use.disposition, position));
          }
          Some(Arc::new(Path::end(
            path_def.name.clone(),
            stream,
            in_path,
            actions.clone(),
            self.observer.clone(),
          )))
        }
        None => None,
      };

      let results_worker = match &self.def.results_module {
        Some(label) => Some(self.worker_for(
          stream,
          label,
          "<trigger results>",
          &queues,
          &actions,
          &mut workers,
        )?),
        None => None,
      };

      let registry = Arc::new(PathRegistry::new(
        workers,
        trigger_paths,
        end_path.clone(),
        bits,
      ));
      let trigger_runner = TriggerPathRunner::new(
        stream,
        registry.clone(),
        results_worker,
        actions.clone(),
        self.observer.clone(),
      );
      let end_runner = EndPathRunner::new(stream, end_path, self.observer.clone());
      schedules.push(Schedule::new(stream, registry, trigger_runner, end_runner));
    }

    Ok(schedules)
  }

  /// One worker per label per stream, reused when a label appears on
  /// several paths.
  fn worker_for(
    &self,
    stream: StreamIndex,
    label: &str,
    path: &str,
    queues: &HashMap<String, SerialQueue>,
    actions: &Arc<cascade_config::ActionTable>,
    workers: &mut HashMap<String, Arc<Worker>>,
  ) -> Result<Arc<Worker>, EngineError> {
    if let Some(worker) = workers.get(label) {
      return Ok(worker.clone());
    }
    let binding = self
      .modules
      .get(label)
      .ok_or_else(|| EngineError::UnknownModule {
        label: label.to_string(),
        path: path.to_string(),
      })?;
    let (handle, threading, queue) = match binding {
      ModuleBinding::Replicated(factory) => (factory(stream), ModuleThreading::Replicated, None),
      ModuleBinding::Shared(handle) => (
        handle.clone(),
        ModuleThreading::Shared,
        queues.get(label).cloned(),
      ),
    };
    let worker = Arc::new(Worker::new(
      label,
      handle,
      actions.clone(),
      threading,
      queue,
      self.observer.clone(),
    ));
    workers.insert(label.to_string(), worker.clone());
    Ok(worker)
  }

  fn validate(&self) -> Result<(), EngineError> {
    if self.def.trigger_paths.is_empty() && self.def.end_path.is_none() {
      return Err(EngineError::EmptyPipeline {
        name: self.def.name.clone(),
      });
    }
    let mut names = std::collections::HashSet::new();
    for path_def in self.def.trigger_paths.iter().chain(self.def.end_path.iter()) {
      if !names.insert(path_def.name.as_str()) {
        return Err(EngineError::DuplicatePath {
          name: path_def.name.clone(),
        });
      }
    }
    Ok(())
  }
}
