//! Path protocol behavior: ordering, early termination, dedup across
//! paths, and end-path observer semantics.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cascade_config::{ActionTable, FilterDisposition, ModuleAction};
use cascade_data::{EventId, Principal, Transition};
use cascade_module::{
  EventModule, ModuleError, ModuleHandle, ModuleThreading, NoopObserver, StreamIndex,
};
use cascade_path::{Path, PathRegistry, PathState, TriggerBits, WorkerInPath};
use cascade_worker::{ExecutionError, Worker};

#[derive(Clone, Copy)]
enum Behavior {
  Accept,
  Reject,
  Error(&'static str),
}

struct ScriptedModule {
  behavior: Behavior,
  runs: AtomicUsize,
}

impl ScriptedModule {
  fn new(behavior: Behavior) -> Arc<Self> {
    Arc::new(Self {
      behavior,
      runs: AtomicUsize::new(0),
    })
  }

  fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }
}

impl EventModule for ScriptedModule {
  fn process_event(&self, _p: &Principal, _s: StreamIndex) -> Result<bool, ModuleError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    match self.behavior {
      Behavior::Accept => Ok(true),
      Behavior::Reject => Ok(false),
      Behavior::Error(category) => Err(ModuleError::new(category, "scripted failure")),
    }
  }

  fn process_transition(&self, _t: Transition, _p: &Principal) -> Result<(), ModuleError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    match self.behavior {
      Behavior::Error(category) => Err(ModuleError::new(category, "scripted failure")),
      _ => Ok(()),
    }
  }
}

struct Fixture {
  actions: Arc<ActionTable>,
}

impl Fixture {
  fn new(actions: ActionTable) -> Self {
    Self {
      actions: Arc::new(actions),
    }
  }

  fn worker(&self, label: &str, module: Arc<ScriptedModule>) -> Arc<Worker> {
    Arc::new(Worker::new(
      label,
      ModuleHandle::Plain(module),
      self.actions.clone(),
      ModuleThreading::Replicated,
      None,
      Arc::new(NoopObserver),
    ))
  }

  fn trigger_path(
    &self,
    name: &str,
    bit: usize,
    bits: Arc<TriggerBits>,
    workers: Vec<Arc<Worker>>,
  ) -> Arc<Path> {
    let in_path = workers
      .into_iter()
      .enumerate()
      .map(|(i, w)| WorkerInPath::new(w, FilterDisposition::Normal, i))
      .collect();
    Arc::new(Path::trigger(
      name,
      bit,
      0,
      in_path,
      self.actions.clone(),
      bits,
      Arc::new(NoopObserver),
    ))
  }
}

fn principal() -> Principal {
  Principal::new(EventId::new(1, 1, 7))
}

#[tokio::test]
async fn rejection_stops_the_path_and_records_the_index() {
  let fixture = Fixture::new(ActionTable::new());
  let producer = ScriptedModule::new(Behavior::Accept);
  let filter = ScriptedModule::new(Behavior::Reject);
  let downstream = ScriptedModule::new(Behavior::Accept);
  let bits = Arc::new(TriggerBits::new(1));

  let path = fixture.trigger_path(
    "p1",
    0,
    bits.clone(),
    vec![
      fixture.worker("producer", producer.clone()),
      fixture.worker("filter", filter.clone()),
      fixture.worker("downstream", downstream.clone()),
    ],
  );

  path.process_trigger_path_event(&principal(), 0).await.unwrap();

  assert_eq!(path.state(), PathState::Fail);
  assert_eq!(producer.runs(), 1);
  assert_eq!(filter.runs(), 1);
  assert_eq!(downstream.runs(), 0, "workers after a rejection must not run");

  let status = bits.status(0);
  assert_eq!(status.state, PathState::Fail);
  assert_eq!(status.index, 2);
  assert_eq!(path.counts().failed, 1);
}

#[tokio::test]
async fn empty_path_resolves_pass_with_index_zero() {
  let fixture = Fixture::new(ActionTable::new());
  let bits = Arc::new(TriggerBits::new(1));
  let path = fixture.trigger_path("empty", 0, bits.clone(), vec![]);

  path.process_trigger_path_event(&principal(), 0).await.unwrap();

  assert_eq!(path.state(), PathState::Pass);
  let status = bits.status(0);
  assert_eq!(status.state, PathState::Pass);
  assert_eq!(status.index, 0);
}

#[tokio::test]
async fn veto_disposition_inverts_the_answer() {
  let fixture = Fixture::new(ActionTable::new());
  let rejecting = ScriptedModule::new(Behavior::Reject);
  let downstream = ScriptedModule::new(Behavior::Accept);
  let bits = Arc::new(TriggerBits::new(1));

  let in_path = vec![
    WorkerInPath::new(
      fixture.worker("vetoed", rejecting),
      FilterDisposition::Veto,
      0,
    ),
    WorkerInPath::new(
      fixture.worker("downstream", downstream.clone()),
      FilterDisposition::Normal,
      1,
    ),
  ];
  let path = Arc::new(Path::trigger(
    "veto_path",
    0,
    0,
    in_path,
    fixture.actions.clone(),
    bits.clone(),
    Arc::new(NoopObserver),
  ));

  path.process_trigger_path_event(&principal(), 0).await.unwrap();

  assert_eq!(path.state(), PathState::Pass);
  assert_eq!(downstream.runs(), 1, "a vetoed rejection keeps the path going");
}

#[tokio::test]
async fn fail_path_stops_without_propagating() {
  let mut actions = ActionTable::new();
  actions.insert("give_up", ModuleAction::FailPath);
  let fixture = Fixture::new(actions);
  let failing = ScriptedModule::new(Behavior::Error("give_up"));
  let downstream = ScriptedModule::new(Behavior::Accept);
  let bits = Arc::new(TriggerBits::new(1));

  let path = fixture.trigger_path(
    "p1",
    0,
    bits.clone(),
    vec![
      fixture.worker("failing", failing),
      fixture.worker("downstream", downstream.clone()),
    ],
  );

  // FailPath is absorbed at the path level.
  path.process_trigger_path_event(&principal(), 0).await.unwrap();

  assert_eq!(path.state(), PathState::Fail);
  assert_eq!(downstream.runs(), 0);
  assert_eq!(bits.status(0).state, PathState::Fail);
}

#[tokio::test]
async fn unabsorbed_exception_propagates_with_path_identity() {
  let fixture = Fixture::new(ActionTable::new());
  let failing = ScriptedModule::new(Behavior::Error("fatal"));
  let downstream = ScriptedModule::new(Behavior::Accept);
  let bits = Arc::new(TriggerBits::new(1));

  let path = fixture.trigger_path(
    "p1",
    0,
    bits.clone(),
    vec![
      fixture.worker("failing", failing),
      fixture.worker("downstream", downstream.clone()),
    ],
  );

  let err = path
    .process_trigger_path_event(&principal(), 0)
    .await
    .unwrap_err();

  assert!(matches!(err, ExecutionError::Path { .. }));
  assert_eq!(err.category(), Some("fatal"));
  assert_eq!(path.state(), PathState::Exception);
  assert_eq!(downstream.runs(), 0);
  assert_eq!(bits.status(0).state, PathState::Exception);
  assert_eq!(path.counts().excepted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_worker_runs_once_across_sibling_paths() {
  let fixture = Fixture::new(ActionTable::new());
  let shared_module = ScriptedModule::new(Behavior::Accept);
  let shared_worker = fixture.worker("shared_producer", shared_module.clone());
  let bits = Arc::new(TriggerBits::new(2));

  let p1 = fixture.trigger_path("p1", 0, bits.clone(), vec![shared_worker.clone()]);
  let p2 = fixture.trigger_path("p2", 1, bits.clone(), vec![shared_worker.clone()]);

  let p = Arc::new(principal());
  let h1 = {
    let (p1, p) = (p1.clone(), p.clone());
    tokio::spawn(async move { p1.process_trigger_path_event(&p, 0).await })
  };
  let h2 = {
    let (p2, p) = (p2.clone(), p.clone());
    tokio::spawn(async move { p2.process_trigger_path_event(&p, 0).await })
  };
  h1.await.unwrap().unwrap();
  h2.await.unwrap().unwrap();

  assert_eq!(shared_module.runs(), 1, "module body must run exactly once");
  assert_eq!(bits.status(0).state, PathState::Pass);
  assert_eq!(bits.status(1).state, PathState::Pass);
}

#[tokio::test]
async fn end_path_ignores_rejections() {
  let fixture = Fixture::new(ActionTable::new());
  let rejecting = ScriptedModule::new(Behavior::Reject);
  let observer_module = ScriptedModule::new(Behavior::Accept);

  let in_path = vec![
    WorkerInPath::new(
      fixture.worker("rejecting", rejecting.clone()),
      FilterDisposition::Normal,
      0,
    ),
    WorkerInPath::new(
      fixture.worker("observer", observer_module.clone()),
      FilterDisposition::Normal,
      1,
    ),
  ];
  let path = Path::end(
    "end",
    0,
    in_path,
    fixture.actions.clone(),
    Arc::new(NoopObserver),
  );

  path.process_end_path_event(&principal(), 0).await.unwrap();

  assert_eq!(path.state(), PathState::Pass, "end path passes unless a worker threw");
  assert_eq!(observer_module.runs(), 1, "rejection must not stop end-path iteration");
  assert_eq!(path.workers()[0].return_code(), Some(false));
}

#[tokio::test]
async fn end_path_exception_propagates() {
  let fixture = Fixture::new(ActionTable::new());
  let failing = ScriptedModule::new(Behavior::Error("fatal"));
  let path = Path::end(
    "end",
    0,
    vec![WorkerInPath::new(
      fixture.worker("failing", failing),
      FilterDisposition::Normal,
      0,
    )],
    fixture.actions.clone(),
    Arc::new(NoopObserver),
  );

  let err = path.process_end_path_event(&principal(), 0).await.unwrap_err();
  assert_eq!(err.category(), Some("fatal"));
  assert_eq!(path.state(), PathState::Exception);
}

#[tokio::test]
async fn transition_failure_marks_the_path() {
  let mut actions = ActionTable::new();
  actions.insert("flaky", ModuleAction::FailModule);
  let fixture = Fixture::new(actions);
  let flaky = ScriptedModule::new(Behavior::Error("flaky"));
  let bits = Arc::new(TriggerBits::new(1));
  let path = fixture.trigger_path("p1", 0, bits, vec![fixture.worker("flaky", flaky)]);

  let boundary = Principal::new(EventId::run_boundary(2));
  path
    .process_transition(Transition::BeginRun, &boundary)
    .await
    .unwrap();
  assert_eq!(path.state(), PathState::Fail);
}

#[tokio::test]
async fn registry_reset_restores_everything_between_events() {
  let fixture = Fixture::new(ActionTable::new());
  let shared_module = ScriptedModule::new(Behavior::Reject);
  let shared_worker = fixture.worker("shared", shared_module.clone());
  let bits = Arc::new(TriggerBits::new(2));

  let p1 = fixture.trigger_path("p1", 0, bits.clone(), vec![shared_worker.clone()]);
  let p2 = fixture.trigger_path("p2", 1, bits.clone(), vec![shared_worker.clone()]);

  let mut workers = std::collections::HashMap::new();
  workers.insert("shared".to_string(), shared_worker.clone());
  let registry = PathRegistry::new(workers, vec![p1.clone(), p2.clone()], None, bits.clone());

  let p = principal();
  p1.process_trigger_path_event(&p, 0).await.unwrap();
  p2.process_trigger_path_event(&p, 0).await.unwrap();
  assert_eq!(p1.state(), PathState::Fail);
  assert_eq!(shared_module.runs(), 1);

  registry.reset_for_event();
  assert_eq!(p1.state(), PathState::Ready);
  assert_eq!(p2.state(), PathState::Ready);
  assert_eq!(bits.status(0).state, PathState::Ready);
  assert!(p1.workers()[0].return_code().is_none());

  // The next event runs the module body again.
  let next = Principal::new(EventId::new(1, 1, 8));
  p1.process_trigger_path_event(&next, 0).await.unwrap();
  assert_eq!(shared_module.runs(), 2);

  registry.record_event(false);
  assert_eq!(registry.event_counts(), (1, 0));
}
