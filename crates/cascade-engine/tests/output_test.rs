//! Output-file lifecycle: writes, range bookkeeping, switching, limits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use cascade_config::{ActionTable, Granularity, ModuleUse, PathDef, PipelineDef};
use cascade_data::{EventId, Principal, RangeSet};
use cascade_engine::{FileStatus, ModuleSet, PipelineRunner, ScheduleBuilder};
use cascade_module::{
  EventModule, FileBlock, ModuleError, ModuleHandle, OutputModule, StreamIndex, WriteContext,
};
use tokio_util::sync::CancellationToken;

/// An in-memory output module recording every lifecycle call.
struct MemoryOutput {
  open: AtomicBool,
  opens: AtomicUsize,
  closes: AtomicUsize,
  events_in_file: AtomicUsize,
  events: Mutex<Vec<EventId>>,
  run_records: Mutex<Vec<(u32, RangeSet)>>,
  subrun_records: Mutex<Vec<(u32, u32, RangeSet)>>,
  /// File-switch criterion, reset at every open.
  max_per_file: Option<usize>,
  /// Job-level limit, never reset.
  max_total: Option<usize>,
  granularity: Granularity,
}

impl MemoryOutput {
  fn new() -> Arc<Self> {
    Self::build(None, None, Granularity::Event)
  }

  fn with_per_file_limit(max_per_file: usize, granularity: Granularity) -> Arc<Self> {
    Self::build(Some(max_per_file), None, granularity)
  }

  fn with_total_limit(max_total: usize) -> Arc<Self> {
    Self::build(None, Some(max_total), Granularity::Event)
  }

  fn build(
    max_per_file: Option<usize>,
    max_total: Option<usize>,
    granularity: Granularity,
  ) -> Arc<Self> {
    Arc::new(Self {
      open: AtomicBool::new(false),
      opens: AtomicUsize::new(0),
      closes: AtomicUsize::new(0),
      events_in_file: AtomicUsize::new(0),
      events: Mutex::new(Vec::new()),
      run_records: Mutex::new(Vec::new()),
      subrun_records: Mutex::new(Vec::new()),
      max_per_file,
      max_total,
      granularity,
    })
  }

  fn events_written(&self) -> usize {
    self.events.lock().unwrap().len()
  }
}

impl EventModule for MemoryOutput {
  fn process_event(&self, _p: &Principal, _s: StreamIndex) -> Result<bool, ModuleError> {
    Ok(true)
  }
}

impl OutputModule for MemoryOutput {
  fn open_file(&self, _block: &FileBlock) -> Result<(), ModuleError> {
    self.open.store(true, Ordering::SeqCst);
    self.opens.fetch_add(1, Ordering::SeqCst);
    self.events_in_file.store(0, Ordering::SeqCst);
    Ok(())
  }

  fn close_file(&self) -> Result<(), ModuleError> {
    self.open.store(false, Ordering::SeqCst);
    self.closes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn is_file_open(&self) -> bool {
    self.open.load(Ordering::SeqCst)
  }

  fn write_event(&self, principal: &Principal, _ctx: &WriteContext) -> Result<(), ModuleError> {
    self.events.lock().unwrap().push(principal.id());
    self.events_in_file.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn write_run(&self, run: u32, ranges: &RangeSet) -> Result<(), ModuleError> {
    self.run_records.lock().unwrap().push((run, ranges.clone()));
    Ok(())
  }

  fn write_subrun(&self, run: u32, subrun: u32, ranges: &RangeSet) -> Result<(), ModuleError> {
    self
      .subrun_records
      .lock()
      .unwrap()
      .push((run, subrun, ranges.clone()));
    Ok(())
  }

  fn requests_to_close(&self) -> bool {
    self
      .max_per_file
      .is_some_and(|max| self.events_in_file.load(Ordering::SeqCst) >= max)
  }

  fn limit_reached(&self) -> bool {
    self.max_total.is_some_and(|max| self.events_written() >= max)
  }

  fn granularity(&self) -> Granularity {
    self.granularity
  }
}

struct AcceptAll;

impl EventModule for AcceptAll {
  fn process_event(&self, _p: &Principal, _s: StreamIndex) -> Result<bool, ModuleError> {
    Ok(true)
  }
}

fn output_pipeline() -> PipelineDef {
  PipelineDef {
    name: "write".into(),
    streams: 1,
    trigger_paths: vec![PathDef::new("p1", vec![ModuleUse::normal("accept")])],
    end_path: Some(PathDef::new("out", vec![ModuleUse::normal("writer")])),
    results_module: None,
    actions: ActionTable::new(),
  }
}

fn build_one(output: Arc<MemoryOutput>) -> cascade_engine::Schedule {
  let mut modules = ModuleSet::new();
  modules.register_shared("accept", ModuleHandle::Plain(Arc::new(AcceptAll)));
  modules.register_shared("writer", ModuleHandle::Output(output));
  ScheduleBuilder::new(output_pipeline(), modules)
    .build()
    .unwrap()
    .remove(0)
}

fn principal(run: u32, subrun: u32, event: u64) -> Arc<Principal> {
  Arc::new(Principal::new(EventId::new(run, subrun, event)))
}

#[tokio::test]
async fn write_event_reaches_the_output_and_the_trackers() {
  let output = MemoryOutput::new();
  let schedule = build_one(output.clone());
  let end_runner = schedule.end_runner();

  end_runner.open_some_output_files(&FileBlock::first()).unwrap();
  schedule.begin_run(1).await.unwrap();
  schedule.begin_subrun(1, 1).await.unwrap();

  for event in 1..=3 {
    schedule.process_event(principal(1, 1, event), false).await.unwrap();
  }
  schedule.end_subrun(1, 1).await.unwrap();
  end_runner.write_subrun(1, 1).unwrap();
  schedule.end_run(1).await.unwrap();
  end_runner.write_run(1).unwrap();

  assert_eq!(output.events_written(), 3);
  let subruns = output.subrun_records.lock().unwrap();
  assert_eq!(subruns.len(), 1);
  let (run, subrun, ranges) = &subruns[0];
  assert_eq!((*run, *subrun), (1, 1));
  assert!(ranges.contains(EventId::new(1, 1, 2)));
  let runs = output.run_records.lock().unwrap();
  assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn close_is_idempotent_under_racing_schedules() {
  // Scenario: a racing schedule already closed the file. Closing again
  // must not error and must fire the close hooks zero times.
  let output = MemoryOutput::with_per_file_limit(0, Granularity::Event);
  let schedule = build_one(output.clone());
  let end_runner = schedule.end_runner();

  end_runner.open_some_output_files(&FileBlock::first()).unwrap();
  assert_eq!(end_runner.record_output_closure_requests(Granularity::Event), 1);

  // Simulate the racing schedule.
  output.close_file().unwrap();
  let closes_before = output.closes.load(Ordering::SeqCst);

  end_runner.close_some_output_files().unwrap();
  assert_eq!(
    output.closes.load(Ordering::SeqCst),
    closes_before,
    "close hooks must not fire for an already-closed file"
  );
  assert_eq!(end_runner.file_status(), FileStatus::Switching);
}

#[tokio::test]
async fn coarser_granularity_is_skipped_at_finer_boundaries() {
  let output = MemoryOutput::with_per_file_limit(0, Granularity::Run);
  let schedule = build_one(output.clone());
  let end_runner = schedule.end_runner();

  // Run-granularity worker is not polled at event boundaries.
  assert_eq!(end_runner.record_output_closure_requests(Granularity::Event), 0);
  assert_eq!(end_runner.record_output_closure_requests(Granularity::SubRun), 0);
  assert_eq!(end_runner.record_output_closure_requests(Granularity::Run), 1);
}

#[tokio::test]
async fn switching_skips_the_range_rebase() {
  let output = MemoryOutput::with_per_file_limit(2, Granularity::Event);
  let schedule = build_one(output.clone());
  let end_runner = schedule.end_runner();

  end_runner.open_some_output_files(&FileBlock::first()).unwrap();
  schedule.begin_run(1).await.unwrap();
  schedule.begin_subrun(1, 1).await.unwrap();
  schedule.process_event(principal(1, 1, 1), false).await.unwrap();
  schedule.process_event(principal(1, 1, 2), false).await.unwrap();

  assert_eq!(end_runner.record_output_closure_requests(Granularity::Event), 1);
  end_runner.close_some_output_files().unwrap();
  assert_eq!(end_runner.file_status(), FileStatus::Switching);

  // Forced extra records while switching: written, but the tracked
  // ranges stay put for the record that ends the boundary for real.
  end_runner.write_subrun(1, 1).unwrap();
  end_runner.write_run(1).unwrap();
  {
    let subruns = output.subrun_records.lock().unwrap();
    assert!(!subruns[0].2.is_empty());
  }

  end_runner.open_some_output_files(&FileBlock::first().next()).unwrap();
  assert_eq!(end_runner.file_status(), FileStatus::Open);

  // Now the boundary ends while Open: same ranges again, then rebased.
  end_runner.write_subrun(1, 1).unwrap();
  {
    let subruns = output.subrun_records.lock().unwrap();
    assert_eq!(subruns[0].2, subruns[1].2, "switching must not drop tracked ranges");
  }
  end_runner.write_subrun(1, 1).unwrap();
  {
    let subruns = output.subrun_records.lock().unwrap();
    assert!(subruns[2].2.is_empty(), "the open-state write must rebase");
  }
}

#[tokio::test]
async fn all_at_limit_requires_every_output() {
  // No output workers: never at limit.
  let mut modules = ModuleSet::new();
  modules.register_shared("accept", ModuleHandle::Plain(Arc::new(AcceptAll)));
  let def = PipelineDef {
    name: "bare".into(),
    streams: 1,
    trigger_paths: vec![PathDef::new("p1", vec![ModuleUse::normal("accept")])],
    end_path: None,
    results_module: None,
    actions: ActionTable::new(),
  };
  let schedules = ScheduleBuilder::new(def, modules).build().unwrap();
  assert!(!schedules[0].end_runner().all_at_limit());

  // Two outputs, one at limit: not all at limit.
  let at_limit = MemoryOutput::with_total_limit(0);
  let unlimited = MemoryOutput::new();
  let mut modules = ModuleSet::new();
  modules.register_shared("accept", ModuleHandle::Plain(Arc::new(AcceptAll)));
  modules.register_shared("w1", ModuleHandle::Output(at_limit.clone()));
  modules.register_shared("w2", ModuleHandle::Output(unlimited.clone()));
  let def = PipelineDef {
    name: "two".into(),
    streams: 1,
    trigger_paths: vec![PathDef::new("p1", vec![ModuleUse::normal("accept")])],
    end_path: Some(PathDef::new(
      "out",
      vec![ModuleUse::normal("w1"), ModuleUse::normal("w2")],
    )),
    results_module: None,
    actions: ActionTable::new(),
  };
  let schedules = ScheduleBuilder::new(def, modules).build().unwrap();
  assert!(!schedules[0].end_runner().all_at_limit());

  // Both at limit: job can end early.
  let w1 = MemoryOutput::with_total_limit(0);
  let w2 = MemoryOutput::with_total_limit(0);
  let mut modules = ModuleSet::new();
  modules.register_shared("accept", ModuleHandle::Plain(Arc::new(AcceptAll)));
  modules.register_shared("w1", ModuleHandle::Output(w1));
  modules.register_shared("w2", ModuleHandle::Output(w2));
  let def = PipelineDef {
    name: "both".into(),
    streams: 1,
    trigger_paths: vec![PathDef::new("p1", vec![ModuleUse::normal("accept")])],
    end_path: Some(PathDef::new(
      "out",
      vec![ModuleUse::normal("w1"), ModuleUse::normal("w2")],
    )),
    results_module: None,
    actions: ActionTable::new(),
  };
  let schedules = ScheduleBuilder::new(def, modules).build().unwrap();
  assert!(schedules[0].end_runner().all_at_limit());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_drives_boundaries_writes_and_switches() {
  let output = MemoryOutput::with_per_file_limit(2, Granularity::Event);
  let mut modules = ModuleSet::new();
  modules.register_shared("accept", ModuleHandle::Plain(Arc::new(AcceptAll)));
  modules.register_shared("writer", ModuleHandle::Output(output.clone()));

  let schedules = ScheduleBuilder::new(output_pipeline(), modules).build().unwrap();
  let runner = PipelineRunner::new(schedules);
  let sender = runner.sender();

  let feeder = tokio::spawn(async move {
    for (run, subrun, event) in [(1, 1, 1), (1, 1, 2), (1, 2, 3), (2, 1, 4)] {
      sender.send(principal(run, subrun, event)).await.unwrap();
    }
    // Dropping the sender ends the job.
  });

  let summary = runner.start(CancellationToken::new()).await.unwrap();
  feeder.await.unwrap();

  assert_eq!(summary.events, 4);
  assert_eq!(summary.passed, 4);
  assert_eq!(output.events_written(), 4);

  // Every file generation was opened; the 2-event limit forced at least
  // one switch along the way.
  assert!(output.opens.load(Ordering::SeqCst) >= 2);
  assert!(output.closes.load(Ordering::SeqCst) >= 1);

  // Boundary records exist for both runs and all three subruns.
  let runs = output.run_records.lock().unwrap();
  assert!(runs.iter().any(|(run, _)| *run == 1));
  assert!(runs.iter().any(|(run, _)| *run == 2));
  let subruns = output.subrun_records.lock().unwrap();
  assert!(subruns.iter().any(|(r, s, _)| (*r, *s) == (1, 1)));
  assert!(subruns.iter().any(|(r, s, _)| (*r, *s) == (1, 2)));
  assert!(subruns.iter().any(|(r, s, _)| (*r, *s) == (2, 1)));
}

#[tokio::test]
async fn runner_cancellation_exits_cleanly() {
  let mut modules = ModuleSet::new();
  modules.register_shared("accept", ModuleHandle::Plain(Arc::new(AcceptAll)));
  let def = PipelineDef {
    name: "cancelled".into(),
    streams: 1,
    trigger_paths: vec![PathDef::new("p1", vec![ModuleUse::normal("accept")])],
    end_path: None,
    results_module: None,
    actions: ActionTable::new(),
  };
  let schedules = ScheduleBuilder::new(def, modules).build().unwrap();
  let runner = PipelineRunner::new(schedules);

  let cancel = CancellationToken::new();
  let handle = {
    let cancel = cancel.clone();
    tokio::spawn(async move { runner.start(cancel).await })
  };

  tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  cancel.cancel();

  let summary = handle.await.unwrap().unwrap();
  assert_eq!(summary.events, 0);
}
