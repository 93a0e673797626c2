//! Channel-driven event loop across schedules.
//!
//! The `PipelineRunner` owns an mpsc channel for incoming principals and
//! drives the whole job: run/subrun boundary sequencing, dispatching
//! events across streams, output writes, and file switching. Boundary
//! work only happens between event batches, when every schedule is
//! quiescent - that is the external synchronization point the per-stream
//! file-switch machinery assumes.

use std::sync::Arc;

use cascade_config::Granularity;
use cascade_data::{EventId, Principal};
use cascade_module::FileBlock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::EngineError;
use crate::schedule::Schedule;

/// Aggregated per-path tallies across streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSummary {
  pub name: String,
  pub run: u64,
  pub passed: u64,
  pub failed: u64,
  pub excepted: u64,
}

/// End-of-job accounting.
#[derive(Debug, Clone)]
pub struct JobSummary {
  pub job_id: String,
  pub events: u64,
  pub passed: u64,
  pub paths: Vec<PathSummary>,
}

/// A runner that processes principals fed through a channel.
///
/// # Usage
///
/// ```ignore
/// let runner = PipelineRunner::new(schedules);
///
/// // Get a sender for the event source
/// let sender = runner.sender();
///
/// // Start the processing loop
/// let cancel = CancellationToken::new();
/// let summary = runner.start(cancel).await?;
/// ```
pub struct PipelineRunner {
  schedules: Vec<Arc<Schedule>>,
  sender: mpsc::Sender<Arc<Principal>>,
  receiver: mpsc::Receiver<Arc<Principal>>,
  job_id: String,
}

impl PipelineRunner {
  pub fn new(schedules: Vec<Schedule>) -> Self {
    Self::with_buffer_size(schedules, 100)
  }

  pub fn with_buffer_size(schedules: Vec<Schedule>, buffer_size: usize) -> Self {
    let (sender, receiver) = mpsc::channel(buffer_size);
    Self {
      schedules: schedules.into_iter().map(Arc::new).collect(),
      sender,
      receiver,
      job_id: uuid::Uuid::new_v4().to_string(),
    }
  }

  pub fn job_id(&self) -> &str {
    &self.job_id
  }

  /// Sender handle for the event source.
  pub fn sender(&self) -> mpsc::Sender<Arc<Principal>> {
    self.sender.clone()
  }

  /// Feed one principal into the job.
  pub async fn feed(&self, principal: Arc<Principal>) -> Result<(), EngineError> {
    self
      .sender
      .send(principal)
      .await
      .map_err(|_| EngineError::ChannelClosed)
  }

  pub fn schedules(&self) -> &[Arc<Schedule>] {
    &self.schedules
  }

  /// Run the job until the channel closes, cancellation fires, or every
  /// output worker reaches its limit.
  pub async fn start(mut self, cancel: CancellationToken) -> Result<JobSummary, EngineError> {
    info!(
      job_id = %self.job_id,
      streams = self.schedules.len(),
      "starting pipeline runner"
    );

    let mut block = FileBlock::first();
    for schedule in &self.schedules {
      schedule.end_runner().open_some_output_files(&block)?;
    }

    // (run, subrun) currently open, if any.
    let mut current: Option<(u32, u32)> = None;
    let mut pending: Option<Arc<Principal>> = None;
    let mut source_done = false;

    loop {
      let first = match pending.take() {
        Some(p) => Some(p),
        None if source_done => None,
        None => tokio::select! {
          _ = cancel.cancelled() => {
            info!(job_id = %self.job_id, "pipeline runner cancelled");
            None
          }
          received = self.receiver.recv() => {
            if received.is_none() {
              source_done = true;
            }
            received
          }
        },
      };
      let Some(first) = first else { break };

      self.enter_boundaries(&mut current, first.id(), &mut block).await?;
      let (run, subrun) = (first.id().run, first.id().subrun);

      // Gather up to one event per stream from the same subrun.
      let mut batch = vec![first];
      let mut boundary_next = false;
      while batch.len() < self.schedules.len() && !boundary_next {
        match self.receiver.try_recv() {
          Ok(p) => {
            if p.id().run == run && p.id().subrun == subrun {
              batch.push(p);
            } else {
              pending = Some(p);
              boundary_next = true;
            }
          }
          Err(TryRecvError::Empty) => break,
          Err(TryRecvError::Disconnected) => {
            source_done = true;
            break;
          }
        }
      }

      // Lookahead says whether the batch tail ends its subrun.
      let tail = batch.len() - 1;
      let handles: Vec<_> = batch
        .into_iter()
        .enumerate()
        .map(|(i, principal)| {
          let schedule = self.schedules[i].clone();
          let last_in_subrun = i == tail && (boundary_next || source_done);
          tokio::spawn(async move { schedule.process_event(principal, last_in_subrun).await })
        })
        .collect();

      for result in futures::future::join_all(handles).await {
        let completed = result.map_err(|e| EngineError::EventTask {
          message: e.to_string(),
        })?;
        if let Err(e) = completed {
          error!(job_id = %self.job_id, error = %e, "event processing failed");
          return Err(e);
        }
      }

      self.maybe_switch_files(Granularity::Event, run, Some(subrun), &mut block)?;

      if self.all_at_limit() {
        info!(
          job_id = %self.job_id,
          "every output worker reports its limit reached, ending job early"
        );
        break;
      }

      if cancel.is_cancelled() {
        info!(job_id = %self.job_id, "pipeline runner cancelled");
        break;
      }
    }

    if let Some((run, subrun)) = current {
      self.leave_subrun(run, subrun, &mut block).await?;
      self.leave_run(run, &mut block).await?;
    }

    let summary = self.summary();
    info!(
      job_id = %self.job_id,
      events = summary.events,
      passed = summary.passed,
      "pipeline runner finished"
    );
    Ok(summary)
  }

  /// Cross the run/subrun boundaries between the open (run, subrun) and
  /// the incoming event's.
  async fn enter_boundaries(
    &self,
    current: &mut Option<(u32, u32)>,
    id: EventId,
    block: &mut FileBlock,
  ) -> Result<(), EngineError> {
    match *current {
      Some((run, subrun)) if run == id.run && subrun == id.subrun => {}
      Some((run, subrun)) if run == id.run => {
        self.leave_subrun(run, subrun, block).await?;
        self.begin_subrun(id.run, id.subrun).await?;
        *current = Some((id.run, id.subrun));
      }
      Some((run, subrun)) => {
        self.leave_subrun(run, subrun, block).await?;
        self.leave_run(run, block).await?;
        self.begin_run(id.run, id.subrun).await?;
        *current = Some((id.run, id.subrun));
      }
      None => {
        self.begin_run(id.run, id.subrun).await?;
        *current = Some((id.run, id.subrun));
      }
    }
    Ok(())
  }

  async fn begin_run(&self, run: u32, subrun: u32) -> Result<(), EngineError> {
    info!(job_id = %self.job_id, run, "begin run");
    for schedule in &self.schedules {
      schedule.begin_run(run).await?;
    }
    self.begin_subrun(run, subrun).await
  }

  async fn begin_subrun(&self, run: u32, subrun: u32) -> Result<(), EngineError> {
    info!(job_id = %self.job_id, run, subrun, "begin subrun");
    for schedule in &self.schedules {
      schedule.begin_subrun(run, subrun).await?;
    }
    Ok(())
  }

  async fn leave_subrun(
    &self,
    run: u32,
    subrun: u32,
    block: &mut FileBlock,
  ) -> Result<(), EngineError> {
    info!(job_id = %self.job_id, run, subrun, "end subrun");
    for schedule in &self.schedules {
      schedule.end_subrun(run, subrun).await?;
      schedule.end_runner().write_subrun(run, subrun)?;
    }
    self.maybe_switch_files(Granularity::SubRun, run, Some(subrun), block)
  }

  async fn leave_run(&self, run: u32, block: &mut FileBlock) -> Result<(), EngineError> {
    info!(job_id = %self.job_id, run, "end run");
    for schedule in &self.schedules {
      schedule.end_run(run).await?;
      schedule.end_runner().write_run(run)?;
    }
    self.maybe_switch_files(Granularity::Run, run, None, block)
  }

  /// Execute the Open -> Switching -> Open sequence on every schedule
  /// that recorded a closure request at this boundary. The forced extra
  /// subrun/run records written while Switching skip the range rebase.
  fn maybe_switch_files(
    &self,
    boundary: Granularity,
    run: u32,
    subrun: Option<u32>,
    block: &mut FileBlock,
  ) -> Result<(), EngineError> {
    let switching: Vec<_> = self
      .schedules
      .iter()
      .filter(|s| s.end_runner().record_output_closure_requests(boundary) > 0)
      .collect();
    if switching.is_empty() {
      return Ok(());
    }

    *block = block.next();
    // Phased across schedules: a shared output file must see every close
    // before any schedule reopens it. Closing is idempotent, so the
    // second schedule's close of an already-closed file is a no-op.
    for schedule in &switching {
      schedule.end_runner().close_some_output_files()?;
    }
    for schedule in &switching {
      let end_runner = schedule.end_runner();
      if let Some(subrun) = subrun {
        end_runner.write_subrun(run, subrun)?;
      }
      end_runner.write_run(run)?;
    }
    for schedule in &switching {
      schedule.end_runner().open_some_output_files(block)?;
    }
    info!(job_id = %self.job_id, sequence = block.sequence, "output files switched");
    Ok(())
  }

  fn all_at_limit(&self) -> bool {
    self
      .schedules
      .iter()
      .all(|s| s.end_runner().all_at_limit())
  }

  /// Aggregate tallies across every stream.
  pub fn summary(&self) -> JobSummary {
    let mut events = 0;
    let mut passed = 0;
    let mut paths: Vec<PathSummary> = Vec::new();

    for schedule in &self.schedules {
      let (total, accepted) = schedule.registry().event_counts();
      events += total;
      passed += accepted;

      let all_paths = schedule.registry().trigger_paths().iter().cloned();
      let end_path = schedule.end_runner().end_path().cloned();
      for path in all_paths.chain(end_path) {
        let counts = path.counts();
        match paths.iter_mut().find(|p| p.name == path.name()) {
          Some(summary) => {
            summary.run += counts.run;
            summary.passed += counts.passed;
            summary.failed += counts.failed;
            summary.excepted += counts.excepted;
          }
          None => paths.push(PathSummary {
            name: path.name().to_string(),
            run: counts.run,
            passed: counts.passed,
            failed: counts.failed,
            excepted: counts.excepted,
          }),
        }
      }
    }

    JobSummary {
      job_id: self.job_id.clone(),
      events,
      passed,
      paths,
    }
  }
}
