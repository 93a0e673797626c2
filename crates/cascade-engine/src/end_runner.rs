//! End-path execution and output-file lifecycle for one stream.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cascade_config::Granularity;
use cascade_data::{Principal, RangeSet, RangeSetTracker};
use cascade_module::{
  ExecutionEvent, ExecutionObserver, FileBlock, OutputModule, StreamIndex, WriteContext,
};
use cascade_path::Path;
use cascade_worker::Worker;
use tracing::info;

use crate::error::EngineError;

/// Output-file lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
  Open,
  Switching,
}

/// One output worker with its switching bookkeeping.
struct OutputBinding {
  worker: Arc<Worker>,
  output: Arc<dyn OutputModule>,
  path_name: String,
  pending_close: AtomicBool,
}

/// Runs the end path after the trigger paths settle, and owns output-file
/// lifecycle: event/run/subrun writes, range-set bookkeeping, and the
/// Open -> Switching -> Open file-switch machine.
pub struct EndPathRunner {
  stream: StreamIndex,
  end_path: Option<Arc<Path>>,
  end_workers: Vec<Arc<Worker>>,
  outputs: Vec<OutputBinding>,
  observer: Arc<dyn ExecutionObserver>,
  file_status: Mutex<FileStatus>,
  run_ranges: Mutex<RangeSetTracker>,
  subrun_ranges: Mutex<RangeSetTracker>,
  events_processed: AtomicU64,
}

impl EndPathRunner {
  pub fn new(
    stream: StreamIndex,
    end_path: Option<Arc<Path>>,
    observer: Arc<dyn ExecutionObserver>,
  ) -> Self {
    let mut seen = HashSet::new();
    let mut end_workers = Vec::new();
    let mut outputs = Vec::new();
    if let Some(path) = &end_path {
      for wip in path.workers() {
        if !seen.insert(wip.worker().label().to_string()) {
          continue;
        }
        end_workers.push(wip.worker().clone());
        if let Some(output) = wip.worker().module().as_output() {
          outputs.push(OutputBinding {
            worker: wip.worker().clone(),
            output: output.clone(),
            path_name: path.name().to_string(),
            pending_close: AtomicBool::new(false),
          });
        }
      }
    }

    Self {
      stream,
      end_path,
      end_workers,
      outputs,
      observer,
      file_status: Mutex::new(FileStatus::Open),
      run_ranges: Mutex::new(RangeSetTracker::for_run(0)),
      subrun_ranges: Mutex::new(RangeSetTracker::for_run(0)),
      events_processed: AtomicU64::new(0),
    }
  }

  pub fn file_status(&self) -> FileStatus {
    *self.file_status.lock().expect("file status poisoned")
  }

  pub fn events_processed(&self) -> u64 {
    self.events_processed.load(Ordering::Relaxed)
  }

  pub fn has_outputs(&self) -> bool {
    !self.outputs.is_empty()
  }

  pub fn end_path(&self) -> Option<&Arc<Path>> {
    self.end_path.as_ref()
  }

  /// Unique end-path workers, reset here rather than by the registry.
  pub fn reset_workers(&self) {
    for worker in &self.end_workers {
      worker.reset();
    }
  }

  /// Run the end path for one event.
  pub async fn process_event(&self, principal: &Arc<Principal>) -> Result<(), EngineError> {
    self.reset_workers();
    self.events_processed.fetch_add(1, Ordering::Relaxed);
    if let Some(path) = &self.end_path {
      path.process_end_path_event(principal, self.stream).await?;
    }
    Ok(())
  }

  /// Write one event through every output worker, then update the
  /// run- and subrun-scoped range trackers.
  pub fn write_event(
    &self,
    principal: &Principal,
    last_in_subrun: bool,
  ) -> Result<(), EngineError> {
    for binding in &self.outputs {
      let ctx = WriteContext::new(&binding.path_name, binding.worker.label());
      binding
        .output
        .write_event(principal, &ctx)
        .map_err(|source| EngineError::Output {
          label: binding.worker.label().to_string(),
          operation: "write_event",
          source,
        })?;
    }
    if !self.outputs.is_empty() {
      let id = principal.id();
      self
        .run_ranges
        .lock()
        .expect("run ranges poisoned")
        .update(id, last_in_subrun)?;
      self
        .subrun_ranges
        .lock()
        .expect("subrun ranges poisoned")
        .update(id, last_in_subrun)?;
    }
    Ok(())
  }

  /// Write the run-scoped record through every output worker.
  ///
  /// Outside a switch the tracked range is rebased - folded into the next
  /// file's bookkeeping. While Switching the rebase is skipped so the
  /// forced extra record written to close out a file is not double-counted.
  pub fn write_run(&self, run: u32) -> Result<(), EngineError> {
    let ranges = self.snapshot(&self.run_ranges);
    for binding in &self.outputs {
      binding
        .output
        .write_run(run, &ranges)
        .map_err(|source| EngineError::Output {
          label: binding.worker.label().to_string(),
          operation: "write_run",
          source,
        })?;
    }
    if self.file_status() != FileStatus::Switching {
      self.run_ranges.lock().expect("run ranges poisoned").rebase();
    }
    Ok(())
  }

  /// Write the subrun-scoped record through every output worker.
  pub fn write_subrun(&self, run: u32, subrun: u32) -> Result<(), EngineError> {
    let ranges = self.snapshot(&self.subrun_ranges);
    for binding in &self.outputs {
      binding
        .output
        .write_subrun(run, subrun, &ranges)
        .map_err(|source| EngineError::Output {
          label: binding.worker.label().to_string(),
          operation: "write_subrun",
          source,
        })?;
    }
    if self.file_status() != FileStatus::Switching {
      self
        .subrun_ranges
        .lock()
        .expect("subrun ranges poisoned")
        .rebase();
    }
    Ok(())
  }

  fn snapshot(&self, tracker: &Mutex<RangeSetTracker>) -> RangeSet {
    let tracker = tracker.lock().expect("range tracker poisoned");
    let mut ranges = tracker.accumulated().clone();
    ranges.collapse();
    ranges
  }

  /// Restart range tracking under a new run.
  pub fn reset_range_trackers(&self, run: u32) {
    self
      .run_ranges
      .lock()
      .expect("run ranges poisoned")
      .reset_for_run(run);
    self
      .subrun_ranges
      .lock()
      .expect("subrun ranges poisoned")
      .reset_for_run(run);
  }

  /// Poll each output worker's close-request predicate at a boundary.
  ///
  /// Workers configured for a coarser granularity than the boundary being
  /// crossed are skipped. Returns how many closures were recorded.
  pub fn record_output_closure_requests(&self, boundary: Granularity) -> usize {
    if self.file_status() == FileStatus::Switching {
      return 0;
    }
    let mut recorded = 0;
    for binding in &self.outputs {
      if !binding.output.granularity().at_least_as_fine_as(boundary) {
        continue;
      }
      if binding.output.requests_to_close() {
        binding.pending_close.store(true, Ordering::Release);
        recorded += 1;
      }
    }
    recorded
  }

  /// Close every pending worker's file and flip to Switching.
  ///
  /// A file already closed by a racing schedule is silently skipped, so
  /// the close hooks fire at most once per file.
  pub fn close_some_output_files(&self) -> Result<(), EngineError> {
    for binding in &self.outputs {
      if !binding.pending_close.swap(false, Ordering::AcqRel) {
        continue;
      }
      if !binding.output.is_file_open() {
        continue;
      }
      binding
        .output
        .close_file()
        .map_err(|source| EngineError::Output {
          label: binding.worker.label().to_string(),
          operation: "close_file",
          source,
        })?;
      info!(
        stream = self.stream,
        label = %binding.worker.label(),
        "output file closed for switching"
      );
      self.observer.notify(ExecutionEvent::FileClosed {
        label: binding.worker.label().to_string(),
      });
    }
    *self.file_status.lock().expect("file status poisoned") = FileStatus::Switching;
    Ok(())
  }

  /// Reopen every closed file under the next file block and flip back to
  /// Open. Also performs the initial open at job start.
  pub fn open_some_output_files(&self, block: &FileBlock) -> Result<(), EngineError> {
    for binding in &self.outputs {
      if binding.output.is_file_open() {
        continue;
      }
      binding
        .output
        .open_file(block)
        .map_err(|source| EngineError::Output {
          label: binding.worker.label().to_string(),
          operation: "open_file",
          source,
        })?;
      info!(
        stream = self.stream,
        label = %binding.worker.label(),
        sequence = block.sequence,
        "output file opened"
      );
      self.observer.notify(ExecutionEvent::FileOpened {
        label: binding.worker.label().to_string(),
        sequence: block.sequence,
      });
    }
    *self.file_status.lock().expect("file status poisoned") = FileStatus::Open;
    Ok(())
  }

  /// True iff every output worker independently reports its limit
  /// reached. False when there are no output workers.
  pub fn all_at_limit(&self) -> bool {
    !self.outputs.is_empty() && self.outputs.iter().all(|b| b.output.limit_reached())
  }
}
