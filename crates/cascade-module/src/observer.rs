//! Execution events and observers.
//!
//! Events are emitted while schedules process data to allow consumers to
//! observe progress, collect timing, stream to UIs, etc. They are purely
//! informational - the engine never waits on an observer.

use cascade_data::EventId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::handle::StreamIndex;

/// Events emitted during schedule execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// An event has entered a schedule.
  EventStarted { stream: StreamIndex, id: EventId },

  /// An event has left a schedule.
  EventFinished {
    stream: StreamIndex,
    id: EventId,
    passed: bool,
  },

  /// A path has started processing an event.
  PathStarted { stream: StreamIndex, path: String },

  /// A path has finished processing an event.
  PathFinished {
    stream: StreamIndex,
    path: String,
    status: String,
    index: usize,
  },

  /// A module body is about to run.
  ModuleStarted { stream: StreamIndex, label: String },

  /// A module body has finished.
  ModuleFinished {
    stream: StreamIndex,
    label: String,
    ok: bool,
  },

  /// An output module opened its file.
  FileOpened { label: String, sequence: u32 },

  /// An output module closed its file.
  FileClosed { label: String },
}

/// Trait for receiving execution events.
///
/// The engine calls `notify` for each event - implementations decide what
/// to do with them (persist, broadcast, log, ignore, etc.).
pub trait ExecutionObserver: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// An observer that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {
  fn notify(&self, _event: ExecutionEvent) {
    // Intentionally empty
  }
}

/// An observer that sends events to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls the engine; the event volume
/// is a handful per module invocation.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelObserver {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionObserver for ChannelObserver {
  fn notify(&self, event: ExecutionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn channel_observer_forwards_events() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer = ChannelObserver::new(tx);
    observer.notify(ExecutionEvent::PathStarted {
      stream: 0,
      path: "p1".to_string(),
    });
    let event = rx.try_recv().unwrap();
    assert!(matches!(event, ExecutionEvent::PathStarted { .. }));
  }

  #[test]
  fn channel_observer_survives_dropped_receiver() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let observer = ChannelObserver::new(tx);
    observer.notify(ExecutionEvent::FileClosed {
      label: "writer".to_string(),
    });
  }
}
