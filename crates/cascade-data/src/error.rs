use thiserror::Error;

use crate::event::EventId;

#[derive(Debug, Error)]
pub enum DataError {
  #[error("product '{label}' already present in principal {id}")]
  DuplicateProduct { label: String, id: EventId },

  #[error("product '{label}' not found in principal {id}")]
  ProductNotFound { label: String, id: EventId },

  #[error("range set for run {expected} cannot absorb event from run {got}")]
  RunMismatch { expected: u32, got: u32 },
}
