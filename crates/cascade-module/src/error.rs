use thiserror::Error;

/// An error raised by a module body.
///
/// The `category` is what the action table keys on; the message is for
/// operators. Categories are free-form, chosen by module authors.
#[derive(Debug, Clone, Error)]
#[error("{category}: {message}")]
pub struct ModuleError {
  category: String,
  message: String,
}

impl ModuleError {
  pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      category: category.into(),
      message: message.into(),
    }
  }

  pub fn category(&self) -> &str {
    &self.category
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}
