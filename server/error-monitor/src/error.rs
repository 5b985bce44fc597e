//! Structured error types for the error monitor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("initialization failed: {0}")]
  Init(String),

  #[error("persistence: {0}")]
  Persistence(String),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl MonitorError {
  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn init(msg: impl Into<String>) -> Self {
    Self::Init(msg.into())
  }
}
