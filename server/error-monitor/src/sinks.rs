//! Ports to the outside world: persistence, admin notification, analytics.
//!
//! All three are best-effort from the engine's point of view except `PersistenceAdapter::load`
//! during initialization.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::snapshot::STATE_KEY;
use crate::types::AdminNotification;

#[derive(Error, Debug)]
pub enum SinkError {
  #[error("backend unavailable: {0}")]
  Unavailable(String),
  #[error("operation failed: {0}")]
  Failed(String),
}

/// Key-value snapshot store holding the serialized monitor state.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
  /// Load the stored blob, `None` when nothing has been saved yet.
  ///
  /// # Errors
  ///
  /// Returns `SinkError` when the backend cannot be reached.
  async fn load(&self) -> Result<Option<String>, SinkError>;

  /// Replace the stored blob.
  ///
  /// # Errors
  ///
  /// Returns `SinkError` when the write fails.
  async fn save(&self, blob: String) -> Result<(), SinkError>;
}

/// Admin-facing alert delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
  /// # Errors
  ///
  /// Returns `SinkError` when the notification could not be delivered.
  async fn notify_admins(&self, notification: &AdminNotification) -> Result<(), SinkError>;
}

/// Telemetry backend.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
  /// # Errors
  ///
  /// Returns `SinkError` when the event could not be recorded.
  async fn log_event(&self, name: &str, parameters: &BTreeMap<String, Value>)
    -> Result<(), SinkError>;

  /// # Errors
  ///
  /// Returns `SinkError` when the error could not be recorded.
  async fn record_error(
    &self,
    error: &str,
    stack_trace: Option<&str>,
    metadata: &HashMap<String, Value>,
    fatal: bool,
  ) -> Result<(), SinkError>;
}

/// Sink that drops everything, for hosts without notification or analytics backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
  async fn notify_admins(&self, notification: &AdminNotification) -> Result<(), SinkError> {
    tracing::debug!(title = %notification.title, "admin notification dropped (no sink)");
    Ok(())
  }
}

#[async_trait]
impl AnalyticsSink for NoopSink {
  async fn log_event(
    &self,
    _name: &str,
    _parameters: &BTreeMap<String, Value>,
  ) -> Result<(), SinkError> {
    Ok(())
  }

  async fn record_error(
    &self,
    _error: &str,
    _stack_trace: Option<&str>,
    _metadata: &HashMap<String, Value>,
    _fatal: bool,
  ) -> Result<(), SinkError> {
    Ok(())
  }
}

/// Key-value persistence held in process memory, for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
  entries: Mutex<HashMap<String, String>>,
  saves: Mutex<usize>,
}

impl InMemoryPersistence {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start with an already-stored blob.
  pub fn with_blob(blob: impl Into<String>) -> Self {
    let mut entries = HashMap::new();
    entries.insert(STATE_KEY.to_string(), blob.into());
    Self {
      entries: Mutex::new(entries),
      saves: Mutex::new(0),
    }
  }

  pub fn blob(&self) -> Option<String> {
    self
      .entries
      .lock()
      .ok()
      .and_then(|entries| entries.get(STATE_KEY).cloned())
  }

  pub fn save_count(&self) -> usize {
    self.saves.lock().map(|n| *n).unwrap_or(0)
  }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
  async fn load(&self) -> Result<Option<String>, SinkError> {
    self
      .entries
      .lock()
      .map(|entries| entries.get(STATE_KEY).cloned())
      .map_err(|_| SinkError::Unavailable("lock poisoned".into()))
  }

  async fn save(&self, blob: String) -> Result<(), SinkError> {
    self
      .entries
      .lock()
      .map_err(|_| SinkError::Failed("lock poisoned".into()))?
      .insert(STATE_KEY.to_string(), blob);
    if let Ok(mut n) = self.saves.lock() {
      *n += 1;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sink_error_display() {
    let err = SinkError::Unavailable("firestore".to_string());
    assert_eq!(err.to_string(), "backend unavailable: firestore");
    let err = SinkError::Failed("quota".to_string());
    assert_eq!(err.to_string(), "operation failed: quota");
  }

  #[tokio::test]
  async fn in_memory_persistence_round_trip() {
    let store = InMemoryPersistence::new();
    assert_eq!(store.load().await.unwrap(), None);
    store.save("{}".into()).await.unwrap();
    assert_eq!(store.load().await.unwrap().as_deref(), Some("{}"));
    assert_eq!(store.save_count(), 1);
  }

  #[tokio::test]
  async fn noop_sink_accepts_everything() {
    let sink = NoopSink;
    let n = AdminNotification {
      title: "t".into(),
      body: "b".into(),
      data: BTreeMap::new(),
    };
    assert!(sink.notify_admins(&n).await.is_ok());
    assert!(sink.log_event("e", &BTreeMap::new()).await.is_ok());
  }
}
