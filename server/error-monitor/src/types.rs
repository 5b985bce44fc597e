//! Core types for the error monitor (JSON contracts + internal models).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::MonitorError;

// ---------------------------------------------------------------------------
// Severity / priority / status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

impl Severity {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "low" | "info" => Some(Self::Low),
      "medium" | "warning" | "warn" => Some(Self::Medium),
      "high" | "error" => Some(Self::High),
      "critical" | "fatal" | "crit" => Some(Self::Critical),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Medium => "medium",
      Self::High => "high",
      Self::Critical => "critical",
    }
  }
}

impl Default for Severity {
  fn default() -> Self {
    Self::Medium
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
  Critical,
}

impl Priority {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Medium => "medium",
      Self::High => "high",
      Self::Critical => "critical",
    }
  }

  /// High and critical incidents page admins as soon as they open.
  pub fn is_urgent(self) -> bool {
    self >= Self::High
  }
}

impl From<Severity> for Priority {
  fn from(severity: Severity) -> Self {
    match severity {
      Severity::Low => Self::Low,
      Severity::Medium => Self::Medium,
      Severity::High => Self::High,
      Severity::Critical => Self::Critical,
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
  Open,
  InProgress,
  Escalated,
  Resolved,
  Closed,
}

impl IncidentStatus {
  /// Resolved and Closed incidents leave the active set for the archive.
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Resolved | Self::Closed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Open => "open",
      Self::InProgress => "in_progress",
      Self::Escalated => "escalated",
      Self::Resolved => "resolved",
      Self::Closed => "closed",
    }
  }
}

impl fmt::Display for IncidentStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ---------------------------------------------------------------------------
// Inbound report (JSON contract: what the caller sends)
// ---------------------------------------------------------------------------

/// One error report from application code. Unknown fields are silently ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorReport {
  pub error_type: String,
  pub error_message: String,
  /// Rendered error value (e.g. the exception's `Display`).
  #[serde(default)]
  pub error: String,
  #[serde(default)]
  pub stack_trace: Option<String>,
  #[serde(default)]
  pub user_id: Option<String>,
  #[serde(default)]
  pub screen_name: Option<String>,
  #[serde(default)]
  pub user_action: Option<String>,
  #[serde(default)]
  pub metadata: HashMap<String, Value>,
  /// Accepts common aliases (`warn`, `error`, `fatal`, any case); unrecognized values fall
  /// back to medium.
  #[serde(default, deserialize_with = "severity_loose")]
  pub severity: Severity,
  #[serde(default)]
  pub fatal: bool,
}

fn severity_loose<'de, D>(deserializer: D) -> Result<Severity, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = Option::<String>::deserialize(deserializer)?;
  Ok(match raw {
    None => Severity::default(),
    Some(s) => Severity::from_str_loose(&s).unwrap_or_else(|| {
      tracing::debug!(severity = %s, "unrecognized report severity, using default");
      Severity::default()
    }),
  })
}

impl ErrorReport {
  pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
    Self {
      error_type: error_type.into(),
      error_message: error_message.into(),
      ..Self::default()
    }
  }

  pub fn with_severity(mut self, severity: Severity) -> Self {
    self.severity = severity;
    self
  }

  pub fn with_error(mut self, error: impl Into<String>) -> Self {
    self.error = error.into();
    self
  }

  pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
    self.stack_trace = Some(stack_trace.into());
    self
  }

  pub fn with_screen(mut self, screen_name: impl Into<String>) -> Self {
    self.screen_name = Some(screen_name.into());
    self
  }

  pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
    self.user_id = Some(user_id.into());
    self
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  pub fn fatal(mut self) -> Self {
    self.fatal = true;
    self
  }
}

// ---------------------------------------------------------------------------
// Ingested record
// ---------------------------------------------------------------------------

/// A normalized, immutable error record as kept in history and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorIncident {
  pub id: String,
  pub error_type: String,
  pub error_message: String,
  pub error: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stack_trace: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub screen_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_action: Option<String>,
  #[serde(default)]
  pub metadata: HashMap<String, Value>,
  pub severity: Severity,
  pub fatal: bool,
  pub timestamp: DateTime<Utc>,
  pub environment: String,
  pub app_version: String,
}

// ---------------------------------------------------------------------------
// Thresholds and alerts
// ---------------------------------------------------------------------------

/// Alerting rule for one error type: `max_occurrences` within `time_window_minutes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorThreshold {
  pub error_type: String,
  pub max_occurrences: u32,
  pub time_window_minutes: u64,
  pub alert_severity: Severity,
}

impl ErrorThreshold {
  pub fn new(
    error_type: impl Into<String>,
    max_occurrences: u32,
    time_window_minutes: u64,
    alert_severity: Severity,
  ) -> Self {
    Self {
      error_type: error_type.into(),
      max_occurrences,
      time_window_minutes,
      alert_severity,
    }
  }

  pub fn validate(&self) -> Result<(), MonitorError> {
    if self.error_type.trim().is_empty() {
      return Err(MonitorError::validation("error_type", "must not be empty"));
    }
    if self.max_occurrences == 0 {
      return Err(MonitorError::validation(
        "max_occurrences",
        "must be greater than zero",
      ));
    }
    if self.time_window_minutes == 0 {
      return Err(MonitorError::validation(
        "time_window_minutes",
        "must be greater than zero",
      ));
    }
    Ok(())
  }

  pub fn time_window(&self) -> Duration {
    Duration::minutes(self.time_window_minutes as i64)
  }
}

/// A fired threshold alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
  pub error_type: String,
  pub occurrence_count: usize,
  pub threshold: u32,
  pub time_window_minutes: u64,
  pub severity: Severity,
  pub error_id: String,
  pub fired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tracked incidents
// ---------------------------------------------------------------------------

/// A longer-lived issue promoted from a triggering error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
  pub id: String,
  pub title: String,
  pub description: String,
  pub priority: Priority,
  pub status: IncidentStatus,
  pub error: ErrorIncident,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Outbound notifications
// ---------------------------------------------------------------------------

/// Message for the admin notification sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminNotification {
  pub title: String,
  pub body: String,
  pub data: BTreeMap<String, Value>,
}

impl AdminNotification {
  pub fn for_alert(alert: &Alert) -> Self {
    let mut data = BTreeMap::new();
    data.insert("type".into(), Value::from("error_threshold"));
    data.insert("error_type".into(), Value::from(alert.error_type.clone()));
    data.insert("occurrence_count".into(), Value::from(alert.occurrence_count));
    data.insert("threshold".into(), Value::from(alert.threshold));
    data.insert("time_window_minutes".into(), Value::from(alert.time_window_minutes));
    data.insert("severity".into(), Value::from(alert.severity.as_str()));
    data.insert("error_id".into(), Value::from(alert.error_id.clone()));
    Self {
      title: format!("Error threshold exceeded: {}", alert.error_type),
      body: format!(
        "{} occurrences of {} in the last {} minutes (threshold {})",
        alert.occurrence_count, alert.error_type, alert.time_window_minutes, alert.threshold
      ),
      data,
    }
  }

  pub fn for_new_incident(incident: &Incident) -> Self {
    Self {
      title: format!("New {} priority incident", incident.priority),
      body: incident.title.clone(),
      data: incident_data("incident_created", incident),
    }
  }

  pub fn for_escalation(incident: &Incident) -> Self {
    Self {
      title: format!("Incident escalated: {}", incident.title),
      body: format!(
        "Incident {} has been open since {} without progress",
        incident.id,
        incident.created_at.to_rfc3339()
      ),
      data: incident_data("incident_escalated", incident),
    }
  }
}

fn incident_data(kind: &str, incident: &Incident) -> BTreeMap<String, Value> {
  let mut data = BTreeMap::new();
  data.insert("type".into(), Value::from(kind));
  data.insert("incident_id".into(), Value::from(incident.id.clone()));
  data.insert("priority".into(), Value::from(incident.priority.as_str()));
  data.insert("status".into(), Value::from(incident.status.as_str()));
  data.insert("error_id".into(), Value::from(incident.error.id.clone()));
  data
}
