//! Engine configuration with sane defaults.

use chrono::Duration;
use serde::Deserialize;

use crate::error::MonitorError;
use crate::types::{ErrorThreshold, Severity};

/// Tunable capacities, windows and timer intervals.
///
/// Partial JSON documents are accepted; missing fields keep their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Max records kept per error type.
  pub max_error_history: usize,
  /// Max records kept in the global recent list.
  pub max_recent_errors: usize,
  /// Max resolved/closed incidents kept in the archive.
  pub max_incident_history: usize,
  /// Minimum minutes between two alerts of the same error type.
  pub alert_cooldown_minutes: u64,
  /// Records older than this are dropped by the retention sweep.
  pub retention_days: u64,
  pub retention_sweep_interval_minutes: u64,
  /// Open incidents older than this are escalated.
  pub incident_timeout_minutes: u64,
  pub incident_sweep_interval_minutes: u64,
  /// Accepted samples kept per metric for the baseline mean.
  pub baseline_window: usize,
  /// Samples needed before a baseline is computed on ingestion.
  pub baseline_min_samples: usize,
  /// Percent above baseline that counts as a regression.
  pub degradation_threshold_percent: f64,
  pub baseline_refresh_interval_minutes: u64,
  pub top_errors_limit: usize,
  /// Alerts at or above this severity open an incident.
  pub auto_incident_severity: Severity,
  pub environment: String,
  pub app_version: String,
  pub default_thresholds: Vec<ErrorThreshold>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      max_error_history: 1000,
      max_recent_errors: 100,
      max_incident_history: 500,
      alert_cooldown_minutes: 15,
      retention_days: 7,
      retention_sweep_interval_minutes: 60,
      incident_timeout_minutes: 120,
      incident_sweep_interval_minutes: 30,
      baseline_window: 20,
      baseline_min_samples: 5,
      degradation_threshold_percent: 50.0,
      baseline_refresh_interval_minutes: 60,
      top_errors_limit: 5,
      auto_incident_severity: Severity::High,
      environment: "production".into(),
      app_version: "unknown".into(),
      default_thresholds: vec![
        ErrorThreshold::new("network_error", 10, 5, Severity::High),
        ErrorThreshold::new("authentication_error", 5, 10, Severity::High),
        ErrorThreshold::new("payment_error", 3, 15, Severity::Critical),
        ErrorThreshold::new("performance_degradation", 5, 30, Severity::Medium),
      ],
    }
  }
}

impl Config {
  /// Parse a (possibly partial) JSON document and validate the result.
  pub fn from_json_str(json: &str) -> Result<Self, MonitorError> {
    let config: Config = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Reject configurations that would make the engine degenerate.
  pub fn validate(&self) -> Result<(), MonitorError> {
    let positive = [
      ("max_error_history", self.max_error_history as u64),
      ("max_recent_errors", self.max_recent_errors as u64),
      ("max_incident_history", self.max_incident_history as u64),
      ("retention_days", self.retention_days),
      ("retention_sweep_interval_minutes", self.retention_sweep_interval_minutes),
      ("incident_timeout_minutes", self.incident_timeout_minutes),
      ("incident_sweep_interval_minutes", self.incident_sweep_interval_minutes),
      ("baseline_window", self.baseline_window as u64),
      ("baseline_min_samples", self.baseline_min_samples as u64),
      ("baseline_refresh_interval_minutes", self.baseline_refresh_interval_minutes),
    ];
    for (field, value) in positive {
      if value == 0 {
        return Err(MonitorError::validation(field, "must be greater than zero"));
      }
    }
    if self.baseline_min_samples > self.baseline_window {
      return Err(MonitorError::validation(
        "baseline_min_samples",
        "must not exceed baseline_window",
      ));
    }
    if !(self.degradation_threshold_percent > 0.0) {
      return Err(MonitorError::validation(
        "degradation_threshold_percent",
        "must be a positive number",
      ));
    }
    for threshold in &self.default_thresholds {
      threshold.validate()?;
    }
    Ok(())
  }

  pub fn alert_cooldown(&self) -> Duration {
    Duration::minutes(self.alert_cooldown_minutes as i64)
  }

  pub fn retention(&self) -> Duration {
    Duration::days(self.retention_days as i64)
  }

  pub fn incident_timeout(&self) -> Duration {
    Duration::minutes(self.incident_timeout_minutes as i64)
  }
}
