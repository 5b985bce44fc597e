//! Threshold registry and sliding-window alert evaluation with per-type cooldown.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::error::MonitorError;
use crate::history::HistoryStore;
use crate::types::{Alert, ErrorIncident, ErrorThreshold};

/// Per-type alerting rules. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct ThresholdRegistry {
  rules: HashMap<String, ErrorThreshold>,
}

impl ThresholdRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, threshold: ErrorThreshold) -> Result<(), MonitorError> {
    threshold.validate()?;
    self.rules.insert(threshold.error_type.clone(), threshold);
    Ok(())
  }

  pub fn remove(&mut self, error_type: &str) -> Option<ErrorThreshold> {
    self.rules.remove(error_type)
  }

  pub fn get(&self, error_type: &str) -> Option<&ErrorThreshold> {
    self.rules.get(error_type)
  }

  /// All rules, sorted by error type.
  pub fn all(&self) -> Vec<ErrorThreshold> {
    let mut rules: Vec<_> = self.rules.values().cloned().collect();
    rules.sort_by(|a, b| a.error_type.cmp(&b.error_type));
    rules
  }
}

/// Evaluates thresholds after each append and remembers the last alert per type.
#[derive(Debug, Clone)]
pub struct AlertEngine {
  cooldown: Duration,
  last_alert: HashMap<String, DateTime<Utc>>,
}

impl AlertEngine {
  pub fn new(cooldown: Duration) -> Self {
    Self {
      cooldown,
      last_alert: HashMap::new(),
    }
  }

  /// Check `error` (already appended to `history`) against its type's threshold.
  ///
  /// Returns the alert to deliver, or `None` when there is no rule, the window count is below
  /// the rule, or the type is still cooling down.
  pub fn evaluate(
    &mut self,
    error: &ErrorIncident,
    thresholds: &ThresholdRegistry,
    history: &HistoryStore,
    now: DateTime<Utc>,
  ) -> Option<Alert> {
    let threshold = thresholds.get(&error.error_type)?;
    let window_start = now - threshold.time_window();
    let count = history.count_since(&error.error_type, window_start);
    if count < threshold.max_occurrences as usize {
      return None;
    }

    if let Some(last) = self.last_alert.get(&error.error_type) {
      if now - *last <= self.cooldown {
        tracing::debug!(
          error_type = %error.error_type,
          occurrence_count = count,
          "alert suppressed by cooldown"
        );
        return None;
      }
    }

    self.last_alert.insert(error.error_type.clone(), now);
    tracing::warn!(
      error_type = %error.error_type,
      occurrence_count = count,
      threshold = threshold.max_occurrences,
      severity = %threshold.alert_severity,
      "error threshold exceeded"
    );

    Some(Alert {
      error_type: error.error_type.clone(),
      occurrence_count: count,
      threshold: threshold.max_occurrences,
      time_window_minutes: threshold.time_window_minutes,
      severity: threshold.alert_severity,
      error_id: error.id.clone(),
      fired_at: now,
    })
  }

  pub fn last_alert(&self, error_type: &str) -> Option<DateTime<Utc>> {
    self.last_alert.get(error_type).copied()
  }

  /// Cooldown map, sorted by type (for persistence).
  pub fn last_alert_times(&self) -> BTreeMap<String, DateTime<Utc>> {
    self.last_alert.iter().map(|(t, ts)| (t.clone(), *ts)).collect()
  }

  pub fn restore(&mut self, times: BTreeMap<String, DateTime<Utc>>) {
    self.last_alert = times.into_iter().collect();
  }

  pub fn clear(&mut self) {
    self.last_alert.clear();
  }
}
