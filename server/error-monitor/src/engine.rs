//! Core engine: owns all monitor state and applies every mutation synchronously.
//!
//! Time is always passed in, never read, so the engine is deterministic under test. The async
//! service wraps it in a mutex and supplies the clock.

use chrono::{DateTime, Utc};

use crate::alert::{AlertEngine, ThresholdRegistry};
use crate::config::Config;
use crate::error::MonitorError;
use crate::history::HistoryStore;
use crate::incident::IncidentBook;
use crate::normalize;
use crate::perf::PerformanceMonitor;
use crate::snapshot::PersistedState;
use crate::stats::{self, ErrorStatistics};
use crate::types::*;

/// Outcome of ingesting one report.
#[derive(Debug, Clone)]
pub struct Tracked {
  pub error: ErrorIncident,
  pub alert: Option<Alert>,
  /// Incident opened because the alert reached the auto-incident severity.
  pub incident: Option<Incident>,
}

pub struct Engine {
  config: Config,
  history: HistoryStore,
  thresholds: ThresholdRegistry,
  alerts: AlertEngine,
  incidents: IncidentBook,
  perf: PerformanceMonitor,
  seq: u64,
}

impl Engine {
  pub fn new(config: Config) -> Self {
    let mut thresholds = ThresholdRegistry::new();
    for threshold in &config.default_thresholds {
      if let Err(e) = thresholds.set(threshold.clone()) {
        tracing::warn!(error_type = %threshold.error_type, "default threshold ignored: {e}");
      }
    }

    Self {
      history: HistoryStore::new(config.max_error_history, config.max_recent_errors),
      thresholds,
      alerts: AlertEngine::new(config.alert_cooldown()),
      incidents: IncidentBook::new(config.max_incident_history),
      perf: PerformanceMonitor::new(
        config.baseline_window,
        config.baseline_min_samples,
        config.degradation_threshold_percent,
      ),
      seq: 0,
      config,
    }
  }

  pub fn with_defaults() -> Self {
    Self::new(Config::default())
  }

  /// Ingest a single report: record it, evaluate its threshold, maybe open an incident.
  pub fn track(&mut self, report: ErrorReport, now: DateTime<Utc>) -> Tracked {
    self.seq += 1;
    let id = normalize::error_id(&now, self.seq);
    let error = normalize::normalize(report, id, now, &self.config);

    self.history.append(error.clone());
    tracing::debug!(
      error_id = %error.id,
      error_type = %error.error_type,
      severity = %error.severity,
      fatal = error.fatal,
      "error tracked"
    );

    let alert = self
      .alerts
      .evaluate(&error, &self.thresholds, &self.history, now);

    let incident = match &alert {
      Some(a) if a.severity >= self.config.auto_incident_severity => Some(self.incidents.create(
        &error,
        Priority::from(a.severity),
        format!("{} threshold exceeded", a.error_type),
        format!(
          "{} occurrences of {} within {} minutes (threshold {}). Latest: {}",
          a.occurrence_count, a.error_type, a.time_window_minutes, a.threshold, error.error_message
        ),
        now,
      )),
      _ => None,
    };

    Tracked {
      error,
      alert,
      incident,
    }
  }

  // -------------------------------------------------------------------------
  // Thresholds
  // -------------------------------------------------------------------------

  pub fn set_threshold(&mut self, threshold: ErrorThreshold) -> Result<(), MonitorError> {
    self.thresholds.set(threshold)
  }

  pub fn remove_threshold(&mut self, error_type: &str) -> Option<ErrorThreshold> {
    self.thresholds.remove(error_type)
  }

  pub fn threshold(&self, error_type: &str) -> Option<ErrorThreshold> {
    self.thresholds.get(error_type).cloned()
  }

  pub fn thresholds(&self) -> Vec<ErrorThreshold> {
    self.thresholds.all()
  }

  pub fn last_alert(&self, error_type: &str) -> Option<DateTime<Utc>> {
    self.alerts.last_alert(error_type)
  }

  // -------------------------------------------------------------------------
  // History reads
  // -------------------------------------------------------------------------

  pub fn recent_errors(&self, limit: usize, min_severity: Option<Severity>) -> Vec<ErrorIncident> {
    self.history.recent(limit, min_severity)
  }

  pub fn errors_by_type(&self, error_type: &str) -> Vec<ErrorIncident> {
    self.history.by_type(error_type)
  }

  pub fn statistics(&self, now: DateTime<Utc>) -> ErrorStatistics {
    stats::compute(
      &self.history.all_records(),
      now,
      self.config.top_errors_limit,
      self.incidents.active_count(),
    )
  }

  /// Drop history and cooldowns. Thresholds and incidents are kept.
  pub fn clear_history(&mut self) {
    self.history.clear();
    self.alerts.clear();
  }

  // -------------------------------------------------------------------------
  // Incidents
  // -------------------------------------------------------------------------

  /// Manually promote an error into an incident.
  pub fn create_incident(
    &mut self,
    error: &ErrorIncident,
    priority: Priority,
    now: DateTime<Utc>,
  ) -> Incident {
    let description = if error.error.is_empty() {
      error.error_message.clone()
    } else {
      error.error.clone()
    };
    self.incidents.create(
      error,
      priority,
      format!("{}: {}", error.error_type, error.error_message),
      description,
      now,
    )
  }

  pub fn update_incident_status(
    &mut self,
    id: &str,
    status: IncidentStatus,
    now: DateTime<Utc>,
  ) -> Option<Incident> {
    self.incidents.update_status(id, status, now)
  }

  pub fn active_incidents(&self) -> Vec<Incident> {
    self.incidents.active()
  }

  pub fn incident_history(&self, limit: usize) -> Vec<Incident> {
    self.incidents.history(limit)
  }

  pub fn incident(&self, id: &str) -> Option<Incident> {
    self.incidents.get(id)
  }

  // -------------------------------------------------------------------------
  // Periodic work
  // -------------------------------------------------------------------------

  /// Escalate Open incidents past the configured timeout.
  pub fn escalate_overdue(&mut self, now: DateTime<Utc>) -> Vec<Incident> {
    self
      .incidents
      .escalate_overdue(self.config.incident_timeout(), now)
  }

  /// Drop records older than the retention window. Returns how many were removed.
  pub fn retention_sweep(&mut self, now: DateTime<Utc>) -> usize {
    let removed = self.history.retention_sweep(now - self.config.retention());
    if removed > 0 {
      tracing::info!(removed, remaining = self.history.len(), "retention sweep");
    }
    removed
  }

  pub fn refresh_baselines(&mut self) -> usize {
    self.perf.refresh_baselines()
  }

  /// Feed a performance sample; a regression is tracked like any other error.
  pub fn record_metric(&mut self, metric: &str, value: f64, now: DateTime<Utc>) -> Option<Tracked> {
    let report = self.perf.record(metric, value)?;
    Some(self.track(report, now))
  }

  pub fn baseline(&self, metric: &str) -> Option<f64> {
    self.perf.baseline(metric)
  }

  // -------------------------------------------------------------------------
  // Persistence
  // -------------------------------------------------------------------------

  pub fn snapshot(&self) -> PersistedState {
    PersistedState {
      recent_errors: self.history.snapshot(),
      last_alert_times: self.alerts.last_alert_times(),
      error_history: self.history.type_snapshot(),
    }
  }

  pub fn restore(&mut self, state: PersistedState) {
    tracing::info!(
      errors = state.recent_errors.len(),
      cooldowns = state.last_alert_times.len(),
      "restoring persisted error state"
    );
    self.history.restore(state.recent_errors, state.error_history);
    self.alerts.restore(state.last_alert_times);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
  }

  fn engine() -> Engine {
    Engine::new(Config {
      default_thresholds: Vec::new(),
      ..Config::default()
    })
  }

  fn network(at: DateTime<Utc>, engine: &mut Engine) -> Tracked {
    engine.track(
      ErrorReport::new("network_error", "request timed out").with_severity(Severity::High),
      at,
    )
  }

  #[test]
  fn default_thresholds_are_installed() {
    let engine = Engine::with_defaults();
    assert_eq!(engine.thresholds().len(), 4);
    assert_eq!(engine.threshold("payment_error").unwrap().max_occurrences, 3);
  }

  #[test]
  fn network_error_scenario() {
    let mut engine = engine();
    engine
      .set_threshold(ErrorThreshold::new("network_error", 3, 5, Severity::High))
      .unwrap();

    let mut alerts = Vec::new();
    for s in [0, 20, 40] {
      alerts.extend(network(t0() + Duration::seconds(s), &mut engine).alert);
    }
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].occurrence_count, 3);

    for s in [50, 55] {
      alerts.extend(network(t0() + Duration::seconds(s), &mut engine).alert);
    }
    assert_eq!(alerts.len(), 1);

    let later = t0() + Duration::minutes(16);
    alerts.extend(network(later, &mut engine).alert);
    assert_eq!(alerts.len(), 1);
    alerts.extend(network(later + Duration::seconds(10), &mut engine).alert);
    alerts.extend(network(later + Duration::seconds(20), &mut engine).alert);
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[1].occurrence_count, 3);
  }

  #[test]
  fn high_alert_opens_incident() {
    let mut engine = engine();
    engine
      .set_threshold(ErrorThreshold::new("payment_error", 1, 5, Severity::Critical))
      .unwrap();
    let tracked = engine.track(ErrorReport::new("payment_error", "declined"), t0());
    let incident = tracked.incident.unwrap();
    assert_eq!(incident.priority, Priority::Critical);
    assert_eq!(incident.error.id, tracked.error.id);
    assert_eq!(engine.active_incidents().len(), 1);
  }

  #[test]
  fn low_alert_does_not_open_incident() {
    let mut engine = engine();
    engine
      .set_threshold(ErrorThreshold::new("cache_miss", 1, 5, Severity::Low))
      .unwrap();
    let tracked = engine.track(ErrorReport::new("cache_miss", "miss"), t0());
    assert!(tracked.alert.is_some());
    assert!(tracked.incident.is_none());
  }

  #[test]
  fn manual_incident_lifecycle() {
    let mut engine = engine();
    let error = engine
      .track(ErrorReport::new("db_error", "locked").with_error("SqliteError: locked"), t0())
      .error;
    let incident = engine.create_incident(&error, Priority::Medium, t0());
    assert_eq!(incident.title, "db_error: locked");
    assert_eq!(incident.description, "SqliteError: locked");

    assert!(engine
      .escalate_overdue(t0() + Duration::minutes(119))
      .is_empty());
    assert_eq!(engine.escalate_overdue(t0() + Duration::hours(2)).len(), 1);

    let resolved = engine
      .update_incident_status(&incident.id, IncidentStatus::Resolved, t0() + Duration::hours(3))
      .unwrap();
    assert_eq!(resolved.resolved_at, Some(t0() + Duration::hours(3)));
    assert!(engine.active_incidents().is_empty());
    assert_eq!(engine.incident_history(10).len(), 1);
    assert_eq!(engine.incident(&incident.id).unwrap().status, IncidentStatus::Resolved);
  }

  #[test]
  fn ids_are_creation_ordered() {
    let mut engine = engine();
    let a = network(t0(), &mut engine).error.id;
    let b = network(t0(), &mut engine).error.id;
    let c = network(t0() + Duration::seconds(1), &mut engine).error.id;
    assert!(a < b && b < c);
  }

  #[test]
  fn retention_sweep_uses_configured_window() {
    let mut engine = engine();
    network(t0(), &mut engine);
    network(t0() + Duration::days(3), &mut engine);
    assert_eq!(engine.retention_sweep(t0() + Duration::days(8)), 1);
    assert_eq!(engine.recent_errors(10, None).len(), 1);
  }

  #[test]
  fn metric_regression_is_tracked_as_error() {
    let mut engine = Engine::with_defaults();
    for _ in 0..5 {
      assert!(engine.record_metric("api_latency_ms", 200.0, t0()).is_none());
    }
    let tracked = engine.record_metric("api_latency_ms", 900.0, t0()).unwrap();
    assert_eq!(tracked.error.error_type, "performance_degradation");
    assert_eq!(tracked.error.severity, Severity::High);
    assert_eq!(engine.errors_by_type("performance_degradation").len(), 1);
    assert_eq!(engine.baseline("api_latency_ms"), Some(200.0));
  }

  #[test]
  fn statistics_see_past_the_recent_cap() {
    let mut engine = engine();
    for s in 0..200 {
      network(t0() + Duration::seconds(s), &mut engine);
    }
    let now = t0() + Duration::hours(30);
    for s in 0..100 {
      network(now - Duration::seconds(100 - s), &mut engine);
    }
    assert_eq!(engine.recent_errors(usize::MAX, None).len(), 100);

    let stats = engine.statistics(now);
    assert_eq!(stats.total_errors, 300);
    assert_eq!(stats.errors_last_7d, 300);
    assert_eq!(stats.errors_by_type["network_error"], 300);
    assert_eq!(
      stats.errors_by_type["network_error"],
      engine.errors_by_type("network_error").len()
    );
    assert_eq!(stats.trend.current, 100);
    assert_eq!(stats.trend.previous, 200);
    assert_eq!(stats.trend.percent_change, -50.0);
    assert_eq!(stats.trend.direction, crate::stats::TrendDirection::Decreasing);
  }

  #[test]
  fn snapshot_restore_round_trip() {
    let mut engine = engine();
    engine
      .set_threshold(ErrorThreshold::new("network_error", 1, 5, Severity::Medium))
      .unwrap();
    for s in 0..4 {
      network(t0() + Duration::seconds(s), &mut engine);
    }
    engine.track(ErrorReport::new("auth_error", "expired"), t0());

    let mut restored = self::engine();
    restored.restore(engine.snapshot());
    assert_eq!(restored.errors_by_type("network_error").len(), 4);
    assert_eq!(restored.errors_by_type("auth_error").len(), 1);
    assert_eq!(restored.last_alert("network_error"), Some(t0()));
    assert_eq!(
      restored.statistics(t0()).total_errors,
      engine.statistics(t0()).total_errors
    );
  }

  #[test]
  fn clear_history_keeps_thresholds() {
    let mut engine = Engine::with_defaults();
    network(t0(), &mut engine);
    engine.clear_history();
    assert!(engine.recent_errors(10, None).is_empty());
    assert_eq!(engine.thresholds().len(), 4);
  }
}
