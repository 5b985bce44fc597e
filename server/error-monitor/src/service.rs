//! `ErrorMonitor`: the service object application code holds.
//!
//! Wraps the synchronous [`Engine`] in one mutex and adds the asynchronous edges:
//! - persistence restore on `initialize`, coalesced background saves afterwards;
//! - an outbox task delivering admin notifications and analytics, best-effort;
//! - interval timers for retention, incident escalation and baseline refresh.
//!
//! The mutex is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration as StdDuration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::{Engine, Tracked};
use crate::error::MonitorError;
use crate::sinks::{AnalyticsSink, NotificationSink, PersistenceAdapter};
use crate::snapshot;
use crate::stats::ErrorStatistics;
use crate::types::*;

/// Side effects queued by ingestion and timers.
#[derive(Debug)]
enum Outbound {
  Notify(AdminNotification),
  Event {
    name: &'static str,
    parameters: BTreeMap<String, Value>,
  },
  RecordError(ErrorIncident),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
  Created,
  Running,
  Disposed,
}

pub struct ErrorMonitor {
  config: Config,
  engine: Arc<Mutex<Engine>>,
  clock: Arc<dyn Clock>,
  persistence: Arc<dyn PersistenceAdapter>,
  notifier: Arc<dyn NotificationSink>,
  analytics: Arc<dyn AnalyticsSink>,
  lifecycle: Mutex<Lifecycle>,
  outbox: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
  outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
  saves: Mutex<Option<mpsc::UnboundedSender<()>>>,
  saves_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
  shutdown: watch::Sender<bool>,
  timers: Mutex<Vec<JoinHandle<()>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Lock a std mutex, recovering from poisoning. Every engine mutation is a single call, so
/// the state behind a poisoned lock is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ErrorMonitor {
  pub fn new(
    config: Config,
    persistence: Arc<dyn PersistenceAdapter>,
    notifier: Arc<dyn NotificationSink>,
    analytics: Arc<dyn AnalyticsSink>,
  ) -> Self {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let (saves_tx, saves_rx) = mpsc::unbounded_channel();
    let (shutdown, _) = watch::channel(false);
    Self {
      engine: Arc::new(Mutex::new(Engine::new(config.clone()))),
      config,
      clock: Arc::new(SystemClock),
      persistence,
      notifier,
      analytics,
      lifecycle: Mutex::new(Lifecycle::Created),
      outbox: Mutex::new(Some(outbox_tx)),
      outbox_rx: Mutex::new(Some(outbox_rx)),
      saves: Mutex::new(Some(saves_tx)),
      saves_rx: Mutex::new(Some(saves_rx)),
      shutdown,
      timers: Mutex::new(Vec::new()),
      workers: Mutex::new(Vec::new()),
    }
  }

  /// Replace the wall clock (tests drive time through a `ManualClock`).
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  fn engine(&self) -> MutexGuard<'_, Engine> {
    lock(&self.engine)
  }

  // -------------------------------------------------------------------------
  // Lifecycle
  // -------------------------------------------------------------------------

  /// Validate config, restore persisted state and start background tasks.
  ///
  /// Must run inside a tokio runtime. State tracked before this call is replaced by the
  /// restored state.
  ///
  /// # Errors
  ///
  /// `MonitorError::Validation` for a bad config, `MonitorError::Init` when the persistence
  /// backend cannot be read or the monitor was already initialized.
  pub async fn initialize(self: &Arc<Self>) -> Result<(), MonitorError> {
    {
      let lifecycle = lock(&self.lifecycle);
      if *lifecycle != Lifecycle::Created {
        return Err(MonitorError::init(format!(
          "monitor cannot be initialized from state {:?}",
          *lifecycle
        )));
      }
    }
    self.config.validate()?;

    let blob = self
      .persistence
      .load()
      .await
      .map_err(|e| MonitorError::init(format!("persistence unavailable: {e}")))?;
    if let Some(blob) = blob {
      let restored = snapshot::decode(&blob);
      if restored.skipped > 0 {
        tracing::info!(skipped = restored.skipped, "dropped malformed persisted entries");
      }
      self.engine().restore(restored.state);
    }

    {
      let mut lifecycle = lock(&self.lifecycle);
      if *lifecycle != Lifecycle::Created {
        return Err(MonitorError::init("monitor initialized concurrently"));
      }
      *lifecycle = Lifecycle::Running;
    }

    self.start_workers();
    self.start_timers();
    tracing::info!(
      environment = %self.config.environment,
      app_version = %self.config.app_version,
      "error monitor initialized"
    );
    Ok(())
  }

  fn start_workers(&self) {
    let mut workers = lock(&self.workers);
    if let Some(rx) = lock(&self.outbox_rx).take() {
      workers.push(tokio::spawn(deliver_outbox(
        rx,
        Arc::clone(&self.notifier),
        Arc::clone(&self.analytics),
      )));
    }
    if let Some(rx) = lock(&self.saves_rx).take() {
      workers.push(tokio::spawn(write_snapshots(
        rx,
        Arc::clone(&self.engine),
        Arc::clone(&self.persistence),
      )));
    }
  }

  fn start_timers(self: &Arc<Self>) {
    let minutes = |m: u64| StdDuration::from_secs(m * 60);
    let mut timers = lock(&self.timers);
    timers.push(self.spawn_timer(
      "retention_sweep",
      minutes(self.config.retention_sweep_interval_minutes),
      |monitor| {
        monitor.run_retention_sweep();
      },
    ));
    timers.push(self.spawn_timer(
      "incident_timeout",
      minutes(self.config.incident_sweep_interval_minutes),
      |monitor| {
        monitor.run_incident_sweep();
      },
    ));
    timers.push(self.spawn_timer(
      "baseline_refresh",
      minutes(self.config.baseline_refresh_interval_minutes),
      |monitor| {
        monitor.run_baseline_refresh();
      },
    ));
  }

  /// Run `tick` every `period` until shutdown. The task holds only a weak handle.
  fn spawn_timer<F>(self: &Arc<Self>, name: &'static str, period: StdDuration, tick: F) -> JoinHandle<()>
  where
    F: Fn(&ErrorMonitor) + Send + 'static,
  {
    let monitor: Weak<Self> = Arc::downgrade(self);
    let mut shutdown = self.shutdown.subscribe();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval_at(Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = interval.tick() => {
            match monitor.upgrade() {
              Some(strong) => tick(&*strong),
              None => break,
            }
          }
          _ = shutdown.changed() => break,
        }
      }
      tracing::debug!(timer = name, "timer stopped");
    })
  }

  /// Stop timers, flush a final snapshot and drain the outbox. Safe to call twice.
  pub async fn dispose(&self) {
    {
      let mut lifecycle = lock(&self.lifecycle);
      if *lifecycle == Lifecycle::Disposed {
        return;
      }
      *lifecycle = Lifecycle::Disposed;
    }

    let _ = self.shutdown.send(true);
    let timers: Vec<_> = lock(&self.timers).drain(..).collect();
    for timer in timers {
      if let Err(e) = timer.await {
        tracing::warn!("timer task ended abnormally: {e}");
      }
    }

    self.request_save();
    lock(&self.outbox).take();
    lock(&self.saves).take();

    let workers: Vec<_> = lock(&self.workers).drain(..).collect();
    for worker in workers {
      if let Err(e) = worker.await {
        tracing::warn!("worker task ended abnormally: {e}");
      }
    }
    tracing::info!("error monitor disposed");
  }

  /// Persist the current state now, bypassing the background writer.
  ///
  /// # Errors
  ///
  /// Returns `MonitorError::Persistence` when the backend rejects the write.
  pub async fn save_now(&self) -> Result<(), MonitorError> {
    let blob = snapshot::encode(&self.engine().snapshot())?;
    self
      .persistence
      .save(blob)
      .await
      .map_err(|e| MonitorError::Persistence(e.to_string()))
  }

  // -------------------------------------------------------------------------
  // Ingestion
  // -------------------------------------------------------------------------

  /// Record an error. Never fails; delivery and persistence happen in the background.
  pub fn track_error(&self, report: ErrorReport) -> ErrorIncident {
    let now = self.clock.now();
    let tracked = self.engine().track(report, now);
    self.after_track(&tracked);
    tracked.error
  }

  /// Feed a performance sample. Returns the synthesized error when it is a regression.
  pub fn record_performance_metric(&self, metric: &str, value: f64) -> Option<ErrorIncident> {
    let now = self.clock.now();
    let tracked = self.engine().record_metric(metric, value, now)?;
    self.after_track(&tracked);
    Some(tracked.error)
  }

  fn after_track(&self, tracked: &Tracked) {
    let error = &tracked.error;
    let mut parameters = BTreeMap::new();
    parameters.insert("error_type".into(), Value::from(error.error_type.clone()));
    parameters.insert("severity".into(), Value::from(error.severity.as_str()));
    parameters.insert("fatal".into(), Value::from(error.fatal));
    if let Some(screen) = &error.screen_name {
      parameters.insert("screen_name".into(), Value::from(screen.clone()));
    }
    self.send(Outbound::Event {
      name: "error_tracked",
      parameters,
    });
    self.send(Outbound::RecordError(error.clone()));

    if let Some(alert) = &tracked.alert {
      self.send(Outbound::Notify(AdminNotification::for_alert(alert)));
      let mut parameters = BTreeMap::new();
      parameters.insert("error_type".into(), Value::from(alert.error_type.clone()));
      parameters.insert("occurrence_count".into(), Value::from(alert.occurrence_count));
      parameters.insert("severity".into(), Value::from(alert.severity.as_str()));
      self.send(Outbound::Event {
        name: "error_threshold_alert",
        parameters,
      });
    }
    if let Some(incident) = &tracked.incident {
      self.announce_incident(incident);
    }
    self.request_save();
  }

  fn announce_incident(&self, incident: &Incident) {
    if incident.priority.is_urgent() {
      self.send(Outbound::Notify(AdminNotification::for_new_incident(incident)));
    }
  }

  fn send(&self, message: Outbound) {
    match lock(&self.outbox).as_ref() {
      Some(tx) => {
        if tx.send(message).is_err() {
          tracing::debug!("outbox closed; side effect dropped");
        }
      }
      None => tracing::debug!("monitor disposed; side effect dropped"),
    }
  }

  fn request_save(&self) {
    if let Some(tx) = lock(&self.saves).as_ref() {
      let _ = tx.send(());
    }
  }

  // -------------------------------------------------------------------------
  // Thresholds
  // -------------------------------------------------------------------------

  /// Register or replace the rule for one error type.
  ///
  /// # Errors
  ///
  /// Returns `MonitorError::Validation` for a zero count, zero window or empty type.
  pub fn set_error_threshold(&self, threshold: ErrorThreshold) -> Result<(), MonitorError> {
    let error_type = threshold.error_type.clone();
    self.engine().set_threshold(threshold).map_err(|e| {
      tracing::warn!(error_type = %error_type, "threshold rejected: {e}");
      e
    })
  }

  pub fn remove_error_threshold(&self, error_type: &str) -> Option<ErrorThreshold> {
    self.engine().remove_threshold(error_type)
  }

  pub fn get_thresholds(&self) -> Vec<ErrorThreshold> {
    self.engine().thresholds()
  }

  // -------------------------------------------------------------------------
  // Reads
  // -------------------------------------------------------------------------

  pub fn get_error_statistics(&self) -> ErrorStatistics {
    let now = self.clock.now();
    self.engine().statistics(now)
  }

  pub fn get_recent_errors(&self, limit: usize, min_severity: Option<Severity>) -> Vec<ErrorIncident> {
    self.engine().recent_errors(limit, min_severity)
  }

  pub fn get_errors_by_type(&self, error_type: &str) -> Vec<ErrorIncident> {
    self.engine().errors_by_type(error_type)
  }

  pub fn get_active_incidents(&self) -> Vec<Incident> {
    self.engine().active_incidents()
  }

  pub fn get_incident_history(&self, limit: usize) -> Vec<Incident> {
    self.engine().incident_history(limit)
  }

  pub fn get_incident(&self, id: &str) -> Option<Incident> {
    self.engine().incident(id)
  }

  pub fn clear_error_history(&self) {
    self.engine().clear_history();
    self.request_save();
  }

  // -------------------------------------------------------------------------
  // Incidents
  // -------------------------------------------------------------------------

  pub fn create_incident(&self, error: &ErrorIncident, priority: Priority) -> Incident {
    let now = self.clock.now();
    let incident = self.engine().create_incident(error, priority, now);
    self.announce_incident(&incident);
    incident
  }

  /// Returns `None` for an unknown or already archived id; nothing changes in that case.
  pub fn update_incident_status(&self, id: &str, status: IncidentStatus) -> Option<Incident> {
    let now = self.clock.now();
    self.engine().update_incident_status(id, status, now)
  }

  // -------------------------------------------------------------------------
  // Periodic work (also driven by the timers)
  // -------------------------------------------------------------------------

  pub fn run_incident_sweep(&self) -> Vec<Incident> {
    let now = self.clock.now();
    let escalated = self.engine().escalate_overdue(now);
    for incident in &escalated {
      self.send(Outbound::Notify(AdminNotification::for_escalation(incident)));
    }
    escalated
  }

  pub fn run_retention_sweep(&self) -> usize {
    let now = self.clock.now();
    let removed = self.engine().retention_sweep(now);
    if removed > 0 {
      self.request_save();
    }
    removed
  }

  pub fn run_baseline_refresh(&self) -> usize {
    self.engine().refresh_baselines()
  }
}

// ---------------------------------------------------------------------------
// Background workers
// ---------------------------------------------------------------------------

async fn deliver_outbox(
  mut rx: mpsc::UnboundedReceiver<Outbound>,
  notifier: Arc<dyn NotificationSink>,
  analytics: Arc<dyn AnalyticsSink>,
) {
  while let Some(message) = rx.recv().await {
    match message {
      Outbound::Notify(notification) => {
        if let Err(e) = notifier.notify_admins(&notification).await {
          tracing::warn!(title = %notification.title, "admin notification failed: {e}");
        }
      }
      Outbound::Event { name, parameters } => {
        if let Err(e) = analytics.log_event(name, &parameters).await {
          tracing::warn!(event = name, "analytics event failed: {e}");
        }
      }
      Outbound::RecordError(error) => {
        let description = if error.error.is_empty() {
          &error.error_message
        } else {
          &error.error
        };
        if let Err(e) = analytics
          .record_error(
            description,
            error.stack_trace.as_deref(),
            &error.metadata,
            error.fatal,
          )
          .await
        {
          tracing::warn!(error_id = %error.id, "error reporting failed: {e}");
        }
      }
    }
  }
}

/// Save the latest snapshot whenever asked, collapsing queued requests into one write.
async fn write_snapshots(
  mut rx: mpsc::UnboundedReceiver<()>,
  engine: Arc<Mutex<Engine>>,
  persistence: Arc<dyn PersistenceAdapter>,
) {
  while rx.recv().await.is_some() {
    while rx.try_recv().is_ok() {}

    let encoded = snapshot::encode(&lock(&engine).snapshot());
    let blob = match encoded {
      Ok(blob) => blob,
      Err(e) => {
        tracing::warn!("failed to serialize error state: {e}");
        continue;
      }
    };
    if let Err(e) = persistence.save(blob).await {
      tracing::warn!("failed to persist error state: {e}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::sinks::{InMemoryPersistence, NoopSink, SinkError};
  use async_trait::async_trait;
  use chrono::{TimeZone, Utc};

  #[derive(Default)]
  struct RecordingNotifier {
    sent: Mutex<Vec<AdminNotification>>,
  }

  #[async_trait]
  impl NotificationSink for RecordingNotifier {
    async fn notify_admins(&self, notification: &AdminNotification) -> Result<(), SinkError> {
      lock(&self.sent).push(notification.clone());
      Ok(())
    }
  }

  struct FailingNotifier;

  #[async_trait]
  impl NotificationSink for FailingNotifier {
    async fn notify_admins(&self, _notification: &AdminNotification) -> Result<(), SinkError> {
      Err(SinkError::Unavailable("push gateway".into()))
    }
  }

  struct OfflinePersistence;

  #[async_trait]
  impl PersistenceAdapter for OfflinePersistence {
    async fn load(&self) -> Result<Option<String>, SinkError> {
      Err(SinkError::Unavailable("storage offline".into()))
    }
    async fn save(&self, _blob: String) -> Result<(), SinkError> {
      Err(SinkError::Unavailable("storage offline".into()))
    }
  }

  fn config() -> Config {
    Config {
      default_thresholds: Vec::new(),
      ..Config::default()
    }
  }

  fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
    ))
  }

  #[tokio::test]
  async fn initialize_fails_when_persistence_is_offline() {
    let monitor = Arc::new(ErrorMonitor::new(
      config(),
      Arc::new(OfflinePersistence),
      Arc::new(NoopSink),
      Arc::new(NoopSink),
    ));
    let err = monitor.initialize().await.unwrap_err();
    assert!(matches!(err, MonitorError::Init(_)));
    assert!(err.to_string().contains("storage offline"));
  }

  #[tokio::test]
  async fn second_initialize_is_rejected() {
    let monitor = Arc::new(ErrorMonitor::new(
      config(),
      Arc::new(InMemoryPersistence::new()),
      Arc::new(NoopSink),
      Arc::new(NoopSink),
    ));
    monitor.initialize().await.unwrap();
    assert!(monitor.initialize().await.is_err());
    monitor.dispose().await;
    monitor.dispose().await;
  }

  #[tokio::test]
  async fn failing_notifier_does_not_affect_ingestion() {
    let monitor = Arc::new(ErrorMonitor::new(
      config(),
      Arc::new(InMemoryPersistence::new()),
      Arc::new(FailingNotifier),
      Arc::new(NoopSink),
    ));
    monitor.initialize().await.unwrap();
    monitor
      .set_error_threshold(ErrorThreshold::new("crash", 1, 5, Severity::Critical))
      .unwrap();
    let error = monitor.track_error(ErrorReport::new("crash", "boom"));
    assert_eq!(error.error_type, "crash");
    assert_eq!(monitor.get_active_incidents().len(), 1);
    monitor.dispose().await;
  }

  #[tokio::test]
  async fn alert_and_incident_notifications_are_delivered() {
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = Arc::new(
      ErrorMonitor::new(
        config(),
        Arc::new(InMemoryPersistence::new()),
        notifier.clone(),
        Arc::new(NoopSink),
      )
      .with_clock(clock()),
    );
    monitor.initialize().await.unwrap();
    monitor
      .set_error_threshold(ErrorThreshold::new("payment_error", 2, 10, Severity::High))
      .unwrap();
    monitor.track_error(ErrorReport::new("payment_error", "declined"));
    monitor.track_error(ErrorReport::new("payment_error", "declined"));
    monitor.dispose().await;

    let sent = lock(&notifier.sent);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].title, "Error threshold exceeded: payment_error");
    assert_eq!(sent[0].data["occurrence_count"], Value::from(2));
    assert_eq!(sent[1].title, "New high priority incident");
  }

  #[tokio::test]
  async fn incident_sweep_notifies_escalations() {
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = clock();
    let monitor = Arc::new(
      ErrorMonitor::new(
        config(),
        Arc::new(InMemoryPersistence::new()),
        notifier.clone(),
        Arc::new(NoopSink),
      )
      .with_clock(clock.clone()),
    );
    monitor.initialize().await.unwrap();
    let error = monitor.track_error(ErrorReport::new("db_error", "locked"));
    let incident = monitor.create_incident(&error, Priority::Low);

    clock.advance(chrono::Duration::minutes(90));
    assert!(monitor.run_incident_sweep().is_empty());
    clock.advance(chrono::Duration::minutes(30));
    let escalated = monitor.run_incident_sweep();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].id, incident.id);
    monitor.dispose().await;

    let sent = lock(&notifier.sent);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].title.starts_with("Incident escalated"));
  }

  #[tokio::test]
  async fn dispose_flushes_latest_state() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let monitor = Arc::new(ErrorMonitor::new(
      config(),
      persistence.clone(),
      Arc::new(NoopSink),
      Arc::new(NoopSink),
    ));
    monitor.initialize().await.unwrap();
    for _ in 0..3 {
      monitor.track_error(ErrorReport::new("network_error", "timeout"));
    }
    monitor.dispose().await;

    let blob = persistence.blob().unwrap();
    let restored = snapshot::decode(&blob);
    assert_eq!(restored.state.recent_errors.len(), 3);
    assert!(persistence.save_count() >= 1);

    // Nothing is queued or saved after dispose.
    let saves = persistence.save_count();
    monitor.track_error(ErrorReport::new("network_error", "timeout"));
    tokio::task::yield_now().await;
    assert_eq!(persistence.save_count(), saves);
  }
}
