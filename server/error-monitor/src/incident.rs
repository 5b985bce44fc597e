//! Incident state machine: an active set of open work plus a capped archive.
//!
//! ```text
//! Open ──► InProgress ──► Resolved | Closed   (archived)
//!   │          │
//!   └──────────┴─► Escalated (timeout sweep from Open only)
//! ```
//!
//! An incident lives in exactly one of the two collections.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::types::{ErrorIncident, Incident, IncidentStatus, Priority};

#[derive(Debug, Clone)]
pub struct IncidentBook {
  max_history: usize,
  active: HashMap<String, Incident>,
  /// Resolved/closed incidents, oldest first.
  archive: VecDeque<Incident>,
  seq: u64,
}

impl IncidentBook {
  pub fn new(max_history: usize) -> Self {
    Self {
      max_history,
      active: HashMap::new(),
      archive: VecDeque::new(),
      seq: 0,
    }
  }

  /// Open a new incident for `error`.
  pub fn create(
    &mut self,
    error: &ErrorIncident,
    priority: Priority,
    title: String,
    description: String,
    now: DateTime<Utc>,
  ) -> Incident {
    self.seq += 1;
    let incident = Incident {
      id: self.incident_id(&error.id, &now),
      title,
      description,
      priority,
      status: IncidentStatus::Open,
      error: error.clone(),
      created_at: now,
      updated_at: now,
      resolved_at: None,
    };
    tracing::info!(
      incident_id = %incident.id,
      priority = %priority,
      error_id = %error.id,
      "incident opened"
    );
    self.active.insert(incident.id.clone(), incident.clone());
    incident
  }

  /// Stable incident ID: hash of triggering error + creation time + sequence.
  fn incident_id(&self, error_id: &str, now: &DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(error_id.as_bytes());
    hasher.update(b"|");
    hasher.update(now.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(&self.seq.to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("inc-{}", &hex[..16])
  }

  /// Move an active incident to `status`.
  ///
  /// Terminal statuses archive the incident. Returns `None` (and changes nothing) when `id`
  /// is not in the active set, which includes already-archived incidents.
  pub fn update_status(
    &mut self,
    id: &str,
    status: IncidentStatus,
    now: DateTime<Utc>,
  ) -> Option<Incident> {
    if status.is_terminal() {
      let mut incident = match self.active.remove(id) {
        Some(incident) => incident,
        None => {
          tracing::debug!(incident_id = %id, status = %status, "status update for unknown incident ignored");
          return None;
        }
      };
      incident.status = status;
      incident.updated_at = now;
      incident.resolved_at = Some(now);
      tracing::info!(incident_id = %id, status = %status, "incident archived");
      self.archive(incident.clone());
      return Some(incident);
    }

    match self.active.get_mut(id) {
      Some(incident) => {
        incident.status = status;
        incident.updated_at = now;
        Some(incident.clone())
      }
      None => {
        tracing::debug!(incident_id = %id, status = %status, "status update for unknown incident ignored");
        None
      }
    }
  }

  fn archive(&mut self, incident: Incident) {
    while self.archive.len() >= self.max_history.max(1) {
      self.archive.pop_front();
    }
    self.archive.push_back(incident);
  }

  /// Escalate every Open incident created at least `timeout` ago. Returns the escalated ones.
  pub fn escalate_overdue(&mut self, timeout: Duration, now: DateTime<Utc>) -> Vec<Incident> {
    let mut escalated: Vec<Incident> = self
      .active
      .values_mut()
      .filter(|i| i.status == IncidentStatus::Open && now - i.created_at >= timeout)
      .map(|incident| {
        incident.status = IncidentStatus::Escalated;
        incident.updated_at = now;
        tracing::warn!(incident_id = %incident.id, priority = %incident.priority, "incident escalated");
        incident.clone()
      })
      .collect();
    escalated.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    escalated
  }

  /// Active incidents, oldest first.
  pub fn active(&self) -> Vec<Incident> {
    let mut incidents: Vec<_> = self.active.values().cloned().collect();
    incidents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    incidents
  }

  /// Archived incidents, most recently archived first.
  pub fn history(&self, limit: usize) -> Vec<Incident> {
    self.archive.iter().rev().take(limit).cloned().collect()
  }

  pub fn get(&self, id: &str) -> Option<Incident> {
    self
      .active
      .get(id)
      .or_else(|| self.archive.iter().find(|i| i.id == id))
      .cloned()
  }

  pub fn active_count(&self) -> usize {
    self.active.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::Severity;
  use chrono::TimeZone;

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
  }

  fn error() -> ErrorIncident {
    ErrorIncident {
      id: "err-1".into(),
      error_type: "payment_error".into(),
      error_message: "card declined".into(),
      error: String::new(),
      stack_trace: None,
      user_id: None,
      screen_name: None,
      user_action: None,
      metadata: Default::default(),
      severity: Severity::High,
      fatal: false,
      timestamp: t0(),
      environment: "test".into(),
      app_version: "1.0.0".into(),
    }
  }

  fn open(book: &mut IncidentBook, at: DateTime<Utc>) -> Incident {
    book.create(&error(), Priority::High, "title".into(), "desc".into(), at)
  }

  #[test]
  fn created_incident_is_open_and_active() {
    let mut book = IncidentBook::new(10);
    let incident = open(&mut book, t0());
    assert_eq!(incident.status, IncidentStatus::Open);
    assert!(incident.id.starts_with("inc-"));
    assert_eq!(incident.id.len(), 20);
    assert_eq!(book.active().len(), 1);
    assert!(book.history(10).is_empty());
  }

  #[test]
  fn ids_are_unique_for_same_error_and_time() {
    let mut book = IncidentBook::new(10);
    let a = open(&mut book, t0());
    let b = open(&mut book, t0());
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn non_terminal_update_stays_active() {
    let mut book = IncidentBook::new(10);
    let incident = open(&mut book, t0());
    let later = t0() + Duration::minutes(5);
    let updated = book
      .update_status(&incident.id, IncidentStatus::InProgress, later)
      .unwrap();
    assert_eq!(updated.status, IncidentStatus::InProgress);
    assert_eq!(updated.updated_at, later);
    assert_eq!(updated.resolved_at, None);
    assert_eq!(book.active_count(), 1);
  }

  #[test]
  fn resolving_twice_is_idempotent() {
    let mut book = IncidentBook::new(10);
    let incident = open(&mut book, t0());
    let at = t0() + Duration::minutes(10);
    assert!(book
      .update_status(&incident.id, IncidentStatus::Resolved, at)
      .is_some());
    assert!(book
      .update_status(&incident.id, IncidentStatus::Resolved, at + Duration::minutes(1))
      .is_none());
    assert_eq!(book.active_count(), 0);
    let history = book.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].resolved_at, Some(at));
    assert_eq!(book.get(&incident.id).unwrap().status, IncidentStatus::Resolved);
  }

  #[test]
  fn unknown_id_is_a_no_op() {
    let mut book = IncidentBook::new(10);
    open(&mut book, t0());
    assert!(book
      .update_status("inc-missing", IncidentStatus::Closed, t0())
      .is_none());
    assert_eq!(book.active_count(), 1);
    assert!(book.history(10).is_empty());
  }

  #[test]
  fn archive_is_capped() {
    let mut book = IncidentBook::new(2);
    for m in 0..3 {
      let incident = open(&mut book, t0() + Duration::minutes(m));
      book.update_status(&incident.id, IncidentStatus::Closed, t0() + Duration::minutes(m));
    }
    let history = book.history(10);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].created_at, t0() + Duration::minutes(2));
  }

  #[test]
  fn escalation_respects_timeout_and_is_idempotent() {
    let mut book = IncidentBook::new(10);
    let incident = open(&mut book, t0());
    let timeout = Duration::hours(2);

    let just_before = t0() + timeout - Duration::seconds(1);
    assert!(book.escalate_overdue(timeout, just_before).is_empty());

    let escalated = book.escalate_overdue(timeout, t0() + timeout);
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].id, incident.id);
    assert_eq!(escalated[0].status, IncidentStatus::Escalated);

    assert!(book
      .escalate_overdue(timeout, t0() + timeout + Duration::hours(1))
      .is_empty());
    assert_eq!(book.active()[0].status, IncidentStatus::Escalated);
  }

  #[test]
  fn in_progress_incidents_are_not_escalated() {
    let mut book = IncidentBook::new(10);
    let incident = open(&mut book, t0());
    book.update_status(&incident.id, IncidentStatus::InProgress, t0());
    assert!(book
      .escalate_overdue(Duration::hours(2), t0() + Duration::hours(5))
      .is_empty());
  }
}
