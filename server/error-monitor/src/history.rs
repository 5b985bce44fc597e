//! Bounded error history: a global recent list plus one capped list per error type.
//!
//! Both collections evict oldest-first when full. Eviction is silent.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::types::{ErrorIncident, Severity};

#[derive(Debug, Clone)]
pub struct HistoryStore {
  max_per_type: usize,
  max_recent: usize,
  /// Oldest first.
  recent: VecDeque<ErrorIncident>,
  /// Oldest first, per error type.
  by_type: HashMap<String, VecDeque<ErrorIncident>>,
}

impl HistoryStore {
  pub fn new(max_per_type: usize, max_recent: usize) -> Self {
    Self {
      max_per_type,
      max_recent,
      recent: VecDeque::with_capacity(max_recent.min(1024)),
      by_type: HashMap::new(),
    }
  }

  /// Append to both the global and the per-type list.
  pub fn append(&mut self, error: ErrorIncident) {
    let bucket = self.by_type.entry(error.error_type.clone()).or_default();
    push_capped(bucket, error.clone(), self.max_per_type);
    push_capped(&mut self.recent, error, self.max_recent);
  }

  /// Most-recent-first, optionally keeping only `severity >= min_severity`.
  pub fn recent(&self, limit: usize, min_severity: Option<Severity>) -> Vec<ErrorIncident> {
    self
      .recent
      .iter()
      .rev()
      .filter(|e| min_severity.map_or(true, |min| e.severity >= min))
      .take(limit)
      .cloned()
      .collect()
  }

  /// Insertion-ordered records for one type.
  pub fn by_type(&self, error_type: &str) -> Vec<ErrorIncident> {
    self
      .by_type
      .get(error_type)
      .map(|bucket| bucket.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Records of `error_type` with `timestamp >= since`.
  pub fn count_since(&self, error_type: &str, since: DateTime<Utc>) -> usize {
    self
      .by_type
      .get(error_type)
      .map_or(0, |bucket| bucket.iter().filter(|e| e.timestamp >= since).count())
  }

  /// Drop every record older than `cutoff`. Returns how many left the global list.
  pub fn retention_sweep(&mut self, cutoff: DateTime<Utc>) -> usize {
    let before = self.recent.len();
    self.recent.retain(|e| e.timestamp >= cutoff);
    for bucket in self.by_type.values_mut() {
      bucket.retain(|e| e.timestamp >= cutoff);
    }
    self.by_type.retain(|_, bucket| !bucket.is_empty());
    before - self.recent.len()
  }

  /// Owned copy of the global list, oldest first.
  pub fn snapshot(&self) -> Vec<ErrorIncident> {
    self.recent.iter().cloned().collect()
  }

  /// Owned copy of every per-type list, keyed by type.
  pub fn type_snapshot(&self) -> BTreeMap<String, Vec<ErrorIncident>> {
    self
      .by_type
      .iter()
      .map(|(t, bucket)| (t.clone(), bucket.iter().cloned().collect()))
      .collect()
  }

  /// Every retained record across all per-type lists, oldest first.
  ///
  /// Unlike `snapshot` this is not bounded by the global cap.
  pub fn all_records(&self) -> Vec<ErrorIncident> {
    let mut records: Vec<ErrorIncident> = self.by_type.values().flatten().cloned().collect();
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    records
  }

  /// Replace the contents with restored lists, re-applying the caps.
  pub fn restore(
    &mut self,
    recent: Vec<ErrorIncident>,
    by_type: BTreeMap<String, Vec<ErrorIncident>>,
  ) {
    self.clear();
    for error in recent {
      push_capped(&mut self.recent, error, self.max_recent);
    }
    for (error_type, records) in by_type {
      let bucket = self.by_type.entry(error_type).or_default();
      for error in records {
        push_capped(bucket, error, self.max_per_type);
      }
    }
    self.by_type.retain(|_, bucket| !bucket.is_empty());
  }

  pub fn clear(&mut self) {
    self.recent.clear();
    self.by_type.clear();
  }

  pub fn len(&self) -> usize {
    self.recent.len()
  }

  pub fn is_empty(&self) -> bool {
    self.recent.is_empty()
  }
}

fn push_capped<T>(list: &mut VecDeque<T>, item: T, cap: usize) {
  while list.len() >= cap.max(1) {
    list.pop_front();
  }
  list.push_back(item);
}
