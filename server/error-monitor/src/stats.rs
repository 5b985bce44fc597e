//! Read-side statistics over a history snapshot: windows, breakdowns, top offenders, trend.
//!
//! Everything here is a pure function of its inputs.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::types::{ErrorIncident, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
  Increasing,
  Decreasing,
  Stable,
}

/// Change between the last window and the one before it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
  pub current: usize,
  pub previous: usize,
  pub percent_change: f64,
  pub direction: TrendDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
  pub error_type: String,
  pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStatistics {
  pub total_errors: usize,
  pub errors_last_24h: usize,
  pub errors_last_7d: usize,
  pub errors_by_type: BTreeMap<String, usize>,
  /// Last 24 hours; severities with no records are absent.
  pub severity_breakdown: BTreeMap<Severity, usize>,
  pub fatal_errors_24h: usize,
  pub top_errors: Vec<TypeCount>,
  pub trend: Trend,
  pub active_incidents: usize,
  pub generated_at: DateTime<Utc>,
}

/// Compute the full statistics block for `errors` as of `now`.
pub fn compute(
  errors: &[ErrorIncident],
  now: DateTime<Utc>,
  top_limit: usize,
  active_incidents: usize,
) -> ErrorStatistics {
  let day_ago = now - Duration::hours(24);
  let errors_by_type = counts_by_type(errors);

  ErrorStatistics {
    total_errors: errors.len(),
    errors_last_24h: count_since(errors, day_ago),
    errors_last_7d: count_since(errors, now - Duration::days(7)),
    top_errors: top_types(&errors_by_type, top_limit),
    errors_by_type,
    severity_breakdown: severity_breakdown(errors, day_ago),
    fatal_errors_24h: errors
      .iter()
      .filter(|e| e.fatal && e.timestamp >= day_ago)
      .count(),
    trend: trend(errors, now, Duration::hours(24)),
    active_incidents,
    generated_at: now,
  }
}

pub fn count_since(errors: &[ErrorIncident], since: DateTime<Utc>) -> usize {
  errors.iter().filter(|e| e.timestamp >= since).count()
}

pub fn counts_by_type(errors: &[ErrorIncident]) -> BTreeMap<String, usize> {
  let mut counts = BTreeMap::new();
  for e in errors {
    *counts.entry(e.error_type.clone()).or_insert(0) += 1;
  }
  counts
}

pub fn severity_breakdown(
  errors: &[ErrorIncident],
  since: DateTime<Utc>,
) -> BTreeMap<Severity, usize> {
  let mut breakdown = BTreeMap::new();
  for e in errors.iter().filter(|e| e.timestamp >= since) {
    *breakdown.entry(e.severity).or_insert(0) += 1;
  }
  breakdown
}

/// Most frequent types, count descending, then type name ascending.
pub fn top_types(counts: &BTreeMap<String, usize>, limit: usize) -> Vec<TypeCount> {
  let mut ranked: Vec<TypeCount> = counts
    .iter()
    .map(|(t, &count)| TypeCount {
      error_type: t.clone(),
      count,
    })
    .collect();
  ranked.sort_by(|a, b| {
    b.count
      .cmp(&a.count)
      .then_with(|| a.error_type.cmp(&b.error_type))
  });
  ranked.truncate(limit);
  ranked
}

/// Compare `[now - window, now]` against `[now - 2*window, now - window)`.
pub fn trend(errors: &[ErrorIncident], now: DateTime<Utc>, window: Duration) -> Trend {
  let current_start = now - window;
  let previous_start = current_start - window;

  let current = errors
    .iter()
    .filter(|e| e.timestamp >= current_start && e.timestamp <= now)
    .count();
  let previous = errors
    .iter()
    .filter(|e| e.timestamp >= previous_start && e.timestamp < current_start)
    .count();

  let percent_change = if previous == 0 {
    if current > 0 {
      100.0
    } else {
      0.0
    }
  } else {
    (current as f64 - previous as f64) / previous as f64 * 100.0
  };

  let direction = if percent_change > 0.0 {
    TrendDirection::Increasing
  } else if percent_change < 0.0 {
    TrendDirection::Decreasing
  } else {
    TrendDirection::Stable
  };

  Trend {
    current,
    previous,
    percent_change: (percent_change * 100.0).round() / 100.0,
    direction,
  }
}
