//! Performance regression detection against a rolling per-metric baseline.
//!
//! Samples that breach the baseline are kept out of the window and parked in a side buffer.
//! A refresh folds the buffer into the window only when it holds at least `min_samples`
//! breaches, so a lone spike is discarded while a sustained level shift becomes the new
//! baseline.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::types::{ErrorReport, Severity};

/// Error type used for synthesized regressions.
pub const PERFORMANCE_ERROR_TYPE: &str = "performance_degradation";

#[derive(Debug, Clone, Default)]
struct MetricState {
  /// Accepted samples, oldest first.
  samples: VecDeque<f64>,
  /// Breaching samples since the last refresh, oldest first.
  breaches: VecDeque<f64>,
  baseline: Option<f64>,
}

impl MetricState {
  fn mean(&self) -> Option<f64> {
    if self.samples.is_empty() {
      return None;
    }
    Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
  }
}

#[derive(Debug, Clone)]
pub struct PerformanceMonitor {
  window: usize,
  min_samples: usize,
  threshold_percent: f64,
  metrics: HashMap<String, MetricState>,
}

impl PerformanceMonitor {
  pub fn new(window: usize, min_samples: usize, threshold_percent: f64) -> Self {
    Self {
      window: window.max(1),
      min_samples: min_samples.max(1),
      threshold_percent,
      metrics: HashMap::new(),
    }
  }

  /// Record one sample. Returns a synthetic error report when it breaches the baseline.
  pub fn record(&mut self, metric: &str, value: f64) -> Option<ErrorReport> {
    if !value.is_finite() {
      tracing::debug!(metric, "non-finite performance sample ignored");
      return None;
    }
    let state = self.metrics.entry(metric.to_string()).or_default();

    if let Some(baseline) = state.baseline {
      let limit = baseline * (1.0 + self.threshold_percent / 100.0);
      if baseline > 0.0 && value > limit {
        push_capped(&mut state.breaches, value, self.window);
        return Some(degradation_report(metric, value, baseline));
      }
    }

    push_capped(&mut state.samples, value, self.window);

    if state.baseline.is_none() && state.samples.len() >= self.min_samples {
      state.baseline = state.mean();
      tracing::debug!(metric, baseline = ?state.baseline, "performance baseline established");
    }
    None
  }

  /// Recompute every baseline from its accepted samples.
  ///
  /// Breaches parked since the last refresh join the window when there are at least
  /// `min_samples` of them, and are dropped otherwise.
  pub fn refresh_baselines(&mut self) -> usize {
    let mut refreshed = 0;
    for (metric, state) in &mut self.metrics {
      if state.breaches.len() >= self.min_samples {
        tracing::info!(
          metric = %metric,
          breaches = state.breaches.len(),
          "sustained performance shift absorbed into baseline"
        );
        for value in state.breaches.drain(..) {
          push_capped(&mut state.samples, value, self.window);
        }
      } else {
        state.breaches.clear();
      }
      if state.samples.len() >= self.min_samples {
        state.baseline = state.mean();
        refreshed += 1;
        tracing::debug!(metric = %metric, baseline = ?state.baseline, "performance baseline refreshed");
      }
    }
    refreshed
  }

  pub fn baseline(&self, metric: &str) -> Option<f64> {
    self.metrics.get(metric).and_then(|s| s.baseline)
  }

}

fn push_capped(list: &mut VecDeque<f64>, value: f64, cap: usize) {
  while list.len() >= cap {
    list.pop_front();
  }
  list.push_back(value);
}

fn degradation_report(metric: &str, value: f64, baseline: f64) -> ErrorReport {
  let degradation_percent = ((value - baseline) / baseline * 100.0 * 100.0).round() / 100.0;
  let severity = if value > baseline * 2.0 {
    Severity::High
  } else {
    Severity::Medium
  };
  ErrorReport::new(
    PERFORMANCE_ERROR_TYPE,
    format!("Performance degradation detected: {metric}"),
  )
  .with_error(format!(
    "{metric} = {value:.2} exceeds baseline {baseline:.2} by {degradation_percent}%"
  ))
  .with_severity(severity)
  .with_metadata("metric", metric)
  .with_metadata("value", Value::from(value))
  .with_metadata("baseline", Value::from(baseline))
  .with_metadata("degradation_percent", Value::from(degradation_percent))
}
