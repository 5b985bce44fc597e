//! Normalize inbound error reports into immutable ErrorIncident records.

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::types::*;

/// Error type used when the caller left it blank.
pub const UNKNOWN_ERROR_TYPE: &str = "unknown";

/// Build the canonical record for a report.
///
/// Never fails: ingestion must not throw, so degenerate input is coerced instead of rejected.
pub fn normalize(
  report: ErrorReport,
  id: String,
  timestamp: DateTime<Utc>,
  config: &Config,
) -> ErrorIncident {
  let error_type = match report.error_type.trim() {
    "" => UNKNOWN_ERROR_TYPE.to_string(),
    t => t.to_string(),
  };

  ErrorIncident {
    id,
    error_type,
    error_message: report.error_message.trim().to_string(),
    error: report.error,
    stack_trace: non_blank(report.stack_trace),
    user_id: non_blank(report.user_id),
    screen_name: non_blank(report.screen_name),
    user_action: non_blank(report.user_action),
    metadata: report.metadata,
    severity: report.severity,
    fatal: report.fatal,
    timestamp,
    environment: config.environment.clone(),
    app_version: config.app_version.clone(),
  }
}

/// Creation-ordered record id: epoch millis, then a per-engine sequence number.
pub fn error_id(timestamp: &DateTime<Utc>, seq: u64) -> String {
  format!("err-{:013}-{:010}", timestamp.timestamp_millis().max(0), seq)
}

fn non_blank(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap()
  }

  #[test]
  fn blank_type_becomes_unknown() {
    let record = normalize(
      ErrorReport::new("   ", "boom"),
      "err-1".into(),
      ts(),
      &Config::default(),
    );
    assert_eq!(record.error_type, UNKNOWN_ERROR_TYPE);
  }

  #[test]
  fn blank_optionals_are_dropped() {
    let mut report = ErrorReport::new("network_error", " timeout ").with_screen("Home");
    report.user_id = Some("  ".into());
    let record = normalize(report, "err-1".into(), ts(), &Config::default());
    assert_eq!(record.error_message, "timeout");
    assert_eq!(record.user_id, None);
    assert_eq!(record.screen_name.as_deref(), Some("Home"));
  }

  #[test]
  fn fatal_keeps_reported_severity_and_tags_come_from_config() {
    let config = Config {
      environment: "staging".into(),
      app_version: "2.4.1".into(),
      ..Config::default()
    };
    let report = ErrorReport::new("crash", "segfault")
      .with_severity(Severity::Low)
      .fatal();
    let record = normalize(report, "err-1".into(), ts(), &config);
    assert_eq!(record.severity, Severity::Low);
    assert!(record.fatal);
    assert_eq!(record.environment, "staging");
    assert_eq!(record.app_version, "2.4.1");
  }

  #[test]
  fn ids_sort_in_creation_order() {
    let a = error_id(&ts(), 9);
    let b = error_id(&ts(), 10);
    let c = error_id(&(ts() + chrono::Duration::milliseconds(1)), 11);
    assert!(a < b && b < c);
    assert!(a.starts_with("err-"));

    let d = error_id(&ts(), 999_999);
    let e = error_id(&ts(), 1_000_000);
    assert!(d < e);
  }
}
