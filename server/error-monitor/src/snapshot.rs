//! Persisted state blob: encode, and lenient decode that skips malformed entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::MonitorError;
use crate::types::ErrorIncident;

/// Key the blob is stored under in the persistence backend.
pub const STATE_KEY: &str = "error_monitor_state";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
  /// Oldest first.
  pub recent_errors: Vec<ErrorIncident>,
  pub last_alert_times: BTreeMap<String, DateTime<Utc>>,
  pub error_history: BTreeMap<String, Vec<ErrorIncident>>,
}

/// What a decode kept and what it had to drop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Restored {
  pub state: PersistedState,
  pub skipped: usize,
}

pub fn encode(state: &PersistedState) -> Result<String, MonitorError> {
  Ok(serde_json::to_string(state)?)
}

/// Decode a blob, keeping every entry that parses on its own.
///
/// A blob that is not a JSON object restores nothing and counts as one skipped entry.
pub fn decode(blob: &str) -> Restored {
  let root = match serde_json::from_str::<Value>(blob) {
    Ok(Value::Object(map)) => map,
    Ok(_) | Err(_) => {
      tracing::warn!("persisted error state is not a JSON object; starting empty");
      return Restored {
        skipped: 1,
        ..Restored::default()
      };
    }
  };

  let mut skipped = 0;
  let recent_errors = decode_records(root.get("recentErrors"), &mut skipped);

  let mut last_alert_times = BTreeMap::new();
  if let Some(Value::Object(times)) = root.get("lastAlertTimes") {
    for (error_type, raw) in times {
      match serde_json::from_value::<DateTime<Utc>>(raw.clone()) {
        Ok(ts) => {
          last_alert_times.insert(error_type.clone(), ts);
        }
        Err(e) => {
          tracing::warn!(error_type = %error_type, "skipping malformed alert time: {e}");
          skipped += 1;
        }
      }
    }
  }

  let mut error_history = BTreeMap::new();
  if let Some(Value::Object(buckets)) = root.get("errorHistory") {
    for (error_type, raw) in buckets {
      let records = decode_records(Some(raw), &mut skipped);
      if !records.is_empty() {
        error_history.insert(error_type.clone(), records);
      }
    }
  }

  // Older blobs carry no per-type lists; rebuild them from the recent list.
  if !root.contains_key("errorHistory") {
    for e in &recent_errors {
      error_history
        .entry(e.error_type.clone())
        .or_insert_with(Vec::new)
        .push(e.clone());
    }
  }

  if skipped > 0 {
    tracing::warn!(skipped, "persisted error state restored partially");
  }

  Restored {
    state: PersistedState {
      recent_errors,
      last_alert_times,
      error_history,
    },
    skipped,
  }
}

fn decode_records(raw: Option<&Value>, skipped: &mut usize) -> Vec<ErrorIncident> {
  let Some(Value::Array(items)) = raw else {
    return Vec::new();
  };
  items
    .iter()
    .filter_map(|item| match serde_json::from_value::<ErrorIncident>(item.clone()) {
      Ok(record) => Some(record),
      Err(e) => {
        tracing::warn!("skipping malformed error record: {e}");
        *skipped += 1;
        None
      }
    })
    .collect()
}
