//! Error Monitor: error tracking, threshold alerting and incident escalation.
//!
//! Ingests error reports into bounded histories, evaluates per-type sliding-window
//! thresholds with alert cooldown, promotes qualifying errors into incidents that escalate
//! when left open, and computes statistics for the admin dashboard.
//!
//! Persistence, admin notification and analytics are injected; the crate has no network
//! protocol or CLI of its own.

pub mod alert;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod incident;
pub mod normalize;
pub mod perf;
pub mod service;
pub mod sinks;
pub mod snapshot;
pub mod stats;
pub mod types;

pub use config::Config;
pub use engine::Engine;
pub use error::MonitorError;
pub use service::ErrorMonitor;
pub use stats::ErrorStatistics;
pub use types::{
  ErrorIncident, ErrorReport, ErrorThreshold, Incident, IncidentStatus, Priority, Severity,
};
