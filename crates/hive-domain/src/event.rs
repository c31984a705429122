use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::types::DroneId;

// ── Events ────────────────────────────────────────────────────────────────────

/// Classification of an orchestrator event. Serialized in kebab-case; the
/// `?type=` filter on the events endpoints matches these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Registered,
    Assigned,
    Completed,
    BuildFailed,
    Returned,
    Blocked,
    StaleCompletion,
    Reclaimed,
    Rebalanced,
    SessionClosed,
    QueueSubmitted,
    Control,
    Grounded,
    Ungrounded,
    Escalation,
    BareMetalProtected,
    AdminAlert,
    ProbeFailure,
    PayloadDeploy,
    Release,
    Error,
}

impl EventKind {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| DomainError::InvalidEventKind(s.to_string()))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde name so storage, wire and logs agree.
        match serde_json::to_value(self) {
            Ok(Value::String(s)) => write!(f, "{}", s),
            _ => write!(f, "unknown"),
        }
    }
}

/// Immutable record of something that happened. Feeds the in-memory ring for
/// dashboard tailing and the persistent history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub drone: Option<DroneId>,
    pub package: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            message: message.into(),
            details: Value::Null,
            drone: None,
            package: None,
        }
    }

    pub fn with_drone(mut self, drone: &DroneId) -> Self {
        self.drone = Some(drone.clone());
        self
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

// ── Protocol log ──────────────────────────────────────────────────────────────

/// One record per completed inbound HTTP exchange, synthesized after the
/// response is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub method: String,
    pub path: String,
    /// Symbolic name derived from (method, path prefix), e.g. `work-request`.
    pub tag: String,
    pub status: u16,
    pub latency_ms: f64,
    /// Drone hint parsed from the request body, when present.
    pub drone: Option<DroneId>,
    /// Package hint parsed from the request body, when present.
    pub package: Option<String>,
    pub request_body: String,
    pub response_body: String,
}

// ── Probe results ─────────────────────────────────────────────────────────────

/// Outcome of one out-of-band SSH liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub load_1m: Option<f64>,
    /// Root filesystem usage, 0–100.
    pub disk_percent: Option<u8>,
    /// Whether the expected worker process indicator was found.
    pub worker_running: Option<bool>,
    pub rtt_ms: f64,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn failure(error: impl Into<String>, rtt_ms: f64) -> Self {
        Self {
            ok: false,
            load_1m: None,
            disk_percent: None,
            worker_running: None,
            rtt_ms,
            error: Some(error.into()),
        }
    }

    /// Disk pressure is surfaced but never escalated on.
    pub fn disk_warning(&self) -> bool {
        self.disk_percent.map_or(false, |p| p >= 90)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_kebab_names() {
        for kind in [
            EventKind::StaleCompletion,
            EventKind::BareMetalProtected,
            EventKind::QueueSubmitted,
        ] {
            let name = kind.to_string();
            assert_eq!(EventKind::parse(&name).unwrap(), kind);
        }
        assert_eq!(EventKind::StaleCompletion.to_string(), "stale-completion");
        assert!(EventKind::parse("no-such-kind").is_err());
    }

    #[test]
    fn disk_warning_threshold() {
        let mut probe = ProbeResult::failure("x", 1.0);
        probe.ok = true;
        probe.error = None;
        assert!(!probe.disk_warning());
        probe.disk_percent = Some(89);
        assert!(!probe.disk_warning());
        probe.disk_percent = Some(90);
        assert!(probe.disk_warning());
    }
}
