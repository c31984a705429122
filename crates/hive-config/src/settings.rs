use std::path::PathBuf;
use std::time::Duration;

use hive_domain::PayloadKind;
use serde::Serialize;

/// Every tunable the orchestrator recognizes, fully resolved.
///
/// Resolution order: built-in default, then the YAML settings file, then
/// `HIVE_*` environment variables. See [`crate::load_settings`].
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Public listener: drone protocol + read-only endpoints.
    pub public_port: u16,
    /// Admin listener: full control, requires the admin key.
    pub admin_port: u16,
    /// Shared secret for the `X-Admin-Key` header. Generated when not set.
    pub admin_key: String,
    /// True when `admin_key` was generated rather than supplied.
    pub admin_key_generated: bool,
    /// Display name reported to drones at registration.
    pub orchestrator_name: String,

    /// Directory holding the state database.
    pub state_dir: PathBuf,
    /// Directory holding the orchestrator log file.
    pub log_dir: PathBuf,
    /// Cache root for payload content blobs.
    pub payload_dir: PathBuf,
    /// Cache root for release trees.
    pub release_dir: PathBuf,

    /// Heartbeat-stale reclaim threshold (minutes).
    pub reclaim_offline_minutes: u64,
    /// Lease reclaim threshold (seconds); only applies when the assignee is
    /// unresponsive to both heartbeat and probe.
    pub reclaim_lease_seconds: u64,
    /// Self-heal probe cadence (seconds). 0 disables the monitor.
    pub probe_interval_seconds: u64,
    /// Escalation guard: consecutive probe failures required.
    pub min_consecutive_failures: u32,
    /// Escalation guard: minimum failure window (seconds).
    pub min_failure_window_seconds: u64,
    /// Max packages held in `delegated` by one drone.
    pub max_prefetch_per_drone: u32,
    /// Circuit-breaker ceiling: build failures before grounding.
    pub max_failures: u32,
    /// Circuit-breaker cooldown (seconds).
    pub grounding_timeout_seconds: u64,
    /// Age bound on failure counting (seconds).
    pub failure_age_seconds: u64,

    /// Outbound SSH connect timeout (seconds).
    pub ssh_connect_timeout_seconds: u64,
    /// Outbound SSH/rsync operation timeout (seconds).
    pub ssh_op_timeout_seconds: u64,
    /// Per-request HTTP deadline (seconds); expiry returns 504.
    pub request_deadline_seconds: u64,
    /// Completed build history older than this is pruned (days).
    pub history_retention_days: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            public_port: 8100,
            admin_port: 8093,
            admin_key: String::new(),
            admin_key_generated: false,
            orchestrator_name: "hive".to_string(),
            state_dir: PathBuf::from("/var/lib/hive"),
            log_dir: PathBuf::from("/var/log/hive"),
            payload_dir: PathBuf::from("/var/cache/hive/payloads"),
            release_dir: PathBuf::from("/var/cache/hive/releases"),
            reclaim_offline_minutes: 15,
            reclaim_lease_seconds: 600,
            probe_interval_seconds: 30,
            min_consecutive_failures: 3,
            min_failure_window_seconds: 180,
            max_prefetch_per_drone: 2,
            max_failures: 8,
            grounding_timeout_seconds: 300,
            failure_age_seconds: 1800,
            ssh_connect_timeout_seconds: 10,
            ssh_op_timeout_seconds: 120,
            request_deadline_seconds: 30,
            history_retention_days: 30,
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("hive.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join("hive.log")
    }

    /// Remote destination for a deployed payload kind.
    pub fn payload_target(&self, kind: PayloadKind) -> String {
        kind.default_target().to_string()
    }

    pub fn reclaim_offline(&self) -> Duration {
        Duration::from_secs(self.reclaim_offline_minutes * 60)
    }

    pub fn reclaim_lease(&self) -> Duration {
        Duration::from_secs(self.reclaim_lease_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn min_failure_window(&self) -> Duration {
        Duration::from_secs(self.min_failure_window_seconds)
    }

    pub fn grounding_timeout(&self) -> Duration {
        Duration::from_secs(self.grounding_timeout_seconds)
    }

    pub fn failure_age(&self) -> Duration {
        Duration::from_secs(self.failure_age_seconds)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_seconds)
    }

    pub fn ssh_op_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_op_timeout_seconds)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_seconds)
    }
}
