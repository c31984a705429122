use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Opaque, stable drone identity derived from the worker's machine identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DroneId(pub String);

impl DroneId {
    pub fn new(s: impl Into<String>) -> Self {
        DroneId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DroneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Wall-clock helpers ────────────────────────────────────────────────────────

/// Convert a [`DateTime<Utc>`] to float seconds since the epoch, the wire and
/// storage representation used throughout.
pub fn utc_to_epoch(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

/// Inverse of [`utc_to_epoch`]. Sub-millisecond precision is discarded.
pub fn epoch_to_utc(secs: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt((secs * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// What kind of machine a drone runs on. Admin-assigned; gates recovery
/// actions that would be destructive on physical hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DroneKind {
    Container,
    Vm,
    BareMetal,
    #[default]
    Unknown,
}

impl DroneKind {
    /// Whether the self-healer may ever reboot this machine.
    /// Bare-metal and unknown hosts are never rebooted.
    pub fn reboot_allowed(&self) -> bool {
        matches!(self, DroneKind::Container | DroneKind::Vm)
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "container" => Ok(DroneKind::Container),
            "vm" => Ok(DroneKind::Vm),
            "bare-metal" | "baremetal" => Ok(DroneKind::BareMetal),
            "unknown" => Ok(DroneKind::Unknown),
            other => Err(DomainError::InvalidDroneKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for DroneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DroneKind::Container => write!(f, "container"),
            DroneKind::Vm => write!(f, "vm"),
            DroneKind::BareMetal => write!(f, "bare-metal"),
            DroneKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Self-declared worker role from the register call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DroneRole {
    #[default]
    Drone,
    Sweeper,
}

impl std::fmt::Display for DroneRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DroneRole::Drone => write!(f, "drone"),
            DroneRole::Sweeper => write!(f, "sweeper"),
        }
    }
}

// ── Drone ─────────────────────────────────────────────────────────────────────

/// Hardware and software facts a drone reports about itself at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub cores: u32,
    pub ram_gb: f64,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub auto_reboot: bool,
    #[serde(default)]
    pub portage_timestamp: Option<String>,
}

/// Point-in-time load figures sent with every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub load_1m: f64,
}

/// A registered build worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drone {
    pub id: DroneId,
    /// Unique human name.
    pub name: String,
    pub ip: String,
    pub role: DroneRole,
    /// Admin-assigned machine kind; `unknown` until set.
    pub kind: DroneKind,
    pub capabilities: Capabilities,
    pub metrics: Metrics,
    pub paused: bool,
    pub current_task: Option<String>,
    pub version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_ping_sent: Option<DateTime<Utc>>,
    pub last_ping_received: Option<DateTime<Utc>>,
    pub last_rtt_ms: Option<f64>,
}

impl Drone {
    /// A drone is online when its last heartbeat is within `threshold`.
    pub fn is_online(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.last_seen <= threshold
    }
}

/// What a drone sends on `POST /api/v1/register`. Applied create-or-update;
/// admin-owned fields (kind, pause flag) are never touched by registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: DroneId,
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub role: DroneRole,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub metrics: Metrics,
    pub current_task: Option<String>,
    pub version: Option<String>,
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Lifecycle of a work item.
///
/// Transitions:
///   Needed → Delegated (assignment)
///   Delegated → Received (success report from the assignee)
///   Delegated → Needed (reclaim / returned / rebalance)
///   Delegated → Failed | Needed (failure report)
///   Needed | Failed → Blocked (failed on ≥2 distinct drones)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Needed,
    Delegated,
    Received,
    Blocked,
    Failed,
}

impl QueueStatus {
    /// Terminal items never transition again and close their session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Received | QueueStatus::Blocked | QueueStatus::Failed
        )
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "needed" => Ok(QueueStatus::Needed),
            "delegated" => Ok(QueueStatus::Delegated),
            "received" => Ok(QueueStatus::Received),
            "blocked" => Ok(QueueStatus::Blocked),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(DomainError::InvalidQueueStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Needed => write!(f, "needed"),
            QueueStatus::Delegated => write!(f, "delegated"),
            QueueStatus::Received => write!(f, "received"),
            QueueStatus::Blocked => write!(f, "blocked"),
            QueueStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of work: a package atom to compile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub package: String,
    pub status: QueueStatus,
    pub assigned_to: Option<DroneId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Aborted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// A named batch of queue items submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

// ── Completions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Failed,
    Returned,
}

impl CompletionStatus {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "success" => Ok(CompletionStatus::Success),
            "failed" => Ok(CompletionStatus::Failed),
            "returned" => Ok(CompletionStatus::Returned),
            other => Err(DomainError::InvalidCompletionStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionStatus::Success => write!(f, "success"),
            CompletionStatus::Failed => write!(f, "failed"),
            CompletionStatus::Returned => write!(f, "returned"),
        }
    }
}

/// A drone's report that it finished (or gave back) a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub drone: DroneId,
    pub package: String,
    pub status: CompletionStatus,
    pub duration_s: f64,
    pub error: Option<String>,
}

/// A completed build attempt, kept forever in the build history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub package: String,
    pub drone: DroneId,
    pub status: CompletionStatus,
    pub duration_s: f64,
    pub error: Option<String>,
    pub session_id: Option<Uuid>,
}

// ── Scheduler results ─────────────────────────────────────────────────────────

/// Why a work request was turned away without touching the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownDrone,
    Paused,
    Grounded,
    Offline,
    QueuePaused,
    PrefetchCap,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownDrone => write!(f, "unknown drone"),
            RejectReason::Paused => write!(f, "drone paused"),
            RejectReason::Grounded => write!(f, "drone grounded"),
            RejectReason::Offline => write!(f, "drone offline"),
            RejectReason::QueuePaused => write!(f, "queue paused"),
            RejectReason::PrefetchCap => write!(f, "prefetch cap reached"),
        }
    }
}

/// Outcome of a work request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssignResult {
    Assigned(QueueItem),
    Empty,
    Rejected(RejectReason),
}

/// Outcome of a completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionResult {
    Accepted,
    /// Reporter is not the current assignee. Dropped, logged, 200 to the drone.
    Stale { assigned_to: Option<DroneId> },
    AlreadyTerminal,
    UnknownPackage,
}

// ── Health ────────────────────────────────────────────────────────────────────

/// Per-drone failure bookkeeping and circuit-breaker state. One row per drone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub drone: DroneId,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub reboot_flag: bool,
    pub grounded_until: Option<DateTime<Utc>>,
    pub upload_failures: u32,
    /// Position on the recovery ladder, 0..=4.
    pub escalation_level: u8,
    pub last_escalation: Option<DateTime<Utc>>,
    pub escalation_attempts: u32,
}

impl HealthRecord {
    pub fn new(drone: DroneId) -> Self {
        Self {
            drone,
            failures: 0,
            last_failure: None,
            reboot_flag: false,
            grounded_until: None,
            upload_failures: 0,
            escalation_level: 0,
            last_escalation: None,
            escalation_attempts: 0,
        }
    }

    /// Grounded drones receive no new assignments until the cooldown passes.
    pub fn is_grounded(&self, now: DateTime<Utc>) -> bool {
        self.grounded_until.map_or(false, |until| until > now)
    }
}

// ── Control actions ───────────────────────────────────────────────────────────

/// Admin `POST /api/v1/control` verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Unblock,
    Unground,
    Reset,
    Rebalance,
    ClearFailures,
    RetryFailures,
}

impl ControlAction {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pause" => Ok(ControlAction::Pause),
            "resume" => Ok(ControlAction::Resume),
            "unblock" => Ok(ControlAction::Unblock),
            "unground" => Ok(ControlAction::Unground),
            "reset" => Ok(ControlAction::Reset),
            "rebalance" => Ok(ControlAction::Rebalance),
            "clear_failures" => Ok(ControlAction::ClearFailures),
            "retry_failures" => Ok(ControlAction::RetryFailures),
            other => Err(DomainError::InvalidControlAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Unblock => "unblock",
            ControlAction::Unground => "unground",
            ControlAction::Reset => "reset",
            ControlAction::Rebalance => "rebalance",
            ControlAction::ClearFailures => "clear_failures",
            ControlAction::RetryFailures => "retry_failures",
        };
        write!(f, "{}", s)
    }
}

// ── Admin-owned drone config ──────────────────────────────────────────────────

/// Operator-set per-drone configuration, distinct from what the drone reports
/// about itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DroneConfig {
    pub name: String,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_key_path: Option<String>,
    pub ssh_password: Option<String>,
    pub core_limit: Option<u32>,
    pub job_count: Option<u32>,
    pub mem_cap_gb: Option<f64>,
    pub auto_reboot: bool,
    pub protected: bool,
    pub max_failures: Option<u32>,
    pub binhost_target: Option<String>,
    pub display_name: Option<String>,
    pub control_tag: Option<String>,
    pub locked: bool,
    pub notes: Option<String>,
}

impl DroneConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
