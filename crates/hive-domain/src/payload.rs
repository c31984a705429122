use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::types::DroneId;

// ── Payload kinds ─────────────────────────────────────────────────────────────

/// The drone-side artifacts the orchestrator versions and deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    DroneBinary,
    InitScript,
    Config,
}

impl PayloadKind {
    /// Where this artifact lands on a drone unless the settings override it.
    pub fn default_target(&self) -> &'static str {
        match self {
            PayloadKind::DroneBinary => "/usr/local/bin/hive-drone",
            PayloadKind::InitScript => "/etc/init.d/hive-drone",
            PayloadKind::Config => "/etc/hive/drone.yml",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "drone_binary" => Ok(PayloadKind::DroneBinary),
            "init_script" => Ok(PayloadKind::InitScript),
            "config" => Ok(PayloadKind::Config),
            other => Err(DomainError::InvalidPayloadKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadKind::DroneBinary => write!(f, "drone_binary"),
            PayloadKind::InitScript => write!(f, "init_script"),
            PayloadKind::Config => write!(f, "config"),
        }
    }
}

// ── Registry rows ─────────────────────────────────────────────────────────────

/// A registered payload version. Content lives inline in the store for small
/// payloads, or in a blob file referenced by `content_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadVersion {
    pub kind: PayloadKind,
    pub version: String,
    /// SHA-256 of the payload bytes, lowercase hex.
    pub hash: String,
    pub size_bytes: u64,
    pub content_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Per drone × payload-kind deployment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DronePayload {
    pub drone: DroneId,
    pub kind: PayloadKind,
    pub version: String,
    pub hash: String,
    pub status: DeployOutcome,
    pub deployed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ── Deploy log ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployAction {
    Deploy,
    Verify,
    Rollback,
}

impl std::fmt::Display for DeployAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployAction::Deploy => write!(f, "deploy"),
            DeployAction::Verify => write!(f, "verify"),
            DeployAction::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Success,
    Failed,
    RolledBack,
}

impl std::fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployOutcome::Success => write!(f, "success"),
            DeployOutcome::Failed => write!(f, "failed"),
            DeployOutcome::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Append-only record of one deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployLogEntry {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub kind: PayloadKind,
    pub version: String,
    pub drone: DroneId,
    pub action: DeployAction,
    pub status: DeployOutcome,
    pub duration_s: f64,
    pub error: Option<String>,
}

// ── Releases ──────────────────────────────────────────────────────────────────

/// Lifecycle of a named package-set snapshot.
///
/// Transitions: Staging → Active → Archived → Deleted. At most one release is
/// Active at any time; promoting another archives the incumbent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    #[default]
    Staging,
    Active,
    Archived,
    Deleted,
}

impl ReleaseStatus {
    pub fn can_transition_to(&self, next: ReleaseStatus) -> bool {
        use ReleaseStatus::*;
        matches!(
            (self, next),
            (Staging, Active) | (Active, Archived) | (Archived, Active) | (Archived, Deleted) | (Staging, Deleted)
        )
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "staging" => Ok(ReleaseStatus::Staging),
            "active" => Ok(ReleaseStatus::Active),
            "archived" => Ok(ReleaseStatus::Archived),
            "deleted" => Ok(ReleaseStatus::Deleted),
            other => Err(DomainError::InvalidReleaseStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseStatus::Staging => write!(f, "staging"),
            ReleaseStatus::Active => write!(f, "active"),
            ReleaseStatus::Archived => write!(f, "archived"),
            ReleaseStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// A named, content-addressed set of produced binary packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub version: String,
    pub name: String,
    pub status: ReleaseStatus,
    pub package_count: u32,
    pub size_bytes: u64,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
