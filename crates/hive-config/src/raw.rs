use std::path::PathBuf;

use serde::Deserialize;

/// Raw YAML representation of the settings file. Every field optional;
/// absent fields fall back to defaults, then env overrides apply on top.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSettings {
    pub public_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub admin_key: Option<String>,
    pub orchestrator_name: Option<String>,

    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub payload_dir: Option<PathBuf>,
    pub release_dir: Option<PathBuf>,

    pub reclaim_offline_minutes: Option<u64>,
    pub reclaim_lease_seconds: Option<u64>,
    pub probe_interval_seconds: Option<u64>,
    pub min_consecutive_failures: Option<u32>,
    pub min_failure_window_seconds: Option<u64>,
    pub max_prefetch_per_drone: Option<u32>,
    pub max_failures: Option<u32>,
    pub grounding_timeout_seconds: Option<u64>,
    pub failure_age_seconds: Option<u64>,

    pub ssh_connect_timeout_seconds: Option<u64>,
    pub ssh_op_timeout_seconds: Option<u64>,
    pub request_deadline_seconds: Option<u64>,
    pub history_retention_days: Option<u64>,
}
